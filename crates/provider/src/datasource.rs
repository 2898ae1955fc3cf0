use flux_install_api::{
    ConfigValidationError, InstallConfig, InstallError, LogLevel, RenderedInstall,
};
use flux_install_manifest::{ContentSource, render_install};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Attribute names of the `flux_install` data source.
pub const ATTRIBUTES: [&str; 10] = [
    "target_path",
    "namespace",
    "cluster_domain",
    "network_policy",
    "version",
    "log_level",
    "watch_all_namespaces",
    "registry",
    "components",
    "image_pull_secret",
];

/// State the host stores for one read: every input echoed with defaults resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstallState {
    pub id: String,
    pub target_path: String,
    pub namespace: String,
    pub cluster_domain: String,
    pub network_policy: bool,
    pub version: String,
    pub log_level: LogLevel,
    pub watch_all_namespaces: bool,
    pub registry: String,
    pub components: Vec<String>,
    pub image_pull_secret: Option<String>,
    pub path: String,
    pub content: String,
}

impl InstallState {
    pub fn new(cfg: &InstallConfig, rendered: RenderedInstall) -> Self {
        Self {
            id: rendered.identity,
            target_path: cfg.target_path().to_string(),
            namespace: cfg.namespace().to_string(),
            cluster_domain: cfg.cluster_domain().to_string(),
            network_policy: cfg.network_policy(),
            version: cfg.version().to_string(),
            log_level: cfg.log_level(),
            watch_all_namespaces: cfg.watch_all_namespaces(),
            registry: cfg.registry().to_string(),
            components: cfg.components().to_vec(),
            image_pull_secret: cfg.image_pull_secret().map(str::to_string),
            path: rendered.path,
            content: rendered.content,
        }
    }
}

fn string_attr(
    attrs: &Map<String, Value>,
    name: &str,
) -> Result<Option<String>, ConfigValidationError> {
    match attrs.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(ConfigValidationError::InvalidType {
            attribute: name.to_string(),
            expected: "string",
        }),
    }
}

/// Booleans also arrive as `"true"`/`"false"` strings after host-side conversion.
fn bool_attr(attrs: &Map<String, Value>, name: &str) -> Result<Option<bool>, ConfigValidationError> {
    match attrs.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) if s == "true" => Ok(Some(true)),
        Some(Value::String(s)) if s == "false" => Ok(Some(false)),
        Some(_) => Err(ConfigValidationError::InvalidType {
            attribute: name.to_string(),
            expected: "bool",
        }),
    }
}

fn list_attr(
    attrs: &Map<String, Value>,
    name: &str,
) -> Result<Option<Vec<String>>, ConfigValidationError> {
    let invalid = || ConfigValidationError::InvalidType {
        attribute: name.to_string(),
        expected: "list of string",
    };
    match attrs.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(invalid()),
    }
}

/// Builds a validated config from host-supplied attributes. Null means unset.
pub fn decode_attributes(attrs: &Map<String, Value>) -> Result<InstallConfig, ConfigValidationError> {
    if let Some(unknown) = attrs.keys().find(|k| !ATTRIBUTES.contains(&k.as_str())) {
        return Err(ConfigValidationError::UnsupportedArgument {
            attribute: unknown.clone(),
        });
    }

    let mut builder = InstallConfig::builder();
    if let Some(v) = string_attr(attrs, "target_path")? {
        builder = builder.target_path(v);
    }
    if let Some(v) = string_attr(attrs, "namespace")? {
        builder = builder.namespace(v);
    }
    if let Some(v) = string_attr(attrs, "cluster_domain")? {
        builder = builder.cluster_domain(v);
    }
    if let Some(v) = bool_attr(attrs, "network_policy")? {
        builder = builder.network_policy(v);
    }
    if let Some(v) = string_attr(attrs, "version")? {
        builder = builder.version(v);
    }
    if let Some(v) = string_attr(attrs, "log_level")? {
        builder = builder.log_level(v.parse()?);
    }
    if let Some(v) = bool_attr(attrs, "watch_all_namespaces")? {
        builder = builder.watch_all_namespaces(v);
    }
    if let Some(v) = string_attr(attrs, "registry")? {
        builder = builder.registry(v);
    }
    if let Some(v) = list_attr(attrs, "components")? {
        builder = builder.components(v);
    }
    if let Some(v) = string_attr(attrs, "image_pull_secret")? {
        builder = builder.image_pull_secret(v);
    }
    builder.build()
}

/// The `flux_install` data source. Each read is independent; the content
/// source is the only shared state.
pub struct InstallDataSource<S> {
    source: S,
}

impl<S: ContentSource> InstallDataSource<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub async fn read(&self, attrs: &Map<String, Value>) -> Result<InstallState, InstallError> {
        let cfg = decode_attributes(attrs)?;
        debug!(target_path = cfg.target_path(), version = cfg.version(), "reading flux_install");
        let rendered = render_install(&self.source, &cfg).await?;
        Ok(InstallState::new(&cfg, rendered))
    }
}

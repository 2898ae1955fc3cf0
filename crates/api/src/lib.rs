pub mod toolkit;

use flux_install_common::install_path;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_NAMESPACE: &str = "flux-system";
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_VERSION: &str = "latest";
pub const DEFAULT_REGISTRY: &str = "ghcr.io/fluxcd";
pub const DEFAULT_NETWORK_POLICY: bool = true;
pub const DEFAULT_WATCH_ALL_NAMESPACES: bool = true;
pub const LATEST_VERSION: &str = "latest";

pub const SOURCE_CONTROLLER: &str = "source-controller";
pub const KUSTOMIZE_CONTROLLER: &str = "kustomize-controller";
pub const HELM_CONTROLLER: &str = "helm-controller";
pub const NOTIFICATION_CONTROLLER: &str = "notification-controller";
pub const IMAGE_REFLECTOR_CONTROLLER: &str = "image-reflector-controller";
pub const IMAGE_AUTOMATION_CONTROLLER: &str = "image-automation-controller";

pub const DEFAULT_COMPONENTS: [&str; 4] = [
    SOURCE_CONTROLLER,
    KUSTOMIZE_CONTROLLER,
    HELM_CONTROLLER,
    NOTIFICATION_CONTROLLER,
];

pub const KNOWN_COMPONENTS: [&str; 6] = [
    SOURCE_CONTROLLER,
    KUSTOMIZE_CONTROLLER,
    HELM_CONTROLLER,
    NOTIFICATION_CONTROLLER,
    IMAGE_REFLECTOR_CONTROLLER,
    IMAGE_AUTOMATION_CONTROLLER,
];

/// Errors in the declarative configuration itself. Never retryable.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ConfigValidationError {
    #[snafu(display(
        "The argument \"{}\" is required, but no definition was found.",
        attribute
    ))]
    MissingRequired { attribute: String },
    #[snafu(display("expected \"{}\" to not be an empty string", attribute))]
    EmptyValue { attribute: String },
    #[snafu(display(
        "Attribute \"{}\" requires 1 item minimum, but config has only 0 declared.",
        attribute
    ))]
    EmptyList { attribute: String },
    #[snafu(display(
        "expected {} to be one of [{}], got {}",
        attribute,
        allowed.join(" "),
        value
    ))]
    NotInSet {
        attribute: String,
        value: String,
        allowed: Vec<String>,
    },
    #[snafu(display(
        "Inappropriate value for attribute \"{}\": {} required.",
        attribute,
        expected
    ))]
    InvalidType {
        attribute: String,
        expected: &'static str,
    },
    #[snafu(display("An argument named \"{}\" is not expected here.", attribute))]
    UnsupportedArgument { attribute: String },
}

impl ConfigValidationError {
    pub fn attribute(&self) -> &str {
        match self {
            ConfigValidationError::MissingRequired { attribute }
            | ConfigValidationError::EmptyValue { attribute }
            | ConfigValidationError::EmptyList { attribute }
            | ConfigValidationError::NotInSet { attribute, .. }
            | ConfigValidationError::InvalidType { attribute, .. }
            | ConfigValidationError::UnsupportedArgument { attribute } => attribute,
        }
    }
}

/// Errors raised while fetching the versioned release bundle.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ContentResolutionError {
    #[snafu(display(
        "Flux version {} not found in {} (available: {})",
        version,
        location,
        available.join(", ")
    ))]
    UnknownVersion {
        version: String,
        location: String,
        available: Vec<String>,
    },
    #[snafu(display("release catalog {} has no stable release to resolve 'latest'", location))]
    NoStableRelease { location: String },
    #[snafu(display("Flux {} does not ship component {}", version, component))]
    ComponentUnavailable { version: String, component: String },
    #[snafu(display("release catalog {} is unavailable: {}", location, source))]
    Unavailable {
        location: String,
        source: std::io::Error,
    },
    #[snafu(display("release catalog {} is malformed: {}", location, source))]
    Malformed {
        location: String,
        source: serde_yaml::Error,
    },
}

impl ContentResolutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ContentResolutionError::Unavailable { .. })
    }
}

/// Errors inside rendering. These point at a defective release bundle, not at caller input.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RenderError {
    #[snafu(display(
        "Flux {} component {} references unknown custom resource kind {}",
        version,
        component,
        kind
    ))]
    UnknownCustomResource {
        version: String,
        component: String,
        kind: String,
    },
    #[snafu(display("failed to serialize {} {}: {}", kind, name, source))]
    SerializeObject {
        kind: String,
        name: String,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Snafu)]
pub enum InstallError {
    #[snafu(context(false), display("{source}"))]
    Validation { source: ConfigValidationError },
    #[snafu(context(false), display("{source}"))]
    Resolution { source: ContentResolutionError },
    #[snafu(context(false), display("{source}"))]
    Render { source: RenderError },
}

impl InstallError {
    pub fn is_retryable(&self) -> bool {
        match self {
            InstallError::Resolution { source } => source.is_retryable(),
            InstallError::Validation { .. } | InstallError::Render { .. } => false,
        }
    }

    pub fn attribute(&self) -> Option<&str> {
        match self {
            InstallError::Validation { source } => Some(source.attribute()),
            InstallError::Resolution {
                source: ContentResolutionError::UnknownVersion { .. },
            } => Some("version"),
            InstallError::Resolution {
                source: ContentResolutionError::ComponentUnavailable { .. },
            } => Some("components"),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 3] = [LogLevel::Info, LogLevel::Debug, LogLevel::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| ConfigValidationError::NotInSet {
                attribute: "log_level".to_string(),
                value: s.to_string(),
                allowed: LogLevel::ALL
                    .iter()
                    .map(|level| level.as_str().to_string())
                    .collect(),
            })
    }
}

/// Validated install configuration. Only obtainable through [`InstallConfigBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallConfig {
    target_path: String,
    namespace: String,
    cluster_domain: String,
    network_policy: bool,
    version: String,
    log_level: LogLevel,
    watch_all_namespaces: bool,
    registry: String,
    components: Vec<String>,
    image_pull_secret: Option<String>,
}

impl InstallConfig {
    pub fn builder() -> InstallConfigBuilder {
        InstallConfigBuilder::default()
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cluster_domain(&self) -> &str {
        &self.cluster_domain
    }

    pub fn network_policy(&self) -> bool {
        self.network_policy
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn watch_all_namespaces(&self) -> bool {
        self.watch_all_namespaces
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn image_pull_secret(&self) -> Option<&str> {
        self.image_pull_secret.as_deref()
    }

    pub fn path(&self) -> String {
        install_path(&self.target_path, &self.namespace)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InstallConfigBuilder {
    target_path: Option<String>,
    namespace: Option<String>,
    cluster_domain: Option<String>,
    network_policy: Option<bool>,
    version: Option<String>,
    log_level: Option<LogLevel>,
    watch_all_namespaces: Option<bool>,
    registry: Option<String>,
    components: Option<Vec<String>>,
    image_pull_secret: Option<String>,
}

impl InstallConfigBuilder {
    pub fn target_path(mut self, value: impl Into<String>) -> Self {
        self.target_path = Some(value.into());
        self
    }

    pub fn namespace(mut self, value: impl Into<String>) -> Self {
        self.namespace = Some(value.into());
        self
    }

    pub fn cluster_domain(mut self, value: impl Into<String>) -> Self {
        self.cluster_domain = Some(value.into());
        self
    }

    pub fn network_policy(mut self, value: bool) -> Self {
        self.network_policy = Some(value);
        self
    }

    pub fn version(mut self, value: impl Into<String>) -> Self {
        self.version = Some(value.into());
        self
    }

    pub fn log_level(mut self, value: LogLevel) -> Self {
        self.log_level = Some(value);
        self
    }

    pub fn watch_all_namespaces(mut self, value: bool) -> Self {
        self.watch_all_namespaces = Some(value);
        self
    }

    pub fn registry(mut self, value: impl Into<String>) -> Self {
        self.registry = Some(value.into());
        self
    }

    pub fn components<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn image_pull_secret(mut self, value: impl Into<String>) -> Self {
        self.image_pull_secret = Some(value.into());
        self
    }

    pub fn build(self) -> Result<InstallConfig, ConfigValidationError> {
        let target_path = self
            .target_path
            .ok_or_else(|| ConfigValidationError::MissingRequired {
                attribute: "target_path".to_string(),
            })?;
        if target_path.is_empty() {
            return Err(ConfigValidationError::EmptyValue {
                attribute: "target_path".to_string(),
            });
        }

        let components = match self.components {
            Some(components) => validate_components(components)?,
            None => DEFAULT_COMPONENTS.iter().map(|c| c.to_string()).collect(),
        };

        Ok(InstallConfig {
            target_path,
            namespace: self
                .namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            cluster_domain: self
                .cluster_domain
                .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string()),
            network_policy: self.network_policy.unwrap_or(DEFAULT_NETWORK_POLICY),
            version: self.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            log_level: self.log_level.unwrap_or_default(),
            watch_all_namespaces: self
                .watch_all_namespaces
                .unwrap_or(DEFAULT_WATCH_ALL_NAMESPACES),
            registry: self.registry.unwrap_or_else(|| DEFAULT_REGISTRY.to_string()),
            components,
            image_pull_secret: self.image_pull_secret.filter(|s| !s.is_empty()),
        })
    }
}

fn validate_components(components: Vec<String>) -> Result<Vec<String>, ConfigValidationError> {
    if components.is_empty() {
        return Err(ConfigValidationError::EmptyList {
            attribute: "components".to_string(),
        });
    }
    let mut out: Vec<String> = Vec::with_capacity(components.len());
    for component in components {
        if !KNOWN_COMPONENTS.contains(&component.as_str()) {
            return Err(ConfigValidationError::NotInSet {
                attribute: "components".to_string(),
                value: component,
                allowed: KNOWN_COMPONENTS.iter().map(|c| c.to_string()).collect(),
            });
        }
        if !out.contains(&component) {
            out.push(component);
        }
    }
    Ok(out)
}

/// Output of one render. Byte-identical for identical config and release bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RenderedInstall {
    pub content: String,
    pub path: String,
    pub identity: String,
    pub version: String,
}

/// One Flux release as served by a content source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseBundle {
    pub version: String,
    pub components: Vec<ComponentRelease>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRelease {
    pub name: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crds: Vec<String>,
}

impl ReleaseBundle {
    pub fn component(&self, name: &str) -> Option<&ComponentRelease> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Requested components in release declaration order.
    pub fn select(
        &self,
        requested: &[String],
    ) -> Result<Vec<&ComponentRelease>, ContentResolutionError> {
        if let Some(missing) = requested.iter().find(|name| self.component(name).is_none()) {
            return Err(ContentResolutionError::ComponentUnavailable {
                version: self.version.clone(),
                component: missing.clone(),
            });
        }
        Ok(self
            .components
            .iter()
            .filter(|c| requested.contains(&c.name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_target_path_is_required_argument_error() {
        let err = InstallConfig::builder().build().unwrap_err();

        assert_eq!(err.attribute(), "target_path");
        assert_eq!(
            err.to_string(),
            "The argument \"target_path\" is required, but no definition was found."
        );
    }

    #[test]
    fn empty_target_path_is_rejected() {
        let err = InstallConfig::builder().target_path("").build().unwrap_err();
        assert!(matches!(err, ConfigValidationError::EmptyValue { .. }));
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = InstallConfig::builder()
            .target_path("staging-cluster")
            .build()
            .unwrap();

        assert_eq!(cfg.namespace(), "flux-system");
        assert_eq!(cfg.cluster_domain(), "cluster.local");
        assert!(cfg.network_policy());
        assert_eq!(cfg.version(), "latest");
        assert_eq!(cfg.log_level(), LogLevel::Info);
        assert!(cfg.watch_all_namespaces());
        assert_eq!(cfg.registry(), "ghcr.io/fluxcd");
        assert_eq!(cfg.components(), DEFAULT_COMPONENTS);
        assert_eq!(cfg.image_pull_secret(), None);
        assert_eq!(cfg.path(), "staging-cluster/flux-system/gotk-components.yaml");
    }

    #[test]
    fn empty_strings_are_accepted_for_optional_fields() {
        let cfg = InstallConfig::builder()
            .target_path("staging-cluster")
            .namespace("")
            .registry("")
            .build()
            .unwrap();

        assert_eq!(cfg.namespace(), "");
        assert_eq!(cfg.registry(), "");
        assert_eq!(cfg.path(), "staging-cluster//gotk-components.yaml");
    }

    #[test]
    fn log_level_parses_closed_set() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);

        let err = "warn".parse::<LogLevel>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "expected log_level to be one of [info debug error], got warn"
        );
        assert_eq!(err.attribute(), "log_level");
    }

    #[test]
    fn unknown_component_is_rejected() {
        let err = InstallConfig::builder()
            .target_path("staging-cluster")
            .components(["source-controller", "tf-controller"])
            .build()
            .unwrap_err();

        match err {
            ConfigValidationError::NotInSet {
                attribute, value, ..
            } => {
                assert_eq!(attribute, "components");
                assert_eq!(value, "tf-controller");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_components_are_collapsed() {
        let cfg = InstallConfig::builder()
            .target_path("staging-cluster")
            .components(["source-controller", "source-controller"])
            .build()
            .unwrap();
        assert_eq!(cfg.components(), ["source-controller"]);
    }

    #[test]
    fn empty_component_list_is_rejected() {
        let err = InstallConfig::builder()
            .target_path("staging-cluster")
            .components(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigValidationError::EmptyList { .. }));
    }

    #[test]
    fn bundle_selection_keeps_release_order() {
        let bundle: ReleaseBundle = serde_yaml::from_str(
            r#"
version: v0.2.1
components:
  - name: source-controller
    tag: v0.2.2
    crds: [GitRepository]
  - name: kustomize-controller
    tag: v0.2.1
  - name: helm-controller
    tag: v0.2.0
"#,
        )
        .unwrap();

        let selected = bundle
            .select(&["helm-controller".to_string(), "source-controller".to_string()])
            .unwrap();
        let names: Vec<_> = selected.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["source-controller", "helm-controller"]);

        let err = bundle
            .select(&["notification-controller".to_string()])
            .unwrap_err();
        assert!(matches!(
            err,
            ContentResolutionError::ComponentUnavailable { .. }
        ));
        assert!(!err.is_retryable());
    }
}

use flux_install_api::ContentResolutionError;
use flux_install_manifest::{CachedSource, CatalogSource, LatestPolicy};
use flux_install_provider::{InstallDataSource, ReadResponse};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use std::env;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("invalid env {key}: expected one of [pinned live], got {value}"))]
    InvalidEnv { key: &'static str, value: String },
    #[snafu(display("failed to load release catalog: {source}"))]
    LoadCatalog { source: ContentResolutionError },
    #[snafu(display("failed to read attributes from {location}: {source}"))]
    ReadAttributes {
        location: String,
        source: std::io::Error,
    },
    #[snafu(display("attributes in {location} are not a JSON object: {source}"))]
    DecodeAttributes {
        location: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode read response: {source}"))]
    EncodeResponse { source: serde_json::Error },
    #[snafu(display("flux_install read failed: {summary}"))]
    ReadFailed { summary: String },
}

#[derive(Clone, Debug)]
struct ProviderConfig {
    catalog_path: Option<PathBuf>,
    latest_policy: LatestPolicy,
    attributes_path: Option<PathBuf>,
}

impl ProviderConfig {
    fn from_env() -> Result<Self, Error> {
        Ok(Self {
            catalog_path: env::var_os("FLUX_INSTALL_CATALOG").map(PathBuf::from),
            latest_policy: parse_latest_policy("FLUX_INSTALL_LATEST_POLICY")?,
            attributes_path: env::args_os().nth(1).map(PathBuf::from),
        })
    }
}

fn parse_latest_policy(key: &'static str) -> Result<LatestPolicy, Error> {
    match env::var(key) {
        Err(_) => Ok(LatestPolicy::default()),
        Ok(v) => match v.as_str() {
            "pinned" => Ok(LatestPolicy::Pinned),
            "live" => Ok(LatestPolicy::Live),
            _ => Err(Error::InvalidEnv { key, value: v }),
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flux_install_provider=debug".into()),
        )
        .init();

    match run().await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = %err, "provider read failed");
            Err(err)
        }
    }
}

async fn run() -> Result<(), Error> {
    let cfg = ProviderConfig::from_env()?;
    let catalog = match &cfg.catalog_path {
        Some(path) => CatalogSource::from_file(path),
        None => CatalogSource::embedded(),
    }
    .context(LoadCatalogSnafu)?;
    info!(
        catalog = catalog.location(),
        releases = catalog.versions().len(),
        latest_policy = ?cfg.latest_policy,
        "release catalog loaded"
    );
    let data_source = InstallDataSource::new(CachedSource::new(catalog, cfg.latest_policy));

    let (location, raw) = read_request(&cfg).await?;
    let attrs: Map<String, Value> =
        serde_json::from_str(&raw).context(DecodeAttributesSnafu { location })?;

    let response = ReadResponse::from_result(data_source.read(&attrs).await);
    let encoded = serde_json::to_string_pretty(&response).context(EncodeResponseSnafu)?;
    println!("{}", encoded);

    let diagnostics = response.diagnostics();
    if !diagnostics.is_empty() {
        let summary = diagnostics
            .iter()
            .map(|d| d.summary.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::ReadFailed { summary });
    }
    Ok(())
}

async fn read_request(cfg: &ProviderConfig) -> Result<(String, String), Error> {
    match &cfg.attributes_path {
        Some(path) => {
            let location = path.display().to_string();
            let raw = tokio::fs::read_to_string(path)
                .await
                .context(ReadAttributesSnafu {
                    location: location.clone(),
                })?;
            Ok((location, raw))
        }
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context(ReadAttributesSnafu {
                    location: "<stdin>".to_string(),
                })?;
            Ok(("<stdin>".to_string(), raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_policy_defaults_to_pinned() {
        assert_eq!(
            parse_latest_policy("FLUX_INSTALL_TEST_UNSET_POLICY").unwrap(),
            LatestPolicy::Pinned
        );
    }
}

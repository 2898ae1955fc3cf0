use flux_install_api::{ConfigValidationError, InstallError};
use flux_install_manifest::{CachedSource, CatalogSource, LatestPolicy};
use flux_install_provider::{InstallDataSource, InstallState, ReadResponse};
use serde_json::{Map, Value, json};
use std::sync::Arc;

type DataSource = InstallDataSource<CachedSource<CatalogSource>>;

fn data_source() -> DataSource {
    InstallDataSource::new(CachedSource::new(
        CatalogSource::embedded().unwrap(),
        LatestPolicy::Pinned,
    ))
}

fn attrs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// `target_path = "staging-cluster"` plus one extra attribute given as a string.
fn with_arg(name: &str, value: &str) -> Map<String, Value> {
    let mut map = attrs(json!({ "target_path": "staging-cluster" }));
    map.insert(name.to_string(), Value::String(value.to_string()));
    map
}

/// Flat string form of one state attribute, the way the host prints state values.
fn attribute(state: &InstallState, name: &str) -> Option<String> {
    match serde_json::to_value(state).unwrap().get(name)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

async fn read_ok(ds: &DataSource, attrs: &Map<String, Value>) -> InstallState {
    ds.read(attrs).await.unwrap()
}

#[tokio::test]
async fn target_path_is_required() {
    let err = data_source().read(&Map::new()).await.unwrap_err();

    assert!(matches!(
        err,
        InstallError::Validation {
            source: ConfigValidationError::MissingRequired { .. }
        }
    ));
    assert_eq!(
        err.to_string(),
        "The argument \"target_path\" is required, but no definition was found."
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn invalid_log_level_is_rejected() {
    let err = data_source()
        .read(&with_arg("log_level", "warn"))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "expected log_level to be one of [info debug error], got warn"
    );
    assert_eq!(err.attribute(), Some("log_level"));

    let response = ReadResponse::from_result(Err(err));
    assert_eq!(response.diagnostics().len(), 1);
}

#[tokio::test]
async fn log_level_must_match_exactly() {
    let ds = data_source();
    for level in ["", "INFO", "Debug", "trace", " info"] {
        let err = ds.read(&with_arg("log_level", level)).await.unwrap_err();
        assert!(
            matches!(
                err,
                InstallError::Validation {
                    source: ConfigValidationError::NotInSet { .. }
                }
            ),
            "{level:?} was accepted"
        );
        assert_eq!(
            err.to_string(),
            format!("expected log_level to be one of [info debug error], got {}", level)
        );
    }
    for level in ["info", "debug", "error"] {
        let state = read_ok(&ds, &with_arg("log_level", level)).await;
        assert_eq!(attribute(&state, "log_level").as_deref(), Some(level));
    }
}

#[tokio::test]
async fn defaults_are_echoed() {
    let ds = data_source();
    let state = read_ok(&ds, &attrs(json!({ "target_path": "staging-cluster" }))).await;

    assert!(!state.content.is_empty());
    let expected = [
        ("log_level", "info"),
        ("namespace", "flux-system"),
        ("cluster_domain", "cluster.local"),
        ("network_policy", "true"),
        ("path", "staging-cluster/flux-system/gotk-components.yaml"),
        ("registry", "ghcr.io/fluxcd"),
        ("target_path", "staging-cluster"),
        ("version", "latest"),
        ("watch_all_namespaces", "true"),
    ];
    for (name, value) in expected {
        assert_eq!(attribute(&state, name).as_deref(), Some(value), "{name}");
    }
    assert_eq!(attribute(&state, "image_pull_secret"), None);
    assert!(state.id.starts_with("sha256:"));
}

#[tokio::test]
async fn single_attribute_changes_propagate() {
    let ds = data_source();
    let baseline = read_ok(&ds, &attrs(json!({ "target_path": "staging-cluster" }))).await;

    let steps = [
        ("log_level", "debug"),
        ("namespace", "test-system"),
        ("cluster_domain", "k8s.local"),
        ("network_policy", "false"),
        ("version", "0.2.1"),
        ("watch_all_namespaces", "false"),
    ];
    for (name, value) in steps {
        let state = read_ok(&ds, &with_arg(name, value)).await;

        assert_eq!(attribute(&state, name).as_deref(), Some(value), "{name}");
        assert_ne!(state.content, baseline.content, "{name} did not change content");
        for other in ["log_level", "cluster_domain", "registry", "target_path"] {
            if other != name {
                assert_eq!(
                    attribute(&state, other),
                    attribute(&baseline, other),
                    "{other}"
                );
            }
        }
        if name == "namespace" {
            assert_eq!(state.path, "staging-cluster/test-system/gotk-components.yaml");
        } else {
            assert_eq!(state.path, baseline.path, "{name} moved the path");
        }
    }
}

#[tokio::test]
async fn path_follows_target_path_and_namespace() {
    let ds = data_source();
    for (target_path, namespace) in [
        ("clusters/prod", "flux-system"),
        ("./edge", "gitops"),
        ("staging-cluster", ""),
    ] {
        let state = read_ok(
            &ds,
            &attrs(json!({ "target_path": target_path, "namespace": namespace })),
        )
        .await;
        assert_eq!(
            state.path,
            format!("{}/{}/gotk-components.yaml", target_path, namespace)
        );
    }
}

#[tokio::test]
async fn repeated_reads_are_byte_identical() {
    let ds = data_source();
    let input = with_arg("version", "v0.3.0");

    let first = read_ok(&ds, &input).await;
    let second = read_ok(&ds, &input).await;

    assert_eq!(first.content, second.content);
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn parallel_reads_agree() {
    let ds = Arc::new(data_source());
    let reads = (0..8).map(|_| {
        let ds = ds.clone();
        tokio::spawn(async move {
            ds.read(&attrs(json!({ "target_path": "staging-cluster" })))
                .await
                .unwrap()
        })
    });

    let states: Vec<InstallState> = futures::future::join_all(reads)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    assert!(states.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn unknown_version_is_not_a_validation_error() {
    let err = data_source()
        .read(&with_arg("version", "0.0.1"))
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::Resolution { .. }));
    assert_eq!(err.attribute(), Some("version"));
    assert!(!err.is_retryable());
}

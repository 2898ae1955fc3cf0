mod objects;
pub mod source;

pub use source::{CachedSource, CatalogSource, ContentSource, LatestPolicy, normalize_tag};

use flux_install_api::{InstallConfig, InstallError, ReleaseBundle, RenderedInstall};
use flux_install_common::{content_identity, identity_short};
use objects::RenderContext;
use tracing::{debug, info};

/// Resolves the configured version through `source` and renders it.
pub async fn render_install<S: ContentSource>(
    source: &S,
    cfg: &InstallConfig,
) -> Result<RenderedInstall, InstallError> {
    let bundle = source.resolve(cfg.version()).await?;
    debug!(
        requested = cfg.version(),
        resolved = %bundle.version,
        "release bundle resolved"
    );
    let rendered = render_bundle(cfg, &bundle)?;
    info!(
        version = %rendered.version,
        namespace = cfg.namespace(),
        path = %rendered.path,
        identity = %identity_short(&rendered.identity),
        "rendered install manifests"
    );
    Ok(rendered)
}

/// Renders a resolved release. Pure: same inputs, same bytes.
pub fn render_bundle(
    cfg: &InstallConfig,
    bundle: &ReleaseBundle,
) -> Result<RenderedInstall, InstallError> {
    let components = bundle.select(cfg.components())?;
    let ctx = RenderContext {
        cfg,
        version: &bundle.version,
        components: &components,
    };
    let documents = objects::documents(&ctx)?;

    let names: Vec<&str> = components.iter().map(|c| c.name.as_str()).collect();
    let mut content = format!(
        "# Flux version: {}\n# Components: {}\n",
        bundle.version,
        names.join(",")
    );
    for doc in documents {
        content.push_str("---\n");
        content.push_str(&doc);
    }

    Ok(RenderedInstall {
        identity: content_identity(&content),
        path: cfg.path(),
        version: bundle.version.clone(),
        content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_install_api::{ContentResolutionError, LogLevel, RenderError};

    fn staging() -> flux_install_api::InstallConfigBuilder {
        InstallConfig::builder().target_path("staging-cluster")
    }

    fn catalog() -> CatalogSource {
        CatalogSource::embedded().unwrap()
    }

    async fn render(cfg: &InstallConfig) -> RenderedInstall {
        render_install(&catalog(), cfg).await.unwrap()
    }

    fn documents_of_kind<'a>(content: &'a str, kind: &str) -> Vec<&'a str> {
        let marker = format!("\nkind: {}\n", kind);
        content
            .split("---\n")
            .filter(|doc| format!("\n{}", doc).contains(&marker))
            .collect()
    }

    #[tokio::test]
    async fn renders_default_install() {
        let rendered = render(&staging().build().unwrap()).await;

        assert_eq!(
            rendered.path,
            "staging-cluster/flux-system/gotk-components.yaml"
        );
        assert_eq!(rendered.version, "v0.4.3");
        assert!(rendered.content.starts_with("# Flux version: v0.4.3\n"));
        assert!(rendered.content.contains(
            "# Components: source-controller,kustomize-controller,helm-controller,notification-controller\n"
        ));
        assert!(rendered.identity.starts_with("sha256:"));

        assert_eq!(documents_of_kind(&rendered.content, "Namespace").len(), 1);
        assert_eq!(
            documents_of_kind(&rendered.content, "CustomResourceDefinition").len(),
            9
        );
        assert_eq!(documents_of_kind(&rendered.content, "Deployment").len(), 4);
        assert_eq!(documents_of_kind(&rendered.content, "ServiceAccount").len(), 4);
        assert_eq!(documents_of_kind(&rendered.content, "Service").len(), 3);
        assert_eq!(documents_of_kind(&rendered.content, "NetworkPolicy").len(), 3);
        assert!(
            rendered
                .content
                .contains("image: ghcr.io/fluxcd/source-controller:v0.4.1")
        );
        assert!(rendered.content.contains("--log-level=info"));
        assert!(rendered.content.contains("--watch-all-namespaces=true"));
        assert!(rendered.content.contains(
            "--events-addr=http://notification-controller.flux-system.svc.cluster.local/"
        ));
    }

    #[tokio::test]
    async fn rendering_is_idempotent() {
        let cfg = staging().log_level(LogLevel::Debug).build().unwrap();
        let a = render(&cfg).await;
        let b = render(&cfg).await;

        assert_eq!(a, b);
        assert_eq!(a.identity, content_identity(&a.content));
    }

    #[tokio::test]
    async fn object_order_is_stable() {
        let rendered = render(&staging().build().unwrap()).await;
        let kinds: Vec<&str> = rendered
            .content
            .split("---\n")
            .skip(1)
            .filter_map(|doc| doc.lines().find_map(|l| l.strip_prefix("kind: ")))
            .collect();

        let first = |kind: &str| kinds.iter().position(|k| *k == kind).unwrap();
        assert_eq!(kinds[0], "Namespace");
        assert!(first("CustomResourceDefinition") < first("ServiceAccount"));
        assert!(first("ServiceAccount") < first("ClusterRole"));
        assert!(first("ClusterRoleBinding") < first("Service"));
        assert!(first("Service") < first("Deployment"));
        assert!(first("Deployment") < first("NetworkPolicy"));
        assert_eq!(*kinds.last().unwrap(), "NetworkPolicy");
    }

    #[tokio::test]
    async fn options_are_substituted() {
        let cfg = staging()
            .namespace("test-system")
            .cluster_domain("k8s.local")
            .registry("registry.example.com/mirror/")
            .log_level(LogLevel::Error)
            .watch_all_namespaces(false)
            .image_pull_secret("regcred")
            .build()
            .unwrap();
        let rendered = render(&cfg).await;
        let content = &rendered.content;

        assert_eq!(rendered.path, "staging-cluster/test-system/gotk-components.yaml");
        assert!(content.contains("namespace: test-system"));
        assert!(!content.contains("flux-system"));
        assert!(content.contains("crd-controller-test-system"));
        assert!(
            content.contains("image: registry.example.com/mirror/kustomize-controller:v0.4.0")
        );
        assert!(content.contains("--log-level=error"));
        assert!(content.contains("--watch-all-namespaces=false"));
        assert!(content.contains(
            "--events-addr=http://notification-controller.test-system.svc.k8s.local/"
        ));
        assert!(content.contains(
            "--storage-adv-addr=source-controller.$(RUNTIME_NAMESPACE).svc.k8s.local."
        ));
        assert!(!content.contains("cluster.local"));
        assert!(content.contains("- name: regcred"));
    }

    #[tokio::test]
    async fn network_policies_can_be_disabled() {
        let with = render(&staging().build().unwrap()).await;
        let without = render(&staging().network_policy(false).build().unwrap()).await;

        assert!(documents_of_kind(&without.content, "NetworkPolicy").is_empty());
        assert_ne!(with.identity, without.identity);
        assert_eq!(with.path, without.path);
    }

    #[tokio::test]
    async fn pinned_version_is_resolved_verbatim() {
        let rendered = render(&staging().version("0.2.1").build().unwrap()).await;
        assert_eq!(rendered.version, "v0.2.1");
        assert!(rendered.content.contains("app.kubernetes.io/version: v0.2.1"));
        assert!(
            rendered
                .content
                .contains("image: ghcr.io/fluxcd/helm-controller:v0.2.0")
        );
    }

    #[tokio::test]
    async fn unknown_version_is_a_resolution_error() {
        let cfg = staging().version("0.0.9").build().unwrap();
        let err = render_install(&catalog(), &cfg).await.unwrap_err();

        assert!(matches!(
            err,
            InstallError::Resolution {
                source: ContentResolutionError::UnknownVersion { .. }
            }
        ));
        assert_eq!(err.attribute(), Some("version"));
    }

    #[tokio::test]
    async fn component_missing_from_release_is_a_resolution_error() {
        let cfg = staging()
            .version("v0.2.1")
            .components(["source-controller", "image-reflector-controller"])
            .build()
            .unwrap();
        let err = render_install(&catalog(), &cfg).await.unwrap_err();
        assert!(matches!(
            err,
            InstallError::Resolution {
                source: ContentResolutionError::ComponentUnavailable { .. }
            }
        ));
    }

    #[tokio::test]
    async fn partial_component_set_skips_dependent_objects() {
        let cfg = staging()
            .components(["source-controller", "kustomize-controller"])
            .build()
            .unwrap();
        let rendered = render(&cfg).await;

        assert_eq!(documents_of_kind(&rendered.content, "Deployment").len(), 2);
        assert_eq!(documents_of_kind(&rendered.content, "Service").len(), 1);
        assert_eq!(documents_of_kind(&rendered.content, "NetworkPolicy").len(), 2);
        assert!(!rendered.content.contains("--events-addr"));
        assert!(!rendered.content.contains("notification.toolkit.fluxcd.io"));
    }

    #[test]
    fn unknown_crd_kind_is_a_render_error() {
        let bundle: ReleaseBundle = serde_yaml::from_str(
            r#"
version: v9.0.0
components:
  - name: source-controller
    tag: v9.0.0
    crds: [OCIRepository]
"#,
        )
        .unwrap();
        let cfg = staging().components(["source-controller"]).build().unwrap();

        let err = render_bundle(&cfg, &bundle).unwrap_err();
        assert!(matches!(
            err,
            InstallError::Render {
                source: RenderError::UnknownCustomResource { .. }
            }
        ));
        assert!(!err.is_retryable());
    }
}

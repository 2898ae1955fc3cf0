use flux_install_api::toolkit::crd_for_kind;
use flux_install_api::{
    ComponentRelease, HELM_CONTROLLER, InstallConfig, KUSTOMIZE_CONTROLLER,
    NOTIFICATION_CONTROLLER, RenderError, SOURCE_CONTROLLER, SerializeObjectSnafu,
};
use flux_install_common::{
    CONTROL_PLANE_VALUE, LABEL_APP, LABEL_CONTROL_PLANE, LABEL_INSTANCE, LABEL_PART_OF,
    LABEL_VERSION, PART_OF_VALUE,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction,
    LocalObjectReference, Namespace, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use snafu::ResultExt;
use std::collections::BTreeMap;

const METRICS_PORT: i32 = 8080;
const HEALTH_PORT: i32 = 9440;
const HTTP_PORT: i32 = 9090;
const WEBHOOK_PORT: i32 = 9292;
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Everything one render needs: validated config, the resolved release tag
/// and the selected components in release order.
pub(crate) struct RenderContext<'a> {
    pub cfg: &'a InstallConfig,
    pub version: &'a str,
    pub components: &'a [&'a ComponentRelease],
}

impl RenderContext<'_> {
    fn has(&self, name: &str) -> bool {
        self.components.iter().any(|c| c.name == name)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_INSTANCE.to_string(), self.cfg.namespace().to_string()),
            (LABEL_PART_OF.to_string(), PART_OF_VALUE.to_string()),
            (LABEL_VERSION.to_string(), self.version.to_string()),
        ])
    }

    fn cluster_meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    fn namespaced_meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(self.cfg.namespace().to_string()),
            ..self.cluster_meta(name)
        }
    }

    fn service_dns(&self, service: &str) -> String {
        format!(
            "{}.{}.svc.{}",
            service,
            self.cfg.namespace(),
            self.cfg.cluster_domain()
        )
    }

    fn image(&self, component: &ComponentRelease) -> String {
        format!(
            "{}/{}:{}",
            self.cfg.registry().trim_end_matches('/'),
            component.name,
            component.tag
        )
    }
}

/// Serializes every object of the install in emission order.
pub(crate) fn documents(ctx: &RenderContext<'_>) -> Result<Vec<String>, RenderError> {
    let mut docs = Vec::new();

    docs.push(to_document("Namespace", ctx.cfg.namespace(), &namespace(ctx))?);

    for component in ctx.components {
        for kind in &component.crds {
            let mut crd =
                crd_for_kind(kind).ok_or_else(|| RenderError::UnknownCustomResource {
                    version: ctx.version.to_string(),
                    component: component.name.clone(),
                    kind: kind.clone(),
                })?;
            crd.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(ctx.labels());
            let name = crd.metadata.name.clone().unwrap_or_else(|| kind.clone());
            docs.push(to_document("CustomResourceDefinition", &name, &crd)?);
        }
    }

    for component in ctx.components {
        let sa = ServiceAccount {
            metadata: ctx.namespaced_meta(&component.name),
            ..Default::default()
        };
        docs.push(to_document("ServiceAccount", &component.name, &sa)?);
    }

    let role = crd_controller_role(ctx);
    docs.push(to_document("ClusterRole", &crd_controller_name(ctx), &role)?);
    let binding = crd_controller_binding(ctx);
    docs.push(to_document(
        "ClusterRoleBinding",
        &crd_controller_name(ctx),
        &binding,
    )?);
    if let Some(binding) = cluster_reconciler_binding(ctx) {
        docs.push(to_document(
            "ClusterRoleBinding",
            &cluster_reconciler_name(ctx),
            &binding,
        )?);
    }

    for service in services(ctx) {
        let name = service.metadata.name.clone().unwrap_or_default();
        docs.push(to_document("Service", &name, &service)?);
    }

    for component in ctx.components {
        docs.push(to_document(
            "Deployment",
            &component.name,
            &deployment(ctx, component),
        )?);
    }

    if ctx.cfg.network_policy() {
        for policy in network_policies(ctx) {
            let name = policy.metadata.name.clone().unwrap_or_default();
            docs.push(to_document("NetworkPolicy", &name, &policy)?);
        }
    }

    Ok(docs)
}

fn to_document<T: Serialize>(kind: &str, name: &str, obj: &T) -> Result<String, RenderError> {
    serde_yaml::to_string(obj).context(SerializeObjectSnafu {
        kind: kind.to_string(),
        name: name.to_string(),
    })
}

fn namespace(ctx: &RenderContext<'_>) -> Namespace {
    Namespace {
        metadata: ctx.cluster_meta(ctx.cfg.namespace()),
        ..Default::default()
    }
}

fn crd_controller_name(ctx: &RenderContext<'_>) -> String {
    format!("crd-controller-{}", ctx.cfg.namespace())
}

fn cluster_reconciler_name(ctx: &RenderContext<'_>) -> String {
    format!("cluster-reconciler-{}", ctx.cfg.namespace())
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn crd_controller_role(ctx: &RenderContext<'_>) -> ClusterRole {
    let mut groups: Vec<String> = Vec::new();
    for component in ctx.components {
        for kind in &component.crds {
            if let Some(crd) = crd_for_kind(kind) {
                if !groups.contains(&crd.spec.group) {
                    groups.push(crd.spec.group);
                }
            }
        }
    }

    let mut rules: Vec<PolicyRule> = groups
        .iter()
        .map(|group| rule(&[group.as_str()], &["*"], &["*"]))
        .collect();
    rules.push(rule(&[""], &["namespaces", "secrets"], &["get", "list", "watch"]));
    rules.push(rule(&[""], &["events"], &["create", "patch"]));
    rules.push(rule(&[""], &["configmaps", "configmaps/status"], &["*"]));
    rules.push(rule(&["coordination.k8s.io"], &["leases"], &["*"]));

    ClusterRole {
        metadata: ctx.cluster_meta(&crd_controller_name(ctx)),
        rules: Some(rules),
        aggregation_rule: None,
    }
}

fn service_account_subject(ctx: &RenderContext<'_>, name: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(ctx.cfg.namespace().to_string()),
        ..Default::default()
    }
}

fn crd_controller_binding(ctx: &RenderContext<'_>) -> ClusterRoleBinding {
    let name = crd_controller_name(ctx);
    ClusterRoleBinding {
        metadata: ctx.cluster_meta(&name),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name,
        },
        subjects: Some(
            ctx.components
                .iter()
                .map(|c| service_account_subject(ctx, &c.name))
                .collect(),
        ),
    }
}

/// Reconcilers apply arbitrary cluster objects and are bound to `cluster-admin`.
fn cluster_reconciler_binding(ctx: &RenderContext<'_>) -> Option<ClusterRoleBinding> {
    let subjects: Vec<Subject> = [KUSTOMIZE_CONTROLLER, HELM_CONTROLLER]
        .into_iter()
        .filter(|name| ctx.has(name))
        .map(|name| service_account_subject(ctx, name))
        .collect();
    if subjects.is_empty() {
        return None;
    }

    Some(ClusterRoleBinding {
        metadata: ctx.cluster_meta(&cluster_reconciler_name(ctx)),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: "cluster-admin".to_string(),
        },
        subjects: Some(subjects),
    })
}

fn service(ctx: &RenderContext<'_>, name: &str, app: &str, target_port: &str) -> Service {
    let mut metadata = ctx.namespaced_meta(name);
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_CONTROL_PLANE.to_string(), CONTROL_PLANE_VALUE.to_string());

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([(LABEL_APP.to_string(), app.to_string())])),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::String(target_port.to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn services(ctx: &RenderContext<'_>) -> Vec<Service> {
    let mut out = Vec::new();
    if ctx.has(SOURCE_CONTROLLER) {
        out.push(service(ctx, SOURCE_CONTROLLER, SOURCE_CONTROLLER, "http"));
    }
    if ctx.has(NOTIFICATION_CONTROLLER) {
        out.push(service(
            ctx,
            NOTIFICATION_CONTROLLER,
            NOTIFICATION_CONTROLLER,
            "http",
        ));
        out.push(service(
            ctx,
            "webhook-receiver",
            NOTIFICATION_CONTROLLER,
            "http-webhook",
        ));
    }
    out
}

fn controller_args(ctx: &RenderContext<'_>, component: &ComponentRelease) -> Vec<String> {
    let mut args = Vec::new();
    if component.name != NOTIFICATION_CONTROLLER && ctx.has(NOTIFICATION_CONTROLLER) {
        args.push(format!(
            "--events-addr=http://{}/",
            ctx.service_dns(NOTIFICATION_CONTROLLER)
        ));
    }
    args.push(format!(
        "--watch-all-namespaces={}",
        ctx.cfg.watch_all_namespaces()
    ));
    args.push(format!("--log-level={}", ctx.cfg.log_level()));
    args.push("--log-json".to_string());
    args.push("--enable-leader-election".to_string());
    if component.name == SOURCE_CONTROLLER {
        args.push("--storage-path=/data".to_string());
        args.push(format!(
            "--storage-adv-addr=source-controller.$(RUNTIME_NAMESPACE).svc.{}.",
            ctx.cfg.cluster_domain()
        ));
    }
    args
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn controller_ports(component: &ComponentRelease) -> Vec<ContainerPort> {
    let mut ports = Vec::new();
    if component.name == SOURCE_CONTROLLER || component.name == NOTIFICATION_CONTROLLER {
        ports.push(container_port("http", HTTP_PORT));
    }
    if component.name == NOTIFICATION_CONTROLLER {
        ports.push(container_port("http-webhook", WEBHOOK_PORT));
    }
    ports.push(container_port("http-prom", METRICS_PORT));
    ports.push(container_port("healthz", HEALTH_PORT));
    ports
}

fn http_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String("healthz".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

fn controller_volumes(component: &ComponentRelease) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut dirs = vec![("temp", "/tmp")];
    if component.name == SOURCE_CONTROLLER {
        dirs.insert(0, ("data", "/data"));
    }
    let volumes = dirs
        .iter()
        .map(|(name, _)| Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        })
        .collect();
    let mounts = dirs
        .iter()
        .map(|(name, path)| VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        })
        .collect();
    (volumes, mounts)
}

fn deployment(ctx: &RenderContext<'_>, component: &ComponentRelease) -> Deployment {
    let app_labels = BTreeMap::from([(LABEL_APP.to_string(), component.name.clone())]);
    let mut metadata = ctx.namespaced_meta(&component.name);
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_CONTROL_PLANE.to_string(), CONTROL_PLANE_VALUE.to_string());

    let (volumes, volume_mounts) = controller_volumes(component);
    let container = Container {
        name: "manager".to_string(),
        image: Some(ctx.image(component)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(controller_args(ctx, component)),
        env: Some(vec![EnvVar {
            name: "RUNTIME_NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(controller_ports(component)),
        readiness_probe: Some(http_probe("/readyz")),
        liveness_probe: Some(http_probe("/healthz")),
        resources: Some(ResourceRequirements {
            limits: Some(quantities("1000m", "1Gi")),
            requests: Some(quantities("50m", "64Mi")),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    let image_pull_secrets = ctx.cfg.image_pull_secret().map(|secret| {
        vec![LocalObjectReference {
            name: secret.to_string().into(),
        }]
    });

    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(app_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app_labels),
                    annotations: Some(BTreeMap::from([
                        ("prometheus.io/port".to_string(), METRICS_PORT.to_string()),
                        ("prometheus.io/scrape".to_string(), "true".to_string()),
                    ])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(component.name.clone()),
                    termination_grace_period_seconds: Some(10),
                    containers: vec![container],
                    image_pull_secrets,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn network_policy(
    ctx: &RenderContext<'_>,
    name: &str,
    pod_selector: LabelSelector,
    ingress: NetworkPolicyIngressRule,
    egress: bool,
) -> NetworkPolicy {
    let mut policy_types = vec!["Ingress".to_string()];
    if egress {
        policy_types.push("Egress".to_string());
    }
    NetworkPolicy {
        metadata: ctx.namespaced_meta(name),
        spec: Some(NetworkPolicySpec {
            pod_selector: pod_selector.into(),
            policy_types: Some(policy_types),
            ingress: Some(vec![ingress]),
            egress: egress.then(|| vec![NetworkPolicyEgressRule::default()]),
        }),
        ..Default::default()
    }
}

fn from_any_namespace() -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector::default()),
        ..Default::default()
    }
}

fn network_policies(ctx: &RenderContext<'_>) -> Vec<NetworkPolicy> {
    let mut out = vec![
        network_policy(
            ctx,
            "allow-egress",
            LabelSelector::default(),
            NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(LabelSelector::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            true,
        ),
        network_policy(
            ctx,
            "allow-scraping",
            LabelSelector::default(),
            NetworkPolicyIngressRule {
                from: Some(vec![from_any_namespace()]),
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::Int(METRICS_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
            },
            false,
        ),
    ];
    if ctx.has(NOTIFICATION_CONTROLLER) {
        out.push(network_policy(
            ctx,
            "allow-webhooks",
            LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    LABEL_APP.to_string(),
                    NOTIFICATION_CONTROLLER.to_string(),
                )])),
                ..Default::default()
            },
            NetworkPolicyIngressRule {
                from: Some(vec![from_any_namespace()]),
                ..Default::default()
            },
            false,
        ));
    }
    out
}

//! The Deploying branch: image-pull credential, in-namespace message bus and
//! cache, backup storage, then the service fan-out with the front-door
//! ingress. Per-service failures are recorded and aggregated instead of
//! aborting the pass.

use crate::backup::{scheduled_backup_cronjob, BACKUP_PVC_NAME};
use crate::crd::{PRStack, PRStackStatus, ServiceState, ServiceStatus, StackPhase};
use crate::env::render_service_env;
use crate::names;
use crate::reconcile::status::{
    condition, set_condition, CONDITION_FALSE, CONDITION_TRUE, TYPE_DEGRADED, TYPE_PROGRESSING,
    TYPE_READY,
};
use crate::reconcile::{apply_namespaced, stack_labels, DB_CREDENTIALS_SECRET, REGISTRY_SECRET};
use crate::services::{effective_services, front_door};

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, HTTPGetAction, LocalObjectReference,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Secret, Service, ServicePort, ServiceSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ObjectMeta, Resource};
use kube::runtime::controller::Action;
use stackop_operator::controller::{Context, LONG_REQUEUE, MEDIUM_REQUEUE};
use stackop_operator::error::Result;
use tracing::{info, warn};

const SERVICE_PORT: i32 = 8080;
const DEFAULT_CPU_LIMIT: &str = "500m";
const DEFAULT_MEMORY_LIMIT: &str = "512Mi";
const BUS_NAME: &str = "message-bus";
const BUS_IMAGE: &str = "nats:2.10-alpine";
const BUS_PORT: i32 = 4222;
const CACHE_NAME: &str = "cache";
const CACHE_IMAGE: &str = "redis:7-alpine";
const CACHE_PORT: i32 = 6379;
const ENDPOINTS_CONFIGMAP: &str = "stack-endpoints";

pub async fn run(
    stack: &PRStack,
    ctx: &Context,
    namespace: &str,
    status: &mut PRStackStatus,
) -> Result<Action> {
    if let Some((user, token, email)) = ctx.config.registry_credentials() {
        apply_namespaced(
            ctx,
            namespace,
            registry_secret(stack, namespace, &ctx.config.registry_prefix, user, token, email),
        )
        .await?;
    }

    // per-stack tier: bus, cache, and the endpoints map downstream services
    // mount for their connection strings
    apply_namespaced(ctx, namespace, infra_deployment(stack, namespace, BUS_NAME, BUS_IMAGE, BUS_PORT)).await?;
    apply_namespaced(ctx, namespace, infra_service(stack, namespace, BUS_NAME, BUS_PORT)).await?;
    apply_namespaced(ctx, namespace, infra_deployment(stack, namespace, CACHE_NAME, CACHE_IMAGE, CACHE_PORT)).await?;
    apply_namespaced(ctx, namespace, infra_service(stack, namespace, CACHE_NAME, CACHE_PORT)).await?;
    apply_namespaced(ctx, namespace, endpoints_configmap(stack, namespace)).await?;

    if let Some(backup) = stack.spec.backup_config.as_ref().filter(|b| b.enabled) {
        apply_namespaced(ctx, namespace, backup_pvc(stack, namespace)).await?;
        if let Some(schedule) = &backup.cron_schedule {
            apply_namespaced(
                ctx,
                namespace,
                scheduled_backup_cronjob(stack, namespace, &ctx.config.backup_store, schedule),
            )
            .await?;
        }
    }

    let services = effective_services(&stack.spec);
    let front = front_door(&services).map(str::to_string);
    let mut results = Vec::with_capacity(services.len());
    for service in &services {
        let outcome = deploy_service(
            stack,
            ctx,
            namespace,
            service,
            front.as_deref() == Some(service.as_str()),
        )
        .await;
        results.push(match outcome {
            Ok(()) => ServiceStatus {
                name: service.clone(),
                status: ServiceState::Running,
                message: None,
            },
            Err(e) => {
                warn!(msg = "service deployment failed", service, %e);
                ServiceStatus {
                    name: service.clone(),
                    status: ServiceState::Failed,
                    message: Some(e.to_string()),
                }
            }
        });
    }

    let failed = results
        .iter()
        .filter(|s| s.status == ServiceState::Failed)
        .count();
    let total = results.len();
    status.services = results;
    status.host = Some(names::hostname(
        &stack.spec.stack_id,
        &ctx.config.base_domain,
        stack.spec.custom_domain.as_deref(),
    ));
    set_condition(
        status,
        condition(
            TYPE_PROGRESSING,
            CONDITION_FALSE,
            "Deployed",
            "deploy pass finished",
            stack.metadata.generation,
        ),
    );

    let action = match failed {
        0 => {
            status.phase = Some(StackPhase::Running);
            status.message = Some(format!("all {total} services running"));
            set_condition(
                status,
                condition(
                    TYPE_READY,
                    CONDITION_TRUE,
                    "ServicesRunning",
                    "every service deployed",
                    stack.metadata.generation,
                ),
            );
            set_condition(
                status,
                condition(
                    TYPE_DEGRADED,
                    CONDITION_FALSE,
                    "NoFailures",
                    "",
                    stack.metadata.generation,
                ),
            );
            Action::requeue(LONG_REQUEUE)
        }
        f if f < total => {
            status.phase = Some(StackPhase::Degraded);
            status.message = Some(format!("{f} of {total} services failed"));
            set_condition(
                status,
                condition(
                    TYPE_READY,
                    CONDITION_TRUE,
                    "PartiallyDegraded",
                    "some services failed to deploy",
                    stack.metadata.generation,
                ),
            );
            set_condition(
                status,
                condition(
                    TYPE_DEGRADED,
                    CONDITION_TRUE,
                    "ServiceFailures",
                    "one or more services failed to deploy",
                    stack.metadata.generation,
                ),
            );
            Action::requeue(LONG_REQUEUE)
        }
        _ => {
            status.phase = Some(StackPhase::Failed);
            status.message = Some("every service failed to deploy".to_string());
            set_condition(
                status,
                condition(
                    TYPE_READY,
                    CONDITION_FALSE,
                    "AllServicesFailed",
                    "no service could be deployed",
                    stack.metadata.generation,
                ),
            );
            Action::requeue(MEDIUM_REQUEUE)
        }
    };
    info!(msg = "deploy pass finished", total, failed);
    Ok(action)
}

async fn deploy_service(
    stack: &PRStack,
    ctx: &Context,
    namespace: &str,
    service: &str,
    is_front_door: bool,
) -> Result<()> {
    apply_namespaced(ctx, namespace, service_deployment(stack, ctx, namespace, service)).await?;
    apply_namespaced(ctx, namespace, cluster_ip_service(stack, namespace, service)).await?;
    if is_front_door {
        apply_namespaced(ctx, namespace, front_door_ingress(stack, ctx, namespace, service))
            .await?;
    }
    Ok(())
}

fn selector_labels(stack: &PRStack, app: &str) -> BTreeMap<String, String> {
    stack_labels(stack)
        .into_iter()
        .chain([("app".to_string(), app.to_string())])
        .collect()
}

fn resource_limits(stack: &PRStack) -> ResourceRequirements {
    let limits = stack.spec.resource_limits.clone().unwrap_or_default();
    let mut map = BTreeMap::from([
        (
            "cpu".to_string(),
            Quantity(limits.cpu.unwrap_or_else(|| DEFAULT_CPU_LIMIT.to_string())),
        ),
        (
            "memory".to_string(),
            Quantity(
                limits
                    .memory
                    .unwrap_or_else(|| DEFAULT_MEMORY_LIMIT.to_string()),
            ),
        ),
    ]);
    if let Some(storage) = limits.storage {
        map.insert("ephemeral-storage".to_string(), Quantity(storage));
    }
    ResourceRequirements {
        limits: Some(map),
        ..ResourceRequirements::default()
    }
}

fn http_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(SERVICE_PORT),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        ..Probe::default()
    }
}

fn desired_replicas(stack: &PRStack) -> i32 {
    if stack.spec.active { 1 } else { 0 }
}

fn service_deployment(stack: &PRStack, ctx: &Context, namespace: &str, service: &str) -> Deployment {
    let labels = selector_labels(stack, service);
    let image = names::image_reference(
        &ctx.config.registry_prefix,
        service,
        &stack.spec.stack_id,
        stack.spec.image_tag.as_deref(),
    );
    Deployment {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(desired_replicas(stack)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: service.to_string(),
                        image: Some(image),
                        ports: Some(vec![ContainerPort {
                            container_port: SERVICE_PORT,
                            name: Some("http".to_string()),
                            ..ContainerPort::default()
                        }]),
                        env: Some(render_service_env(service, &stack.spec.stack_id, namespace)),
                        resources: Some(resource_limits(stack)),
                        liveness_probe: Some(http_probe("/health")),
                        readiness_probe: Some(http_probe("/ready")),
                        ..Container::default()
                    }],
                    // referenced unconditionally; tolerated missing when
                    // images are public
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: REGISTRY_SECRET.to_string(),
                    }]),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

fn cluster_ip_service(stack: &PRStack, namespace: &str, service: &str) -> Service {
    let labels = selector_labels(stack, service);
    Service {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(SERVICE_PORT)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

fn front_door_ingress(stack: &PRStack, ctx: &Context, namespace: &str, service: &str) -> Ingress {
    let host = names::hostname(
        &stack.spec.stack_id,
        &ctx.config.base_domain,
        stack.spec.custom_domain.as_deref(),
    );
    let tls_secret = stack.spec.ingress_tls_secret_ref.clone();
    let annotations = match &tls_secret {
        Some(_) => Some(BTreeMap::from([
            (
                "traefik.ingress.kubernetes.io/router.entrypoints".to_string(),
                "websecure".to_string(),
            ),
            (
                "traefik.ingress.kubernetes.io/router.tls".to_string(),
                "true".to_string(),
            ),
            (
                "ingress.kubernetes.io/ssl-redirect".to_string(),
                "true".to_string(),
            ),
        ])),
        None => None,
    };
    Ingress {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector_labels(stack, service)),
            annotations,
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(SERVICE_PORT),
                                    ..ServiceBackendPort::default()
                                }),
                            }),
                            ..IngressBackend::default()
                        },
                    }],
                }),
            }]),
            tls: tls_secret.map(|secret| {
                vec![IngressTLS {
                    hosts: Some(vec![host]),
                    secret_name: Some(secret),
                }]
            }),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    }
}

fn infra_deployment(
    stack: &PRStack,
    namespace: &str,
    name: &str,
    image: &str,
    port: i32,
) -> Deployment {
    let labels = selector_labels(stack, name);
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(desired_replicas(stack)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: port,
                            ..ContainerPort::default()
                        }]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

fn infra_service(stack: &PRStack, namespace: &str, name: &str, port: i32) -> Service {
    let labels = selector_labels(stack, name);
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

fn endpoints_configmap(stack: &PRStack, namespace: &str) -> ConfigMap {
    let stack_id = &stack.spec.stack_id;
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(ENDPOINTS_CONFIGMAP.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(stack_labels(stack)),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([
            ("NATS_URL".to_string(), names::bus_url(namespace)),
            (
                "NATS_SUBJECT_PREFIX".to_string(),
                names::subject_prefix(stack_id),
            ),
            ("REDIS_URL".to_string(), names::cache_url(namespace)),
            ("REDIS_KEY_PREFIX".to_string(), names::key_prefix(stack_id)),
            (
                "DB_CREDENTIALS_SECRET".to_string(),
                DB_CREDENTIALS_SECRET.to_string(),
            ),
        ])),
        ..ConfigMap::default()
    }
}

fn backup_pvc(stack: &PRStack, namespace: &str) -> PersistentVolumeClaim {
    let backup = stack.spec.backup_config.clone().unwrap_or_default();
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(BACKUP_PVC_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(stack_labels(stack)),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: backup.storage_class,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(backup.storage_size.unwrap_or_else(|| "10Gi".to_string())),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }
}

/// Docker-config-json secret for the image registry. The registry host is
/// the first segment of the configured registry prefix.
fn registry_secret(
    stack: &PRStack,
    namespace: &str,
    registry_prefix: &str,
    user: &str,
    token: &str,
    email: &str,
) -> Secret {
    let registry_host = registry_prefix.split('/').next().unwrap_or(registry_prefix);
    let auth = STANDARD.encode(format!("{user}:{token}"));
    let docker_config = serde_json::json!({
        "auths": {
            registry_host: {
                "username": user,
                "password": token,
                "email": email,
                "auth": auth,
            }
        }
    });
    Secret {
        metadata: ObjectMeta {
            name: Some(REGISTRY_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(stack_labels(stack)),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        string_data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            docker_config.to_string(),
        )])),
        ..Secret::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{PRStackSpec, ResourceLimits};
    use stackop_operator::config::Config;
    use stackop_operator::controller::State;

    fn test_stack() -> PRStack {
        PRStack::new(
            "test-42",
            PRStackSpec {
                stack_id: "42".into(),
                active: true,
                ..PRStackSpec::default()
            },
        )
    }

    fn test_ctx() -> std::sync::Arc<Context> {
        let (mock_service, _handle) =
            tower_test::mock::pair::<http::Request<kube::client::Body>, http::Response<kube::client::Body>>();
        let client = kube::Client::new(mock_service, "default");
        State::new(Config::default()).to_context(client)
    }

    #[test]
    fn test_service_deployment_shape() {
        let stack = test_stack();
        let ctx = test_ctx();
        let d = service_deployment(&stack, &ctx, "pr-42-shop-pilab-hu", "products-service");

        assert_eq!(d.metadata.name.as_deref(), Some("products-service"));
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/pilab-dev/products-service:pr-42")
        );
        assert_eq!(
            container
                .liveness_probe
                .as_ref()
                .and_then(|p| p.http_get.as_ref())
                .and_then(|h| h.path.as_deref()),
            Some("/health")
        );
        assert_eq!(
            container
                .readiness_probe
                .as_ref()
                .and_then(|p| p.http_get.as_ref())
                .and_then(|h| h.path.as_deref()),
            Some("/ready")
        );
        let limits = container.resources.clone().unwrap().limits.unwrap();
        assert_eq!(limits["cpu"].0, "500m");
        assert_eq!(limits["memory"].0, "512Mi");
        assert_eq!(
            pod.image_pull_secrets.unwrap()[0].name,
            "registry-credentials"
        );
    }

    #[test]
    fn test_inactive_stack_renders_zero_replicas() {
        let mut stack = test_stack();
        stack.spec.active = false;
        let ctx = test_ctx();
        let d = service_deployment(&stack, &ctx, "ns", "products-service");
        assert_eq!(d.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn test_resource_limits_override() {
        let mut stack = test_stack();
        stack.spec.resource_limits = Some(ResourceLimits {
            cpu: Some("250m".into()),
            memory: None,
            storage: Some("1Gi".into()),
        });
        let ctx = test_ctx();
        let d = service_deployment(&stack, &ctx, "ns", "products-service");
        let limits = d.spec.unwrap().template.spec.unwrap().containers[0]
            .resources
            .clone()
            .unwrap()
            .limits
            .unwrap();
        assert_eq!(limits["cpu"].0, "250m");
        assert_eq!(limits["memory"].0, "512Mi");
        assert_eq!(limits["ephemeral-storage"].0, "1Gi");
    }

    #[test]
    fn test_ingress_host_and_tls() {
        let mut stack = test_stack();
        let ctx = test_ctx();
        let ingress = front_door_ingress(&stack, &ctx, "ns", "products-service");
        let spec = ingress.spec.clone().unwrap();
        assert_eq!(
            spec.rules.as_ref().unwrap()[0].host.as_deref(),
            Some("pr-42.shop.pilab.hu")
        );
        assert!(spec.tls.is_none());
        assert!(ingress.metadata.annotations.is_none());

        stack.spec.ingress_tls_secret_ref = Some("pr-42-tls".into());
        stack.spec.custom_domain = Some("review.example.com".into());
        let ingress = front_door_ingress(&stack, &ctx, "ns", "products-service");
        let spec = ingress.spec.unwrap();
        assert_eq!(
            spec.rules.as_ref().unwrap()[0].host.as_deref(),
            Some("review.example.com")
        );
        let tls = &spec.tls.unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("pr-42-tls"));
        assert_eq!(
            tls.hosts.as_ref().unwrap()[0],
            "review.example.com"
        );
        assert!(ingress
            .metadata
            .annotations
            .unwrap()
            .contains_key("traefik.ingress.kubernetes.io/router.tls"));
    }

    #[test]
    fn test_registry_secret_is_dockerconfigjson() {
        let stack = test_stack();
        let secret = registry_secret(&stack, "ns", "ghcr.io/pilab-dev", "bot", "t0ken", "ci@pilab.hu");
        assert_eq!(
            secret.type_.as_deref(),
            Some("kubernetes.io/dockerconfigjson")
        );
        let data = secret.string_data.unwrap();
        let config: serde_json::Value =
            serde_json::from_str(&data[".dockerconfigjson"]).unwrap();
        assert!(config["auths"]["ghcr.io"]["auth"].is_string());
    }

    #[test]
    fn test_backup_pvc_size_and_class() {
        let mut stack = test_stack();
        stack.spec.backup_config = Some(crate::crd::BackupConfig {
            enabled: true,
            storage_class: Some("fast".into()),
            storage_size: Some("20Gi".into()),
            ..crate::crd::BackupConfig::default()
        });
        let pvc = backup_pvc(&stack, "ns");
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"].0,
            "20Gi"
        );
    }
}

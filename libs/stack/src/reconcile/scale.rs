//! Replica-count and rollout reconciliation across every Deployment in a
//! stack namespace. Deployments already at the target are skipped so steady
//! state produces no apiserver writes; individual failures do not stop the
//! sweep but fail the tick.

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use stackop_operator::controller::Context;
use stackop_operator::error::{Error, Result};
use tracing::{debug, warn};

/// Pod-template annotation whose value change forces a rolling restart.
pub const RESTARTED_AT_ANNOTATION: &str = "restartedAt";

fn current_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0)
}

pub fn needs_scale(deployment: &Deployment, desired: i32) -> bool {
    current_replicas(deployment) != desired
}

fn current_stamp(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(RESTARTED_AT_ANNOTATION))
        .map(String::as_str)
}

pub fn needs_rollout(deployment: &Deployment, stamp: &str) -> bool {
    current_stamp(deployment) != Some(stamp)
}

/// Set every Deployment in the namespace to `desired` replicas
/// (0 or 1 in this system). Empty namespaces are a no-op.
pub async fn scale_all(ctx: &Context, namespace: &str, desired: i32) -> Result<()> {
    let api = Api::<Deployment>::namespaced(ctx.client.clone(), namespace);
    let deployments = api.list(&ListParams::default()).await.map_err(|e| {
        Error::KubeError(
            format!("failed to list deployments in {namespace}"),
            Box::new(e),
        )
    })?;

    let mut first_error = None;
    for deployment in &deployments.items {
        if !needs_scale(deployment, desired) {
            continue;
        }
        let name = deployment.name_any();
        debug!(msg = "scaling deployment", namespace, name, desired);
        let patch = json!({ "spec": { "replicas": desired } });
        if let Err(e) = api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(msg = "failed to scale deployment", namespace, name, %e);
            first_error.get_or_insert(Error::KubeError(
                format!("failed to scale deployment {namespace}/{name}"),
                Box::new(e),
            ));
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Stamp every pod template in the namespace with `stamp`, rolling all pods
/// without touching image references.
pub async fn rollout_all(ctx: &Context, namespace: &str, stamp: &str) -> Result<()> {
    let api = Api::<Deployment>::namespaced(ctx.client.clone(), namespace);
    let deployments = api.list(&ListParams::default()).await.map_err(|e| {
        Error::KubeError(
            format!("failed to list deployments in {namespace}"),
            Box::new(e),
        )
    })?;

    let mut first_error = None;
    for deployment in &deployments.items {
        if !needs_rollout(deployment, stamp) {
            continue;
        }
        let name = deployment.name_any();
        debug!(msg = "restamping deployment", namespace, name, stamp);
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { RESTARTED_AT_ANNOTATION: stamp }
                    }
                }
            }
        });
        if let Err(e) = api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(msg = "failed to restamp deployment", namespace, name, %e);
            first_error.get_or_insert(Error::KubeError(
                format!("failed to restamp deployment {namespace}/{name}"),
                Box::new(e),
            ));
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn deployment(replicas: Option<i32>, stamp: Option<&str>) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas,
                template: PodTemplateSpec {
                    metadata: stamp.map(|s| ObjectMeta {
                        annotations: Some(BTreeMap::from([(
                            RESTARTED_AT_ANNOTATION.to_string(),
                            s.to_string(),
                        )])),
                        ..ObjectMeta::default()
                    }),
                    ..PodTemplateSpec::default()
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn test_needs_scale_skips_at_target() {
        assert!(!needs_scale(&deployment(Some(1), None), 1));
        assert!(needs_scale(&deployment(Some(1), None), 0));
        assert!(needs_scale(&deployment(None, None), 1));
        assert!(!needs_scale(&deployment(None, None), 0));
    }

    #[test]
    fn test_needs_rollout_compares_stamp() {
        let stamp = "2025-01-01T00:00:00Z";
        assert!(needs_rollout(&deployment(Some(1), None), stamp));
        assert!(needs_rollout(
            &deployment(Some(1), Some("2024-12-31T00:00:00Z")),
            stamp
        ));
        assert!(!needs_rollout(&deployment(Some(1), Some(stamp)), stamp));
    }
}

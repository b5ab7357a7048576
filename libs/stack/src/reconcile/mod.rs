mod cleanup;
mod deploy;
mod provision;
pub mod scale;
pub mod status;

use crate::backup::{self, COMPONENT_LABEL};
use crate::crd::{PRStack, PRStackStatus, ServiceState, StackPhase};
use crate::names;
use crate::reconcile::status::{
    condition, has_condition, patch_status, set_condition, CONDITION_FALSE, CONDITION_TRUE,
    TYPE_DEGRADED, TYPE_EXPIRED, TYPE_READY,
};
use crate::validation::validate;

use stackop_k8s_util::types::short_type_name;
use stackop_operator::config::Config;
use stackop_operator::controller::{Context, LONG_REQUEUE, MEDIUM_REQUEUE, SHORT_REQUEUE};
use stackop_operator::error::{Error, Result};
use stackop_operator::telemetry;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams, Resource};
use kube::core::NamespaceResourceScope;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{field, info, instrument, trace, warn, Span};

pub static OPERATOR_NAME: &str = "prstacks.shop.pilab.hu";
pub static STACK_FINALIZER: &str = "shop.pilab.hu/stack-cleanup";

pub const DB_CREDENTIALS_SECRET: &str = "db-credentials";
pub const REGISTRY_SECRET: &str = "registry-credentials";
pub const RESTORE_ANNOTATION: &str = "shop.pilab.hu/restore-backup";

/// Labels stamped on every object the operator creates.
pub fn stack_labels(stack: &PRStack) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            "stackop".to_string(),
        ),
        (
            "app.kubernetes.io/instance".to_string(),
            stack.name_any(),
        ),
        (
            "shop.pilab.hu/stack-id".to_string(),
            stack.spec.stack_id.clone(),
        ),
    ])
}

impl PRStack {
    pub fn stack_namespace(&self, config: &Config) -> String {
        names::namespace(&self.spec.stack_id, &config.namespace_suffix)
    }

    fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == STACK_FINALIZER)
    }
}

/// Database admin tuple: the stack's override wins over operator defaults.
pub(crate) fn admin_tuple<'a>(stack: &'a PRStack, ctx: &'a Context) -> (&'a str, &'a str, &'a str) {
    (
        stack.spec.db_uri.as_deref().unwrap_or(&ctx.config.db_uri),
        stack.spec.db_user.as_deref().unwrap_or(&ctx.config.db_user),
        stack
            .spec
            .db_password
            .as_deref()
            .unwrap_or(&ctx.config.db_password),
    )
}

/// Idempotent create-or-update through server-side apply. A 422 response
/// (immutable field change) falls back to delete-and-recreate.
pub(crate) async fn apply_namespaced<K>(ctx: &Context, namespace: &str, resource: K) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Serialize
        + Clone
        + std::fmt::Debug
        + DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    let name = resource.name_any();
    let kind = short_type_name::<K>().unwrap_or("resource");
    trace!(msg = format!("applying {kind}"), name, namespace);
    let api = Api::<K>::namespaced(ctx.client.clone(), namespace);
    let params = PatchParams::apply(OPERATOR_NAME).force();
    match api.patch(&name, &params, &Patch::Apply(&resource)).await {
        Ok(applied) => Ok(applied),
        Err(kube::Error::Api(ae)) if ae.code == 422 => {
            info!(
                msg = format!("recreating {kind} because the update was not possible"),
                name,
                reason = ae.reason
            );
            if let Err(e) = api.delete(&name, &Default::default()).await {
                warn!(msg = format!("failed to delete {kind} for recreation"), name, %e);
            }
            api.patch(&name, &params, &Patch::Apply(&resource))
                .await
                .map_err(|e| {
                    Error::KubeError(
                        format!("failed to recreate {kind} {namespace}/{name}"),
                        Box::new(e),
                    )
                })
        }
        Err(e) => Err(Error::KubeError(
            format!("failed to apply {kind} {namespace}/{name}"),
            Box::new(e),
        )),
    }
}

async fn add_finalizer(ctx: &Context, stack: &PRStack) -> Result<()> {
    let name = stack.name_any();
    let finalizers: Vec<String> = stack
        .finalizers()
        .iter()
        .cloned()
        .chain(std::iter::once(STACK_FINALIZER.to_string()))
        .collect();
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    Api::<PRStack>::all(ctx.client.clone())
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| {
            Error::KubeError(format!("failed to add finalizer to {name}"), Box::new(e))
        })?;
    info!(msg = "finalizer added", name);
    Ok(())
}

pub(crate) async fn remove_finalizer(ctx: &Context, stack: &PRStack) -> Result<()> {
    let name = stack.name_any();
    let finalizers: Vec<String> = stack
        .finalizers()
        .iter()
        .filter(|f| *f != STACK_FINALIZER)
        .cloned()
        .collect();
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    Api::<PRStack>::all(ctx.client.clone())
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| {
            Error::KubeError(
                format!("failed to remove finalizer from {name}"),
                Box::new(e),
            )
        })?;
    Ok(())
}

async fn publish(ctx: &Context, stack: &PRStack, type_: EventType, reason: &str, note: &str) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note.to_string()),
        action: "Reconciling".to_string(),
        secondary: None,
    };
    if let Err(e) = ctx.recorder.publish(&event, &stack.object_ref(&())).await {
        warn!(msg = "failed to publish event", reason, %e);
    }
}

fn is_expired(status: &PRStackStatus, now: chrono::DateTime<Utc>, ttl: chrono::Duration) -> bool {
    status
        .last_active_at
        .as_ref()
        .map(|t| now - t.0 >= ttl)
        .unwrap_or(false)
}

/// The single sanctioned spec write: flip `active` off under optimistic
/// concurrency, so a user edit racing the expiration loses cleanly.
async fn deactivate(ctx: &Context, stack: &PRStack) -> Result<()> {
    let name = stack.name_any();
    let mut desired = stack.clone();
    desired.spec.active = false;
    desired.metadata.managed_fields = None;
    Api::<PRStack>::all(ctx.client.clone())
        .replace(&name, &PostParams::default(), &desired)
        .await
        .map_err(|e| {
            Error::KubeError(format!("failed to deactivate stack {name}"), Box::new(e))
        })?;
    Ok(())
}

/// Uniform failure path for side-effecting branches: warning event, message
/// and Degraded condition, then medium requeue for transient errors or
/// `Failed` and a long requeue for permanent ones.
async fn fail_branch(
    ctx: &Context,
    stack: &PRStack,
    mut status: PRStackStatus,
    reason: &str,
    error: Error,
) -> Result<Action> {
    warn!(msg = "reconcile branch failed", reason, %error);
    publish(ctx, stack, EventType::Warning, reason, &error.to_string()).await;
    status.message = Some(error.to_string());
    set_condition(
        &mut status,
        condition(
            TYPE_DEGRADED,
            CONDITION_TRUE,
            reason,
            &error.to_string(),
            stack.metadata.generation,
        ),
    );
    let action = if error.is_permanent() {
        status.phase = Some(StackPhase::Failed);
        Action::requeue(LONG_REQUEUE)
    } else {
        Action::requeue(MEDIUM_REQUEUE)
    };
    patch_status(ctx, &stack.name_any(), &status).await?;
    Ok(action)
}

#[instrument(skip(ctx, stack), fields(trace_id))]
pub async fn reconcile_stack(stack: Arc<PRStack>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    let name = stack.name_any();
    info!(msg = "reconciling stack", name);

    let namespace = stack.stack_namespace(&ctx.config);

    if stack.meta().deletion_timestamp.is_some() {
        if !stack.has_finalizer() {
            return Ok(Action::await_change());
        }
        return cleanup::run(&stack, &ctx, &namespace).await;
    }

    if let Err(e) = validate(&stack.spec) {
        warn!(msg = "spec rejected", name, %e);
        publish(&ctx, &stack, EventType::Warning, "InvalidSpec", &e.to_string()).await;
        let mut status = stack.status.clone().unwrap_or_default();
        status.phase = Some(StackPhase::Failed);
        status.message = Some(e.to_string());
        set_condition(
            &mut status,
            condition(
                TYPE_READY,
                CONDITION_FALSE,
                "InvalidSpec",
                &e.to_string(),
                stack.metadata.generation,
            ),
        );
        patch_status(&ctx, &name, &status).await?;
        // waits for a user edit, no timer
        return Ok(Action::await_change());
    }

    // the finalizer must be in place before any external side effect
    if !stack.has_finalizer() {
        add_finalizer(&ctx, &stack).await?;
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    let now = Utc::now();
    let mut status = stack.status.clone().unwrap_or_default();
    if status.created_at.is_none() {
        status.created_at = Some(Time(now));
        status.last_active_at = Some(Time(now));
    }

    let expired = is_expired(&status, now, ctx.config.expiration_ttl());
    // reactivation is checked before expiration: the tick that flips
    // `active` back on must never also expire the stack. `active` combined
    // with the Expired marker means a user re-enabled a stack the operator
    // had switched off, even when the scale-down tick has not landed yet.
    let reactivated = stack.spec.active
        && (status.phase == Some(StackPhase::Inactive)
            || has_condition(&status, TYPE_EXPIRED, CONDITION_TRUE));
    if reactivated {
        status.last_active_at = Some(Time(now));
        set_condition(
            &mut status,
            condition(
                TYPE_EXPIRED,
                CONDITION_FALSE,
                "Reactivated",
                "stack marked active again",
                stack.metadata.generation,
            ),
        );
        publish(
            &ctx,
            &stack,
            EventType::Normal,
            "Reactivated",
            "stack marked active again",
        )
        .await;
    }

    if !reactivated && stack.spec.active && expired {
        deactivate(&ctx, &stack).await?;
        ctx.metrics.lifecycle.expirations.inc();
        publish(
            &ctx,
            &stack,
            EventType::Warning,
            "StackExpired",
            "no activity within the expiration TTL, scaling down",
        )
        .await;
        status.message = Some("expired after inactivity".to_string());
        set_condition(
            &mut status,
            condition(
                TYPE_EXPIRED,
                CONDITION_TRUE,
                "TTLElapsed",
                "no activity within the expiration TTL",
                stack.metadata.generation,
            ),
        );
        patch_status(&ctx, &name, &status).await?;
        return Ok(Action::requeue(SHORT_REQUEUE));
    }

    if !stack.spec.active {
        if let Err(e) = scale::scale_all(&ctx, &namespace, 0).await {
            return fail_branch(&ctx, &stack, status, "ScaleDownFailed", e).await;
        }
        status.phase = Some(StackPhase::Inactive);
        status.message = Some("scaled to zero".to_string());
        patch_status(&ctx, &name, &status).await?;
        return Ok(Action::requeue(LONG_REQUEUE));
    }

    if let Some(deployed_at) = &stack.spec.deployed_at {
        if status.last_deployed_at.as_ref() != Some(deployed_at) {
            let stamp = deployed_at.0.to_rfc3339_opts(SecondsFormat::Secs, true);
            if let Err(e) = scale::rollout_all(&ctx, &namespace, &stamp).await {
                return fail_branch(&ctx, &stack, status, "RolloutFailed", e).await;
            }
            ctx.metrics.lifecycle.rollouts.inc();
            publish(
                &ctx,
                &stack,
                EventType::Normal,
                "RolloutTriggered",
                &format!("pod templates restamped to {stamp}"),
            )
            .await;
            status.last_deployed_at = Some(deployed_at.clone());
        }
    }

    match status.phase {
        None => {
            status.phase = Some(StackPhase::Provisioning);
            status.message = Some("starting provisioning".to_string());
            patch_status(&ctx, &name, &status).await?;
            Ok(Action::requeue(SHORT_REQUEUE))
        }
        Some(StackPhase::Provisioning) => {
            match provision::run(&stack, &ctx, &namespace, &mut status).await {
                Ok(()) => {
                    patch_status(&ctx, &name, &status).await?;
                    Ok(Action::requeue(SHORT_REQUEUE))
                }
                Err(e) => fail_branch(&ctx, &stack, status, "ProvisioningFailed", e).await,
            }
        }
        Some(StackPhase::Deploying) => {
            match deploy::run(&stack, &ctx, &namespace, &mut status).await {
                Ok(action) => {
                    patch_status(&ctx, &name, &status).await?;
                    Ok(action)
                }
                Err(e) => fail_branch(&ctx, &stack, status, "DeployFailed", e).await,
            }
        }
        Some(StackPhase::Running) | Some(StackPhase::Degraded) => {
            steady(&stack, &ctx, &namespace, status).await
        }
        Some(StackPhase::Inactive) => {
            // only reachable with active=true: restart the lifecycle
            status.phase = None;
            status.message = Some("reactivated, reprovisioning".to_string());
            patch_status(&ctx, &name, &status).await?;
            Ok(Action::requeue(SHORT_REQUEUE))
        }
        Some(StackPhase::Cleaning) => cleanup::run(&stack, &ctx, &namespace).await,
        Some(StackPhase::Cleaned) => Ok(Action::await_change()),
        Some(StackPhase::Failed) => Ok(Action::requeue(LONG_REQUEUE)),
    }
}

/// Steady-state tick for Running and Degraded stacks.
async fn steady(
    stack: &PRStack,
    ctx: &Context,
    namespace: &str,
    mut status: PRStackStatus,
) -> Result<Action> {
    let name = stack.name_any();

    if let Err(e) = scale::scale_all(ctx, namespace, 1).await {
        return fail_branch(ctx, stack, status, "ScaleUpFailed", e).await;
    }

    if let Some(backup_name) = stack.annotations().get(RESTORE_ANNOTATION).cloned() {
        dispatch_restore(stack, ctx, namespace, &backup_name).await?;
    }

    if let Some(backup_config) = stack.spec.backup_config.as_ref().filter(|b| b.enabled) {
        let jobs_api = Api::<Job>::namespaced(ctx.client.clone(), namespace);
        let selector = format!("{COMPONENT_LABEL}=backup");
        match jobs_api.list(&ListParams::default().labels(&selector)).await {
            Ok(jobs) => {
                let mut backup_status = status.backup.clone().unwrap_or_default();
                backup_status.backup_jobs = backup::reflect_jobs(&jobs.items);
                if let Some((job_name, completed)) = backup::latest_success(&jobs.items) {
                    if backup_status.last_backup_name.as_deref() != Some(job_name.as_str()) {
                        info!(msg = "backup completed", job = job_name);
                        backup_status.last_backup_name = Some(job_name);
                        backup_status.last_backup_time = Some(completed);
                        backup_status.backup_count += 1;
                        let retention = backup_config.retention_days.unwrap_or(7);
                        prune_backups(ctx, &stack.spec.stack_id, retention).await;
                    }
                }
                status.backup = Some(backup_status);
            }
            Err(e) => warn!(msg = "failed to list backup jobs", %e),
        }
    }

    let failing: Vec<&str> = status
        .services
        .iter()
        .filter(|s| s.status != ServiceState::Running)
        .map(|s| s.name.as_str())
        .collect();
    status.message = if failing.is_empty() {
        Some("all services running".to_string())
    } else {
        // degraded services stay visible but the phase only changes on a
        // re-deploy
        Some(format!("services not running: {}", failing.join(", ")))
    };

    patch_status(ctx, &name, &status).await?;
    Ok(Action::requeue(LONG_REQUEUE))
}

async fn dispatch_restore(
    stack: &PRStack,
    ctx: &Context,
    namespace: &str,
    backup_name: &str,
) -> Result<()> {
    let name = stack.name_any();
    match backup::restore_job(
        stack,
        namespace,
        &ctx.config.backup_store,
        backup_name,
        Utc::now(),
    ) {
        Ok(job) => {
            let api = Api::<Job>::namespaced(ctx.client.clone(), namespace);
            match api.create(&PostParams::default(), &job).await {
                Ok(_) => {
                    ctx.metrics.lifecycle.backup_jobs.inc();
                    publish(
                        ctx,
                        stack,
                        EventType::Normal,
                        "RestoreJobCreated",
                        &format!("restoring backup {backup_name}"),
                    )
                    .await;
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => warn!(msg = "failed to create restore job", %e),
            }
        }
        Err(e) => warn!(msg = "restore request rejected", %e),
    }
    // the annotation is a one-shot trigger either way
    let patch = json!({ "metadata": { "annotations": { RESTORE_ANNOTATION: null } } });
    Api::<PRStack>::all(ctx.client.clone())
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| {
            Error::KubeError(
                format!("failed to clear restore annotation on {name}"),
                Box::new(e),
            )
        })?;
    Ok(())
}

async fn prune_backups(ctx: &Context, stack_id: &str, retention_days: i64) {
    match backup::store_operator(&ctx.config.backup_store) {
        Ok(op) => {
            match backup::cleanup_old_backups(&op, stack_id, retention_days, Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!(msg = "pruned expired backups", count = n),
                Err(e) => warn!(msg = "backup pruning failed", %e),
            }
        }
        Err(e) => warn!(msg = "backup store unavailable", %e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{PRStackSpec, StackPhase};

    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use http::{Request, Response};
    use k8s_openapi::api::apps::v1::Deployment;
    use kube::client::Body;
    use kube::Client;
    use stackop_operator::controller::State;

    impl PRStack {
        /// Minimal valid stack for reconcile tests.
        pub fn test() -> Self {
            let mut stack = PRStack::new(
                "test-42",
                PRStackSpec {
                    stack_id: "42".into(),
                    active: true,
                    ..PRStackSpec::default()
                },
            );
            stack.meta_mut().resource_version = Some("1".into());
            stack
        }

        pub fn finalized(mut self) -> Self {
            self.meta_mut().finalizers = Some(vec![STACK_FINALIZER.to_string()]);
            self
        }

        pub fn inactive(mut self) -> Self {
            self.spec.active = false;
            self
        }

        pub fn with_stack_id(mut self, id: &str) -> Self {
            self.spec.stack_id = id.to_string();
            self
        }

        pub fn with_status(mut self, status: PRStackStatus) -> Self {
            self.status = Some(status);
            self
        }

        pub fn needs_delete(mut self) -> Self {
            let stamp = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
            self.meta_mut().deletion_timestamp = Some(Time(stamp));
            self
        }
    }

    fn settled_status(phase: StackPhase) -> PRStackStatus {
        let now = Utc::now();
        PRStackStatus {
            phase: Some(phase),
            created_at: Some(Time(now)),
            last_active_at: Some(Time(now)),
            ..PRStackStatus::default()
        }
    }

    fn stale_status(phase: StackPhase) -> PRStackStatus {
        let then = Utc::now() - Duration::hours(2);
        PRStackStatus {
            phase: Some(phase),
            created_at: Some(Time(then)),
            last_active_at: Some(Time(then)),
            ..PRStackStatus::default()
        }
    }

    fn deployment(name: &str, replicas: i32) -> Deployment {
        let mut d = Deployment::default();
        d.metadata.name = Some(name.to_string());
        d.metadata.namespace = Some("pr-42-shop-pilab-hu".to_string());
        d.spec = Some(k8s_openapi::api::apps::v1::DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        });
        d
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    pub struct ApiServerVerifier(ApiServerHandle);

    pub enum Scenario {
        /// First observation: only the finalizer is added.
        FinalizerAdd,
        /// Broken spec: warning event plus a Failed status.
        ValidationFailure,
        /// Empty phase moves to Provisioning.
        InitToProvisioning,
        /// Stale active stack: spec replace, event, status write.
        Expiration(PRStack),
        /// active=false scales deployments down and parks in Inactive.
        InactiveScaleDown,
        /// deployedAt advanced: restamp, event, steady pass, status write.
        Rollout(String),
        /// Inactive but expired stack turned active again in one tick.
        ReactivationWins,
        /// Deletion without recorded credentials: namespace, status,
        /// finalizer.
        CleanupWithoutCredentials,
    }

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl ApiServerVerifier {
        pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::FinalizerAdd => self.handle_finalizer_add().await.map(|_| ()),
                    Scenario::ValidationFailure => {
                        self.handle_event_publish()
                            .await
                            .unwrap()
                            .handle_status_patch(Some("Failed"))
                            .await
                            .map(|_| ())
                    }
                    Scenario::InitToProvisioning => self
                        .handle_status_patch(Some("Provisioning"))
                        .await
                        .map(|_| ()),
                    Scenario::Expiration(stack) => {
                        self.handle_replace_deactivated(stack)
                            .await
                            .unwrap()
                            .handle_event_publish()
                            .await
                            .unwrap()
                            .handle_status_patch(None)
                            .await
                            .map(|_| ())
                    }
                    Scenario::InactiveScaleDown => {
                        self.handle_deployment_list(vec![deployment("products-service", 1)])
                            .await
                            .unwrap()
                            .handle_deployment_patch("products-service", |body| {
                                assert_eq!(body["spec"]["replicas"], 0);
                            })
                            .await
                            .unwrap()
                            .handle_status_patch(Some("Inactive"))
                            .await
                            .map(|_| ())
                    }
                    Scenario::Rollout(stamp) => {
                        self.handle_deployment_list(vec![deployment("products-service", 1)])
                            .await
                            .unwrap()
                            .handle_deployment_patch("products-service", move |body| {
                                assert_eq!(
                                    body["spec"]["template"]["metadata"]["annotations"]
                                        ["restartedAt"],
                                    stamp.as_str(),
                                );
                            })
                            .await
                            .unwrap()
                            .handle_event_publish()
                            .await
                            .unwrap()
                            .handle_deployment_list(vec![deployment("products-service", 1)])
                            .await
                            .unwrap()
                            .handle_status_patch(Some("Running"))
                            .await
                            .map(|_| ())
                    }
                    Scenario::ReactivationWins => {
                        self.handle_event_publish()
                            .await
                            .unwrap()
                            .handle_status_patch(None)
                            .await
                            .map(|_| ())
                    }
                    Scenario::CleanupWithoutCredentials => {
                        self.handle_namespace_delete_not_found()
                            .await
                            .unwrap()
                            .handle_status_patch(Some("Cleaned"))
                            .await
                            .unwrap()
                            .handle_finalizer_remove()
                            .await
                            .map(|_| ())
                    }
                }
                .expect("scenario completed without errors");
            })
        }

        async fn next_json(
            &mut self,
        ) -> (http::request::Parts, serde_json::Value, tower_test::mock::SendResponse<Response<Body>>)
        {
            let (request, send) = self.0.next_request().await.expect("service not called");
            let (parts, body) = request.into_parts();
            let bytes = body.collect_bytes().await.unwrap();
            let json = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).expect("request body is json")
            };
            (parts, json, send)
        }

        fn respond_stack(send: tower_test::mock::SendResponse<Response<Body>>) {
            let body = serde_json::to_vec(&serde_json::json!({
                "apiVersion": "shop.pilab.hu/v1alpha1",
                "kind": "PRStack",
                "metadata": { "name": "test-42", "resourceVersion": "2" },
                "spec": { "stackID": "42" },
            }))
            .unwrap();
            send.send_response(Response::builder().body(Body::from(body)).unwrap());
        }

        async fn handle_finalizer_add(mut self) -> Result<Self> {
            let (parts, json, send) = self.next_json().await;
            assert_eq!(parts.method, http::Method::PATCH);
            assert_eq!(
                parts.uri.to_string(),
                "/apis/shop.pilab.hu/v1alpha1/prstacks/test-42?"
            );
            let finalizers = json["metadata"]["finalizers"].as_array().unwrap();
            assert!(finalizers
                .iter()
                .any(|f| f == "shop.pilab.hu/stack-cleanup"));
            Self::respond_stack(send);
            Ok(self)
        }

        async fn handle_finalizer_remove(mut self) -> Result<Self> {
            let (parts, json, send) = self.next_json().await;
            assert_eq!(parts.method, http::Method::PATCH);
            assert_eq!(
                parts.uri.to_string(),
                "/apis/shop.pilab.hu/v1alpha1/prstacks/test-42?"
            );
            let finalizers = json["metadata"]["finalizers"].as_array().unwrap();
            assert!(finalizers.is_empty(), "finalizer removed in final patch");
            Self::respond_stack(send);
            Ok(self)
        }

        async fn handle_status_patch(mut self, expected_phase: Option<&str>) -> Result<Self> {
            let (parts, json, send) = self.next_json().await;
            assert_eq!(parts.method, http::Method::PATCH);
            assert_eq!(
                parts.uri.to_string(),
                format!(
                    "/apis/shop.pilab.hu/v1alpha1/prstacks/test-42/status?&force=true&fieldManager={}",
                    "prstacks.shop.pilab.hu"
                )
            );
            match expected_phase {
                Some(phase) => assert_eq!(json["status"]["phase"], phase),
                None => {}
            }
            Self::respond_stack(send);
            Ok(self)
        }

        async fn handle_event_publish(mut self) -> Result<Self> {
            let (parts, json, send) = self.next_json().await;
            assert_eq!(parts.method, http::Method::POST);
            assert!(
                parts
                    .uri
                    .to_string()
                    .starts_with("/apis/events.k8s.io/v1/namespaces/default/events"),
                "unexpected event uri {}",
                parts.uri
            );
            let body = serde_json::to_vec(&json).unwrap();
            send.send_response(
                Response::builder()
                    .status(201)
                    .body(Body::from(body))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn handle_replace_deactivated(mut self, stack: PRStack) -> Result<Self> {
            let (parts, json, send) = self.next_json().await;
            assert_eq!(parts.method, http::Method::PUT);
            assert_eq!(
                parts.uri.to_string(),
                "/apis/shop.pilab.hu/v1alpha1/prstacks/test-42?"
            );
            assert_eq!(json["spec"]["active"], false, "expiration writes active=false");
            assert_eq!(
                json["metadata"]["resourceVersion"],
                stack.metadata.resource_version.as_deref().unwrap(),
                "replace carries the resource version for optimistic concurrency"
            );
            let body = serde_json::to_vec(&json).unwrap();
            send.send_response(Response::builder().body(Body::from(body)).unwrap());
            Ok(self)
        }

        async fn handle_deployment_list(mut self, items: Vec<Deployment>) -> Result<Self> {
            let (parts, _, send) = self.next_json().await;
            assert_eq!(parts.method, http::Method::GET);
            assert!(
                parts.uri.to_string().starts_with(
                    "/apis/apps/v1/namespaces/pr-42-shop-pilab-hu/deployments"
                ),
                "unexpected list uri {}",
                parts.uri
            );
            let body = serde_json::to_vec(&serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "DeploymentList",
                "metadata": {},
                "items": items,
            }))
            .unwrap();
            send.send_response(Response::builder().body(Body::from(body)).unwrap());
            Ok(self)
        }

        async fn handle_deployment_patch(
            mut self,
            name: &str,
            assert_body: impl FnOnce(&serde_json::Value) + Send,
        ) -> Result<Self> {
            let (parts, json, send) = self.next_json().await;
            assert_eq!(parts.method, http::Method::PATCH);
            assert_eq!(
                parts.uri.to_string(),
                format!("/apis/apps/v1/namespaces/pr-42-shop-pilab-hu/deployments/{name}?")
            );
            assert_body(&json);
            let body = serde_json::to_vec(&json).unwrap();
            send.send_response(Response::builder().body(Body::from(body)).unwrap());
            Ok(self)
        }

        async fn handle_namespace_delete_not_found(mut self) -> Result<Self> {
            let (parts, _, send) = self.next_json().await;
            assert_eq!(parts.method, http::Method::DELETE);
            assert_eq!(
                parts.uri.to_string(),
                "/api/v1/namespaces/pr-42-shop-pilab-hu?"
            );
            let body = serde_json::to_vec(&serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "reason": "NotFound",
                "code": 404,
            }))
            .unwrap();
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(body))
                    .unwrap(),
            );
            Ok(self)
        }
    }

    pub fn get_test_context() -> (Arc<Context>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let ctx = State::new(Default::default()).to_context(client);
        (ctx, ApiServerVerifier(handle))
    }

    #[tokio::test]
    async fn stack_gets_finalizer_first() {
        let (ctx, fakeserver) = get_test_context();
        let stack = PRStack::test();
        let mocksrv = fakeserver.run(Scenario::FinalizerAdd);
        reconcile_stack(Arc::new(stack), ctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn invalid_spec_parks_in_failed() {
        let (ctx, fakeserver) = get_test_context();
        let stack = PRStack::test().with_stack_id("bad id!").finalized();
        let mocksrv = fakeserver.run(Scenario::ValidationFailure);
        let action = reconcile_stack(Arc::new(stack), ctx)
            .await
            .expect("reconciler");
        assert_eq!(action, Action::await_change(), "no timer requeue");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn empty_phase_moves_to_provisioning() {
        let (ctx, fakeserver) = get_test_context();
        let stack = PRStack::test().finalized();
        let mocksrv = fakeserver.run(Scenario::InitToProvisioning);
        reconcile_stack(Arc::new(stack), ctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn stale_stack_expires() {
        let (ctx, fakeserver) = get_test_context();
        let stack = PRStack::test()
            .finalized()
            .with_status(stale_status(StackPhase::Running));
        let mocksrv = fakeserver.run(Scenario::Expiration(stack.clone()));
        reconcile_stack(Arc::new(stack), ctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn inactive_stack_scales_to_zero() {
        let (ctx, fakeserver) = get_test_context();
        let stack = PRStack::test()
            .finalized()
            .inactive()
            .with_status(settled_status(StackPhase::Running));
        let mocksrv = fakeserver.run(Scenario::InactiveScaleDown);
        reconcile_stack(Arc::new(stack), ctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn advanced_deployed_at_triggers_one_rollout() {
        let (ctx, fakeserver) = get_test_context();
        let deployed = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut stack = PRStack::test()
            .finalized()
            .with_status(settled_status(StackPhase::Running));
        stack.spec.deployed_at = Some(Time(deployed));
        let mocksrv = fakeserver.run(Scenario::Rollout("2025-01-01T00:00:00Z".to_string()));
        reconcile_stack(Arc::new(stack), ctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn reactivation_beats_expiration_in_one_tick() {
        let (ctx, fakeserver) = get_test_context();
        // inactive AND long past the TTL, user just set active=true
        let stack = PRStack::test()
            .finalized()
            .with_status(stale_status(StackPhase::Inactive));
        let mocksrv = fakeserver.run(Scenario::ReactivationWins);
        reconcile_stack(Arc::new(stack), ctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn deletion_without_credentials_cleans_and_releases() {
        let (ctx, fakeserver) = get_test_context();
        let stack = PRStack::test().finalized().needs_delete();
        let mocksrv = fakeserver.run(Scenario::CleanupWithoutCredentials);
        let action = reconcile_stack(Arc::new(stack), ctx)
            .await
            .expect("reconciler");
        assert_eq!(action, Action::await_change());
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn deletion_without_finalizer_is_a_noop() {
        let (ctx, _fakeserver) = get_test_context();
        let stack = PRStack::test().needs_delete();
        let action = reconcile_stack(Arc::new(stack), ctx)
            .await
            .expect("reconciler");
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn expiration_boundary_is_inclusive() {
        let ttl = Duration::hours(1);
        let now = Utc::now();
        let exactly = PRStackStatus {
            last_active_at: Some(Time(now - ttl)),
            ..PRStackStatus::default()
        };
        assert!(is_expired(&exactly, now, ttl), "exactly TTL ago expires");
        let fresh = PRStackStatus {
            last_active_at: Some(Time(now)),
            ..PRStackStatus::default()
        };
        assert!(!is_expired(&fresh, now, ttl));
        assert!(!is_expired(&PRStackStatus::default(), now, ttl));
    }
}

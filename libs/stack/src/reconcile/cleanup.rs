//! Teardown. Ordering matters: the database tier lives outside the
//! namespace, so Kubernetes-scoped resources go first and the finalizer is
//! removed only after every external system is clean.

use crate::backup::backup_job;
use crate::crd::{PRStack, PRStackStatus, StackPhase};
use crate::db::DbAdmin;
use crate::reconcile::status::patch_status;
use crate::reconcile::{admin_tuple, remove_finalizer};

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use stackop_operator::controller::{Context, MEDIUM_REQUEUE};
use stackop_operator::error::{Error, Result};
use tracing::{info, warn};

pub async fn run(stack: &PRStack, ctx: &Context, namespace: &str) -> Result<Action> {
    let name = stack.name_any();
    let mut status = stack.status.clone().unwrap_or_default();
    status.phase = Some(StackPhase::Cleaning);

    // final backup is best-effort; teardown proceeds even when the job
    // cannot be created
    let backup_enabled = stack
        .spec
        .backup_config
        .as_ref()
        .map(|b| b.enabled)
        .unwrap_or(false);
    if backup_enabled && status.db_credentials.is_some() {
        match backup_job(stack, namespace, &ctx.config.backup_store, Utc::now()) {
            Ok(job) => {
                let api = Api::<Job>::namespaced(ctx.client.clone(), namespace);
                if let Err(e) = api.create(&PostParams::default(), &job).await {
                    warn!(msg = "failed to dispatch final backup job", %e);
                } else {
                    ctx.metrics.lifecycle.backup_jobs.inc();
                    info!(msg = "final backup job dispatched", namespace);
                }
            }
            Err(e) => warn!(msg = "failed to build final backup job", %e),
        }
    }

    // deleting the namespace cascades everything the stack owns inside
    // Kubernetes
    let namespaces = Api::<Namespace>::all(ctx.client.clone());
    match namespaces.delete(namespace, &Default::default()).await {
        Ok(_) => info!(msg = "namespace deleted", namespace),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => {
            return stall(
                ctx,
                &name,
                status,
                Error::KubeError(format!("failed to delete namespace {namespace}"), Box::new(e)),
            )
            .await;
        }
    }

    if let Some(credentials) = status.db_credentials.clone() {
        let (uri, admin_user, admin_password) = admin_tuple(stack, ctx);
        let admin = match DbAdmin::connect(uri, admin_user, admin_password).await {
            Ok(admin) => admin,
            Err(e) => return stall(ctx, &name, status, e).await,
        };

        let mut failed = Vec::new();
        for database in &credentials.databases {
            // best-effort sweep: a failed drop is retried next tick, the
            // rest of the loop still runs
            if let Err(e) = admin.drop_database(database).await {
                warn!(msg = "failed to drop database", database, %e);
                failed.push(database.clone());
            }
        }
        if !failed.is_empty() {
            return stall(
                ctx,
                &name,
                status,
                Error::InconsistentState(format!("databases not dropped: {}", failed.join(", "))),
            )
            .await;
        }

        if let Err(e) = admin.drop_user(&credentials.user).await {
            return stall(ctx, &name, status, e).await;
        }
    }

    // bus subjects and cache keys lived inside the namespace; nothing
    // shared is left behind

    status.phase = Some(StackPhase::Cleaned);
    status.message = Some("cleanup complete".to_string());
    // the status write precedes finalizer removal so the record of success
    // is not lost with the object
    patch_status(ctx, &name, &status).await?;
    remove_finalizer(ctx, stack).await?;
    info!(msg = "stack cleaned", name);
    Ok(Action::await_change())
}

async fn stall(
    ctx: &Context,
    name: &str,
    mut status: PRStackStatus,
    error: Error,
) -> Result<Action> {
    warn!(msg = "cleanup incomplete, retrying", name, %error);
    status.message = Some(error.to_string());
    patch_status(ctx, name, &status).await?;
    Ok(Action::requeue(MEDIUM_REQUEUE))
}

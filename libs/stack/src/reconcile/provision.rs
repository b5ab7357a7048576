//! The Provisioning branch: namespace, database tier, credential secret and
//! endpoint coordinates. Every step is replayable; re-entering after a crash
//! converges because the user is dropped before being recreated and all
//! Kubernetes writes are server-side applies.

use crate::crd::{CacheStatus, DbCredentials, MessageBusStatus, PRStack, PRStackStatus, StackPhase};
use crate::db::DbAdmin;
use crate::names;
use crate::reconcile::status::{condition, set_condition, CONDITION_TRUE, TYPE_PROGRESSING};
use crate::reconcile::{
    admin_tuple, apply_namespaced, stack_labels, DB_CREDENTIALS_SECRET, OPERATOR_NAME,
};
use crate::services::effective_services;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, ObjectMeta, Patch, PatchParams, Resource};
use stackop_operator::controller::Context;
use stackop_operator::error::{Error, Result};
use tracing::{debug, info};

pub async fn run(
    stack: &PRStack,
    ctx: &Context,
    namespace: &str,
    status: &mut PRStackStatus,
) -> Result<()> {
    let stack_id = &stack.spec.stack_id;
    ensure_namespace(stack, ctx, namespace).await?;

    let services = effective_services(&stack.spec);
    let databases: Vec<String> = services
        .iter()
        .map(|service| names::database(stack_id, service))
        .collect();

    let user = names::database_user(stack_id);
    let password = names::generate_password();
    let (uri, admin_user, admin_password) = admin_tuple(stack, ctx);

    let admin = DbAdmin::connect(uri, admin_user, admin_password).await?;
    admin.ping().await?;
    // drop-then-create keeps re-entry at exactly one principal per stack;
    // the databases themselves are preserved
    admin.drop_user(&user).await?;
    admin.create_user(&user, &password, &databases).await?;
    for (service, database) in services.iter().zip(&databases) {
        admin.ensure_collection_set(database, service).await?;
    }
    info!(
        msg = "database tier provisioned",
        user,
        databases = databases.len()
    );

    let credentials = DbCredentials {
        connection_string: names::connection_string(uri, &user, &password),
        user,
        password,
        databases,
    };
    status.db_credentials = Some(credentials.clone());

    apply_namespaced(ctx, namespace, credentials_secret(stack, namespace, &credentials)).await?;

    // the bus and cache run inside the namespace and come up during
    // Deploying; only their coordinates are fixed here
    status.message_bus = Some(MessageBusStatus {
        url: names::bus_url(namespace),
        subject_prefix: names::subject_prefix(stack_id),
    });
    status.cache = Some(CacheStatus {
        url: names::cache_url(namespace),
        key_prefix: names::key_prefix(stack_id),
    });
    status.host = Some(names::hostname(
        stack_id,
        &ctx.config.base_domain,
        stack.spec.custom_domain.as_deref(),
    ));

    status.phase = Some(StackPhase::Deploying);
    status.message = Some("provisioned, deploying services".to_string());
    set_condition(
        status,
        condition(
            TYPE_PROGRESSING,
            CONDITION_TRUE,
            "Provisioned",
            "namespace and database tier are ready",
            stack.metadata.generation,
        ),
    );
    Ok(())
}

/// The namespace carries the stack labels but no owner reference; its
/// lifetime is governed by the finalizer path.
async fn ensure_namespace(stack: &PRStack, ctx: &Context, namespace: &str) -> Result<()> {
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(stack_labels(stack)),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    };
    debug!(msg = "ensuring namespace", namespace);
    let api = Api::<Namespace>::all(ctx.client.clone());
    api.patch(
        namespace,
        &PatchParams::apply(OPERATOR_NAME).force(),
        &Patch::Apply(&ns),
    )
    .await
    .map_err(|e| Error::KubeError(format!("failed to apply namespace {namespace}"), Box::new(e)))?;
    Ok(())
}

fn credentials_secret(stack: &PRStack, namespace: &str, credentials: &DbCredentials) -> Secret {
    let data = BTreeMap::from([
        ("username".to_string(), credentials.user.clone()),
        ("password".to_string(), credentials.password.clone()),
        (
            "connectionString".to_string(),
            credentials.connection_string.clone(),
        ),
        ("databases".to_string(), credentials.databases.join(",")),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(DB_CREDENTIALS_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(stack_labels(stack)),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        string_data: Some(data),
        ..Secret::default()
    }
}

#[cfg(test)]
mod test {
    use super::credentials_secret;
    use crate::crd::{DbCredentials, PRStack, PRStackSpec};

    #[test]
    fn test_credentials_secret_layout() {
        let stack = PRStack::new(
            "test-42",
            PRStackSpec {
                stack_id: "42".into(),
                active: true,
                ..PRStackSpec::default()
            },
        );
        let creds = DbCredentials {
            user: "pishop_pr_42".into(),
            password: "pw".into(),
            connection_string: "mongodb://pishop_pr_42:pw@db:27017".into(),
            databases: vec![
                "pishop_products_pr_42".into(),
                "pishop_orders_pr_42".into(),
            ],
        };
        let secret = credentials_secret(&stack, "pr-42-shop-pilab-hu", &creds);

        assert_eq!(secret.metadata.name.as_deref(), Some("db-credentials"));
        let data = secret.string_data.unwrap();
        assert_eq!(data["username"], "pishop_pr_42");
        assert_eq!(
            data["databases"],
            "pishop_products_pr_42,pishop_orders_pr_42"
        );
        assert!(data["connectionString"].starts_with("mongodb://pishop_pr_42:"));
    }
}

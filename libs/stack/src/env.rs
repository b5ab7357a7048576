//! Container environment rendering. Every service gets the shared
//! connection environment; per-service tunables come from a data-driven
//! registry keyed by logical name instead of a branch per microservice.

use crate::names::{self, logical_name};
use crate::reconcile::DB_CREDENTIALS_SECRET;

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, SecretKeySelector};

/// Tunables per logical service, applied on top of the shared environment.
const SERVICE_TUNABLES: &[(&str, &[(&str, &str)])] = &[
    ("products", &[
        ("PRODUCT_PAGE_SIZE", "24"),
        ("PRODUCT_CACHE_TTL_SECONDS", "300"),
    ]),
    ("orders", &[
        ("ORDER_NUMBER_PREFIX", "PR"),
        ("ORDER_PAYMENT_TIMEOUT_SECONDS", "900"),
    ]),
    ("customers", &[("CUSTOMER_SESSION_TTL_SECONDS", "86400")]),
    ("carts", &[("CART_TTL_SECONDS", "172800")]),
    ("payments", &[("PAYMENT_PROVIDER", "sandbox")]),
    ("inventory", &[("INVENTORY_SYNC_INTERVAL_SECONDS", "60")]),
    ("reviews", &[("REVIEW_MODERATION", "manual")]),
    ("categories", &[("CATEGORY_CACHE_TTL_SECONDS", "600")]),
];

fn env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..EnvVar::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

/// Connection-string reference used by service containers and backup jobs
/// alike. Credentials stay in the secret.
pub fn mongodb_uri_env() -> EnvVar {
    secret_env("MONGODB_URI", DB_CREDENTIALS_SECRET, "connectionString")
}

/// Environment for one service container. Credentials are referenced by
/// secret key, never inlined.
pub fn render_service_env(service: &str, stack_id: &str, namespace: &str) -> Vec<EnvVar> {
    let logical = logical_name(service);
    let base = vec![
        env("PORT", "8080".to_string()),
        env("STACK_ID", stack_id.to_string()),
        env("SERVICE_NAME", service.to_string()),
        env("MONGODB_DATABASE", names::database(stack_id, service)),
        mongodb_uri_env(),
        env("NATS_URL", names::bus_url(namespace)),
        env("NATS_SUBJECT_PREFIX", names::subject_prefix(stack_id)),
        env("REDIS_URL", names::cache_url(namespace)),
        env("REDIS_KEY_PREFIX", names::key_prefix(stack_id)),
    ];

    let extras = SERVICE_TUNABLES
        .iter()
        .find(|(name, _)| *name == logical)
        .map(|(_, vars)| vars.iter())
        .into_iter()
        .flatten()
        .map(|(name, value)| env(name, value.to_string()));

    base.into_iter().chain(extras).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::services::DEFAULT_SERVICES;

    #[test]
    fn test_shared_env_present_for_every_service() {
        for service in DEFAULT_SERVICES {
            let envs = render_service_env(service, "42", "pr-42-shop-pilab-hu");
            for expected in ["PORT", "MONGODB_URI", "MONGODB_DATABASE", "NATS_URL", "REDIS_URL"] {
                assert!(
                    envs.iter().any(|e| e.name == expected),
                    "{service} missing {expected}"
                );
            }
        }
    }

    #[test]
    fn test_database_env_is_per_service() {
        let envs = render_service_env("products-service", "42", "pr-42-shop-pilab-hu");
        let db = envs
            .iter()
            .find(|e| e.name == "MONGODB_DATABASE")
            .and_then(|e| e.value.clone());
        assert_eq!(db.as_deref(), Some("pishop_products_pr_42"));
    }

    #[test]
    fn test_credentials_come_from_secret_ref() {
        let envs = render_service_env("orders-service", "42", "pr-42-shop-pilab-hu");
        let uri = envs.iter().find(|e| e.name == "MONGODB_URI").unwrap();
        assert!(uri.value.is_none());
        let selector = uri
            .value_from
            .as_ref()
            .and_then(|s| s.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(selector.name, "db-credentials");
        assert_eq!(selector.key, "connectionString");
    }

    #[test]
    fn test_tunables_applied_by_logical_name() {
        let envs = render_service_env("carts-service", "42", "pr-42-shop-pilab-hu");
        assert!(envs.iter().any(|e| e.name == "CART_TTL_SECONDS"));
        assert!(!envs.iter().any(|e| e.name == "PRODUCT_PAGE_SIZE"));
    }
}

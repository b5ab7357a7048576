//! The workload catalogue: which services a stack deploys by default, and
//! the collection and index set each logical service expects in its
//! database.

use crate::crd::PRStackSpec;
use crate::names::logical_name;

/// Deployed when `spec.services` is empty. Workload names carry the
/// `-service` suffix; their logical names key [`collection_spec`].
pub const DEFAULT_SERVICES: &[&str] = &[
    "products-service",
    "orders-service",
    "customers-service",
    "carts-service",
];

/// Workload set for a stack: `spec.services` verbatim, or the default set.
pub fn effective_services(spec: &PRStackSpec) -> Vec<String> {
    if spec.services.is_empty() {
        DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect()
    } else {
        spec.services.clone()
    }
}

/// The front door is the head of the effective service set; only its
/// Service gets an Ingress.
pub fn front_door(services: &[String]) -> Option<&str> {
    services.first().map(String::as_str)
}

pub struct IndexSpec {
    pub key: &'static str,
    pub unique: bool,
}

pub struct CollectionSpec {
    pub collection: &'static str,
    pub indexes: &'static [IndexSpec],
}

const fn idx(key: &'static str) -> IndexSpec {
    IndexSpec { key, unique: false }
}

const fn uniq(key: &'static str) -> IndexSpec {
    IndexSpec { key, unique: true }
}

/// Collection and index declarations per logical service. An unknown
/// logical name has no entry and must be rejected before provisioning.
pub fn collection_spec(logical: &str) -> Option<&'static CollectionSpec> {
    static PRODUCTS: CollectionSpec = CollectionSpec {
        collection: "products",
        indexes: &[uniq("slug"), uniq("sku"), idx("category_id"), idx("is_active")],
    };
    static ORDERS: CollectionSpec = CollectionSpec {
        collection: "orders",
        indexes: &[uniq("order_number"), idx("user_id"), idx("status"), idx("created_at")],
    };
    static CUSTOMERS: CollectionSpec = CollectionSpec {
        collection: "customers",
        indexes: &[uniq("email"), uniq("user_id")],
    };
    static CARTS: CollectionSpec = CollectionSpec {
        collection: "carts",
        indexes: &[uniq("user_id"), idx("session_id")],
    };
    static PAYMENTS: CollectionSpec = CollectionSpec {
        collection: "payments",
        indexes: &[uniq("transaction_id"), idx("order_id"), idx("status")],
    };
    static INVENTORY: CollectionSpec = CollectionSpec {
        collection: "inventory",
        indexes: &[uniq("sku"), idx("warehouse_id")],
    };
    static REVIEWS: CollectionSpec = CollectionSpec {
        collection: "reviews",
        indexes: &[idx("product_id"), idx("user_id"), idx("created_at")],
    };
    static CATEGORIES: CollectionSpec = CollectionSpec {
        collection: "categories",
        indexes: &[uniq("slug"), idx("parent_id")],
    };

    match logical {
        "products" => Some(&PRODUCTS),
        "orders" => Some(&ORDERS),
        "customers" => Some(&CUSTOMERS),
        "carts" => Some(&CARTS),
        "payments" => Some(&PAYMENTS),
        "inventory" => Some(&INVENTORY),
        "reviews" => Some(&REVIEWS),
        "categories" => Some(&CATEGORIES),
        _ => None,
    }
}

/// Whether a workload name resolves to a known logical service.
pub fn is_known_service(service: &str) -> bool {
    collection_spec(logical_name(service)).is_some()
}

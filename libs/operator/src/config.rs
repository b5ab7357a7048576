use std::path::PathBuf;

use chrono::Duration;

/// Where backup archives are enumerated and deleted. The filesystem variant
/// points at a PVC-mounted path in-cluster; S3 is the shared bucket layout.
#[derive(Clone, Debug)]
pub enum BackupStore {
    Filesystem {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
}

/// Process-wide operator configuration, resolved once from flags and
/// environment at startup and shared through the reconcile context.
#[derive(Clone, Debug)]
pub struct Config {
    /// Admin connection URI for the shared database cluster.
    pub db_uri: String,
    pub db_user: String,
    pub db_password: String,

    /// Default host suffix for stack ingresses.
    pub base_domain: String,
    /// Fixed suffix appended to every stack namespace name.
    pub namespace_suffix: String,
    /// Registry and organization prefix for service images,
    /// e.g. `ghcr.io/pilab-dev`.
    pub registry_prefix: String,

    pub registry_user: Option<String>,
    pub registry_token: Option<String>,
    pub registry_email: Option<String>,

    /// Seconds of inactivity after which an active stack is expired.
    pub expiration_ttl_secs: i64,

    pub backup_store: BackupStore,
}

impl Config {
    pub fn expiration_ttl(&self) -> Duration {
        Duration::seconds(self.expiration_ttl_secs)
    }

    /// Registry credentials are optional; when absent the image-pull secret
    /// is skipped and public images are assumed.
    pub fn registry_credentials(&self) -> Option<(&str, &str, &str)> {
        match (
            self.registry_user.as_deref(),
            self.registry_token.as_deref(),
        ) {
            (Some(user), Some(token)) if !user.is_empty() && !token.is_empty() => {
                Some((user, token, self.registry_email.as_deref().unwrap_or("")))
            }
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_uri: "mongodb://localhost:27017".to_string(),
            db_user: "admin".to_string(),
            db_password: "password".to_string(),
            base_domain: "shop.pilab.hu".to_string(),
            namespace_suffix: "shop-pilab-hu".to_string(),
            registry_prefix: "ghcr.io/pilab-dev".to_string(),
            registry_user: None,
            registry_token: None,
            registry_email: None,
            expiration_ttl_secs: 3600,
            backup_store: BackupStore::Filesystem {
                root: PathBuf::from("/var/lib/stackop/backups"),
            },
        }
    }
}

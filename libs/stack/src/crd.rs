use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The `PRStack` custom resource describes one ephemeral review environment:
/// an isolated namespace, per-service databases and a dedicated database
/// user on the shared cluster, message-bus and cache endpoints, the service
/// deployments, an ingress, and an optional backup pipeline. The operator
/// drives the cluster toward this spec and reports progress in the status
/// subresource.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "shop.pilab.hu",
    version = "v1alpha1",
    kind = "PRStack",
    plural = "prstacks",
    singular = "prstack",
    shortname = "prs",
    status = "PRStackStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"StackID","type":"string","jsonPath":".spec.stackID"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".status.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct PRStackSpec {
    /// Short identifier of the environment, usually the pull-request number.
    /// Participates in every derived name.
    #[serde(rename = "stackID")]
    pub stack_id: String,

    /// Image tag applied to every service image. Defaults to `pr-<stackID>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Overrides the default `pr-<stackID>.<baseDomain>` ingress host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,

    /// Name of a TLS secret in the stack namespace. When set, the ingress
    /// terminates TLS with this material.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_tls_secret_ref: Option<String>,

    /// When false every deployment in the stack namespace is scaled to zero.
    /// Flipped to false automatically after the expiration TTL elapses.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Advancing this timestamp re-stamps every pod template in the
    /// namespace, forcing a rolling restart without an image change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<Time>,

    /// Ordered set of workload names to deploy. Empty means the built-in
    /// default set. The first entry is the front door and receives the
    /// ingress.
    #[serde(default)]
    pub services: Vec<String>,

    /// Per-container resource limits. Defaults apply when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,

    /// Backup pipeline configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_config: Option<BackupConfig>,

    /// Override of the operator-wide database admin connection URI.
    #[serde(rename = "dbURI", skip_serializing_if = "Option::is_none")]
    pub db_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_password: Option<String>,
}

fn default_active() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU limit as a Kubernetes quantity, e.g. `500m`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory limit as a Kubernetes quantity, e.g. `512Mi`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Ephemeral storage limit as a Kubernetes quantity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Standard 5-field cron expression for scheduled backups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_schedule: Option<String>,

    /// Days to keep archives in the backup store. 0 disables pruning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<i64>,

    /// Storage class of the `backup-store` volume claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the `backup-store` volume claim, e.g. `10Gi`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
}

/// Observed state of a stack. Owned by the operator; users only read it.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PRStackStatus {
    /// Current lifecycle phase. Absent until the first provisioning tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<StackPhase>,

    /// Human-readable summary of the last reconcile outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Hostname the ingress serves for this stack.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Time>,

    /// Advanced on creation and on every reactivation; drives expiration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<Time>,

    /// Copy of `spec.deployedAt` taken after a successful rollout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_deployed_at: Option<Time>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_credentials: Option<DbCredentials>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_bus: Option<MessageBusStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStatus>,

    /// Per-service deployment outcome of the last Deploying pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupStatus>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum StackPhase {
    Provisioning,
    Deploying,
    Running,
    Degraded,
    Inactive,
    Cleaning,
    Cleaned,
    Failed,
}

serde_plain::derive_display_from_serialize!(StackPhase);

/// Per-stack database principal and the databases it was granted on.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DbCredentials {
    pub user: String,
    pub password: String,
    /// Admin URI with the per-stack user and password injected.
    pub connection_string: String,
    pub databases: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageBusStatus {
    pub url: String,
    pub subject_prefix: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub url: String,
    pub key_prefix: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub status: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ServiceState {
    Running,
    Failed,
}

serde_plain::derive_display_from_serialize!(ServiceState);

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_time: Option<Time>,

    /// Completed backups observed over the stack lifetime.
    #[serde(default)]
    pub backup_count: i64,

    /// Backup and restore jobs currently tracked in the namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_jobs: Vec<BackupJobStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupJobStatus {
    pub name: String,
    pub kind: BackupJobKind,
    pub state: BackupJobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BackupJobKind {
    Backup,
    Restore,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BackupJobState {
    Active,
    Succeeded,
    Failed,
}

serde_plain::derive_display_from_serialize!(BackupJobState);

//! Backup and restore dispatch. Both operations are one-shot Jobs running a
//! database-client image in the stack namespace; the archive store is
//! enumerated through a real backend (PVC-mounted path or S3), never from
//! remembered names.

use crate::crd::{BackupJobKind, BackupJobState, BackupJobStatus, PRStack};
use crate::names;
use crate::reconcile::stack_labels;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ObjectMeta, Resource};
use opendal::{services, Operator};
use stackop_operator::config::BackupStore;
use stackop_operator::error::{Error, Result};
use tracing::debug;

const BACKUP_IMAGE: &str = "mongo:7.0";
const BACKUP_SCRIPT: &str = "/usr/local/bin/stack-backup.sh";
const RESTORE_SCRIPT: &str = "/usr/local/bin/stack-restore.sh";
const JOB_TTL_SECONDS: i32 = 3600;

pub const BACKUP_PVC_NAME: &str = "backup-store";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const KIND_LABEL: &str = "shop.pilab.hu/backup-kind";

/// Object-store prefix holding every archive of one stack.
pub fn backup_prefix(stack_id: &str) -> String {
    format!("backups/{stack_id}/")
}

/// Compact timestamp used in job names and archive names.
pub fn backup_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

pub fn backup_job_name(stack_id: &str, now: DateTime<Utc>) -> String {
    format!("backup-{stack_id}-{}", backup_stamp(now))
}

pub fn restore_job_name(stack_id: &str, now: DateTime<Utc>) -> String {
    format!("restore-{stack_id}-{}", backup_stamp(now))
}

fn job_labels(stack: &PRStack, kind: BackupJobKind) -> BTreeMap<String, String> {
    stack_labels(stack)
        .into_iter()
        .chain([
            (COMPONENT_LABEL.to_string(), "backup".to_string()),
            (
                KIND_LABEL.to_string(),
                match kind {
                    BackupJobKind::Backup => "backup".to_string(),
                    BackupJobKind::Restore => "restore".to_string(),
                },
            ),
        ])
        .collect()
}

fn env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..EnvVar::default()
    }
}

/// Destination plumbing for the job pod: env vars plus, for the PVC store,
/// the volume mounted at /backups.
fn store_env(store: &BackupStore) -> (Vec<EnvVar>, Option<Volume>, Option<VolumeMount>) {
    match store {
        BackupStore::Filesystem { .. } => (
            vec![env("BACKUP_DEST", "file:///backups".to_string())],
            Some(Volume {
                name: BACKUP_PVC_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: BACKUP_PVC_NAME.to_string(),
                    ..PersistentVolumeClaimVolumeSource::default()
                }),
                ..Volume::default()
            }),
            Some(VolumeMount {
                name: BACKUP_PVC_NAME.to_string(),
                mount_path: "/backups".to_string(),
                ..VolumeMount::default()
            }),
        ),
        BackupStore::S3 {
            bucket,
            region,
            endpoint,
        } => {
            let mut envs = vec![
                env("BACKUP_DEST", format!("s3://{bucket}")),
                env("AWS_REGION", region.clone()),
            ];
            if let Some(endpoint) = endpoint {
                envs.push(env("AWS_ENDPOINT_URL", endpoint.clone()));
            }
            (envs, None, None)
        }
    }
}

fn job_pod_template(
    stack: &PRStack,
    kind: BackupJobKind,
    script: &str,
    extra_env: Vec<EnvVar>,
    store: &BackupStore,
) -> PodTemplateSpec {
    let databases = stack
        .status
        .as_ref()
        .and_then(|s| s.db_credentials.as_ref())
        .map(|c| c.databases.join(","))
        .unwrap_or_default();
    let (mut envs, volume, mount) = store_env(store);
    envs.extend([
        env("STACK_ID", stack.spec.stack_id.clone()),
        env("DATABASES", databases),
        env("BACKUP_PREFIX", backup_prefix(&stack.spec.stack_id)),
        crate::env::mongodb_uri_env(),
    ]);
    envs.extend(extra_env);

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(job_labels(stack, kind)),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "backup".to_string(),
                image: Some(BACKUP_IMAGE.to_string()),
                command: Some(vec![script.to_string()]),
                env: Some(envs),
                volume_mounts: mount.map(|m| vec![m]),
                ..Container::default()
            }],
            volumes: volume.map(|v| vec![v]),
            restart_policy: Some("OnFailure".to_string()),
            ..PodSpec::default()
        }),
    }
}

fn one_shot_job(
    stack: &PRStack,
    namespace: &str,
    name: String,
    kind: BackupJobKind,
    template: PodTemplateSpec,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(job_labels(stack, kind)),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            template,
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            backoff_limit: Some(3),
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

/// One-shot job dumping every recorded database into a timestamped gzipped
/// archive plus a metadata document, uploaded to the configured store.
/// Requires `status.dbCredentials` to be populated.
pub fn backup_job(
    stack: &PRStack,
    namespace: &str,
    store: &BackupStore,
    now: DateTime<Utc>,
) -> Result<Job> {
    if stack
        .status
        .as_ref()
        .and_then(|s| s.db_credentials.as_ref())
        .is_none()
    {
        return Err(Error::InconsistentState(
            "cannot dispatch backup before database credentials are recorded".to_string(),
        ));
    }
    let stamp = backup_stamp(now);
    let template = job_pod_template(
        stack,
        BackupJobKind::Backup,
        BACKUP_SCRIPT,
        vec![env("BACKUP_NAME", stamp)],
        store,
    );
    Ok(one_shot_job(
        stack,
        namespace,
        backup_job_name(&stack.spec.stack_id, now),
        BackupJobKind::Backup,
        template,
    ))
}

/// Symmetric restore job: download the named archive, drop each target
/// database, restore each dump.
pub fn restore_job(
    stack: &PRStack,
    namespace: &str,
    store: &BackupStore,
    backup_name: &str,
    now: DateTime<Utc>,
) -> Result<Job> {
    if stack
        .status
        .as_ref()
        .and_then(|s| s.db_credentials.as_ref())
        .is_none()
    {
        return Err(Error::InconsistentState(
            "cannot dispatch restore before database credentials are recorded".to_string(),
        ));
    }
    let template = job_pod_template(
        stack,
        BackupJobKind::Restore,
        RESTORE_SCRIPT,
        vec![env("BACKUP_NAME", backup_name.to_string())],
        store,
    );
    Ok(one_shot_job(
        stack,
        namespace,
        restore_job_name(&stack.spec.stack_id, now),
        BackupJobKind::Restore,
        template,
    ))
}

/// Recurring variant of the backup job driven by `backupConfig.cronSchedule`.
/// The in-pod script derives its own timestamp.
pub fn scheduled_backup_cronjob(
    stack: &PRStack,
    namespace: &str,
    store: &BackupStore,
    schedule: &str,
) -> CronJob {
    let template = job_pod_template(stack, BackupJobKind::Backup, BACKUP_SCRIPT, vec![], store);
    CronJob {
        metadata: ObjectMeta {
            name: Some("backup-scheduled".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(job_labels(stack, BackupJobKind::Backup)),
            owner_references: stack.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        },
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    template,
                    ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                    backoff_limit: Some(3),
                    ..JobSpec::default()
                }),
            },
            ..CronJobSpec::default()
        }),
        ..CronJob::default()
    }
}

/// One archive in the store.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

pub fn store_operator(store: &BackupStore) -> Result<Operator> {
    let op = match store {
        BackupStore::Filesystem { root } => {
            let builder = services::Fs::default().root(&root.to_string_lossy());
            Operator::new(builder)
                .map_err(|e| {
                    Error::StorageError("failed to open backup filesystem".to_string(), Box::new(e))
                })?
                .finish()
        }
        BackupStore::S3 {
            bucket,
            region,
            endpoint,
        } => {
            let mut builder = services::S3::default().bucket(bucket).region(region);
            if let Some(endpoint) = endpoint {
                builder = builder.endpoint(endpoint);
            }
            Operator::new(builder)
                .map_err(|e| {
                    Error::StorageError("failed to open backup bucket".to_string(), Box::new(e))
                })?
                .finish()
        }
    };
    Ok(op)
}

/// Enumerate every object under the stack's backup prefix.
pub async fn list_backups(op: &Operator, stack_id: &str) -> Result<Vec<BackupRecord>> {
    let prefix = backup_prefix(stack_id);
    let entries = match op.list(&prefix).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => {
            return Err(Error::StorageError(
                format!("failed to list backups under {prefix}"),
                Box::new(e),
            ))
        }
    };

    let mut records = Vec::new();
    for entry in entries {
        let meta = entry.metadata();
        if meta.is_dir() {
            continue;
        }
        let last_modified = match meta.last_modified() {
            Some(t) => Some(t),
            None => op
                .stat(entry.path())
                .await
                .map_err(|e| {
                    Error::StorageError(
                        format!("failed to stat backup object {}", entry.path()),
                        Box::new(e),
                    )
                })?
                .last_modified(),
        };
        records.push(BackupRecord {
            key: entry.path().to_string(),
            last_modified,
        });
    }
    Ok(records)
}

/// Delete every object under the stack prefix whose modification time is
/// older than the retention cutoff. Returns the number of deleted objects.
/// Retention 0 disables pruning entirely.
pub async fn cleanup_old_backups(
    op: &Operator,
    stack_id: &str,
    retention_days: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    if retention_days <= 0 {
        return Ok(0);
    }
    let cutoff = now - Duration::days(retention_days);
    let mut deleted = 0;
    for record in list_backups(op, stack_id).await? {
        let Some(modified) = record.last_modified else {
            continue;
        };
        if modified < cutoff {
            op.delete(&record.key).await.map_err(|e| {
                Error::StorageError(
                    format!("failed to delete expired backup {}", record.key),
                    Box::new(e),
                )
            })?;
            debug!(msg = "pruned expired backup", key = record.key);
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Project the Jobs observed in the namespace onto status entries.
pub fn reflect_jobs(jobs: &[Job]) -> Vec<BackupJobStatus> {
    jobs.iter()
        .map(|job| {
            let status = job.status.as_ref();
            let state = if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
                BackupJobState::Succeeded
            } else if status.and_then(|s| s.failed).unwrap_or(0) > 0 {
                BackupJobState::Failed
            } else {
                BackupJobState::Active
            };
            let kind = match job
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(KIND_LABEL))
                .map(String::as_str)
            {
                Some("restore") => BackupJobKind::Restore,
                _ => BackupJobKind::Backup,
            };
            BackupJobStatus {
                name: job.metadata.name.clone().unwrap_or_default(),
                kind,
                state,
                started_at: status.and_then(|s| s.start_time.clone()),
            }
        })
        .collect()
}

/// Most recently completed backup job, if any.
pub fn latest_success(jobs: &[Job]) -> Option<(String, Time)> {
    jobs.iter()
        .filter(|job| {
            job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0
                && job
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(KIND_LABEL))
                    .map(String::as_str)
                    != Some("restore")
        })
        .filter_map(|job| {
            let completed = job.status.as_ref().and_then(|s| s.completion_time.clone())?;
            Some((job.metadata.name.clone().unwrap_or_default(), completed))
        })
        .max_by_key(|(_, t)| t.0)
}

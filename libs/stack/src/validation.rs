//! Syntactic and semantic validation of a stack spec, run before the state
//! machine. A rejected spec parks the stack in `Failed` until the user edits
//! it; nothing here touches the cluster.

use crate::crd::PRStackSpec;
use crate::names::logical_name;
use crate::services;

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use stackop_k8s_util::parse::parse_quantity;
use stackop_operator::error::{Error, Result};

const MAX_STACK_ID_LEN: usize = 40;
const MAX_IMAGE_TAG_LEN: usize = 128;
const MAX_RETENTION_DAYS: i64 = 3650;

static STACK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());
static IMAGE_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());
static DNS_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?\.)*[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap()
});

fn invalid(msg: impl Into<String>) -> Error {
    Error::ValidationError(msg.into())
}

pub fn validate(spec: &PRStackSpec) -> Result<()> {
    if spec.stack_id.is_empty() {
        return Err(invalid("stackID must not be empty"));
    }
    if spec.stack_id.len() > MAX_STACK_ID_LEN || !STACK_ID_RE.is_match(&spec.stack_id) {
        return Err(invalid(format!(
            "stackID {:?} must match ^[A-Za-z0-9][A-Za-z0-9._-]*$ and be at most {MAX_STACK_ID_LEN} characters",
            spec.stack_id
        )));
    }

    if let Some(tag) = &spec.image_tag {
        if tag.len() > MAX_IMAGE_TAG_LEN || !IMAGE_TAG_RE.is_match(tag) {
            return Err(invalid(format!("imageTag {tag:?} is not a valid image tag")));
        }
    }

    if let Some(domain) = &spec.custom_domain {
        if domain.len() > 253 || !DNS_HOST_RE.is_match(domain) {
            return Err(invalid(format!(
                "customDomain {domain:?} is not a valid DNS host"
            )));
        }
    }

    for service in &spec.services {
        if !services::is_known_service(service) {
            return Err(invalid(format!(
                "unknown service {service:?} (no collection set for logical name {:?})",
                logical_name(service)
            )));
        }
    }

    if let Some(limits) = &spec.resource_limits {
        for (field, value) in [
            ("cpu", &limits.cpu),
            ("memory", &limits.memory),
            ("storage", &limits.storage),
        ] {
            if let Some(value) = value {
                if parse_quantity(value).is_none() {
                    return Err(invalid(format!(
                        "resourceLimits.{field} {value:?} is not a valid quantity"
                    )));
                }
            }
        }
    }

    if let Some(backup) = &spec.backup_config {
        if backup.enabled {
            if let Some(schedule) = &backup.cron_schedule {
                validate_cron(schedule)?;
            }
            if let Some(days) = backup.retention_days {
                if !(0..=MAX_RETENTION_DAYS).contains(&days) {
                    return Err(invalid(format!(
                        "backupConfig.retentionDays {days} is outside [0, {MAX_RETENTION_DAYS}]"
                    )));
                }
            }
            if let Some(size) = &backup.storage_size {
                if parse_quantity(size).is_none() {
                    return Err(invalid(format!(
                        "backupConfig.storageSize {size:?} is not a valid quantity"
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Accepts exactly the 5-field form; the `cron` crate wants a seconds field,
/// so one is prepended for parsing only.
fn validate_cron(schedule: &str) -> Result<()> {
    if schedule.split_whitespace().count() != 5 {
        return Err(invalid(format!(
            "backupConfig.cronSchedule {schedule:?} must have exactly 5 fields"
        )));
    }
    cron::Schedule::from_str(&format!("0 {schedule}")).map_err(|e| {
        invalid(format!(
            "backupConfig.cronSchedule {schedule:?} does not parse: {e}"
        ))
    })?;
    Ok(())
}

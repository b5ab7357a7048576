use crate::crd::{PRStack, PRStackStatus};
use crate::reconcile::OPERATOR_NAME;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use stackop_operator::controller::Context;
use stackop_operator::error::{Error, Result};
use tracing::{debug, trace};

/// Whole stack converged: every service deployed and healthy.
pub const TYPE_READY: &str = "Ready";
/// A provisioning or deploying pass is underway.
pub const TYPE_PROGRESSING: &str = "Progressing";
/// Some component failed; details in the reason/message pair.
pub const TYPE_DEGRADED: &str = "Degraded";
/// The operator flipped `spec.active` off after the inactivity TTL. The
/// marker is what lets the next tick tell a user reactivation apart from a
/// stack that simply idled past the deadline.
pub const TYPE_EXPIRED: &str = "Expired";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

pub fn condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: generation,
    }
}

/// Replace the same-typed condition if present, append otherwise.
pub fn update_conditions(previous: Vec<Condition>, new_condition: &Condition) -> Vec<Condition> {
    previous
        .iter()
        .filter(|c| c.type_ != new_condition.type_)
        .cloned()
        .chain(std::iter::once(new_condition.clone()))
        .collect()
}

pub fn set_condition(status: &mut PRStackStatus, new_condition: Condition) {
    let previous = status.conditions.take().unwrap_or_default();
    status.conditions = Some(update_conditions(previous, &new_condition));
}

pub fn has_condition(status: &PRStackStatus, type_: &str, value: &str) -> bool {
    status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == type_ && c.status == value)
}

/// Write the status subresource with server-side apply.
pub async fn patch_status(ctx: &Context, name: &str, status: &PRStackStatus) -> Result<()> {
    let patch = Patch::Apply(json!({
        "apiVersion": "shop.pilab.hu/v1alpha1",
        "kind": "PRStack",
        "status": status,
    }));
    debug!(msg = "updating PRStack status", name);
    trace!(msg = format!("new status {status:?}"));
    let api = Api::<PRStack>::all(ctx.client.clone());
    api.patch_status(name, &PatchParams::apply(OPERATOR_NAME).force(), &patch)
        .await
        .map_err(|e| {
            Error::KubeError(
                format!("failed to patch PRStack/status {name}"),
                Box::new(e),
            )
        })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn cond(type_: &str, status: &str) -> Condition {
        condition(type_, status, "Test", "", None)
    }

    #[test]
    fn test_update_conditions_replaces_same_type() {
        let previous = vec![cond(TYPE_READY, CONDITION_TRUE), cond(TYPE_DEGRADED, CONDITION_FALSE)];
        let updated = update_conditions(previous, &cond(TYPE_READY, CONDITION_FALSE));

        assert_eq!(updated.len(), 2);
        assert!(updated
            .iter()
            .any(|c| c.type_ == TYPE_READY && c.status == CONDITION_FALSE));
        assert!(updated
            .iter()
            .any(|c| c.type_ == TYPE_DEGRADED && c.status == CONDITION_FALSE));
    }

    #[test]
    fn test_update_conditions_appends_new_type() {
        let updated = update_conditions(
            vec![cond(TYPE_READY, CONDITION_TRUE)],
            &cond(TYPE_PROGRESSING, CONDITION_TRUE),
        );
        assert_eq!(updated.len(), 2);
    }

    #[test]
    fn test_set_condition_on_empty_status() {
        let mut status = PRStackStatus::default();
        set_condition(&mut status, cond(TYPE_READY, CONDITION_TRUE));
        assert!(has_condition(&status, TYPE_READY, CONDITION_TRUE));
        assert!(!has_condition(&status, TYPE_READY, CONDITION_FALSE));
    }
}

//! Minimal Lease-based leader election. One replica holds a coordination/v1
//! Lease and renews it; the rest block in `acquire` until the holder lets it
//! lapse. Good enough for a single-writer operator without pulling in a full
//! election framework.

use crate::error::{Error, Result};

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::client::Client;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

const LEASE_DURATION_SECONDS: i32 = 15;
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

fn lease_spec(identity: &str, transitions: i32) -> LeaseSpec {
    let now = MicroTime(Utc::now());
    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
        acquire_time: Some(now.clone()),
        renew_time: Some(now),
        lease_transitions: Some(transitions),
        ..LeaseSpec::default()
    }
}

fn lease_expired(lease: &Lease) -> bool {
    let renew = lease
        .spec
        .as_ref()
        .and_then(|s| s.renew_time.as_ref())
        .map(|t| t.0);
    let duration = lease
        .spec
        .as_ref()
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECONDS);
    match renew {
        Some(renewed_at) => {
            Utc::now() - renewed_at > chrono::Duration::seconds(duration as i64)
        }
        None => true,
    }
}

fn holder(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
}

async fn try_acquire(api: &Api<Lease>, name: &str, identity: &str) -> Result<bool> {
    let existing = api
        .get_opt(name)
        .await
        .map_err(|e| Error::KubeError(format!("failed to get lease {name}"), Box::new(e)))?;

    match existing {
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..ObjectMeta::default()
                },
                spec: Some(lease_spec(identity, 0)),
            };
            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // lost the creation race
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(Error::KubeError(
                    format!("failed to create lease {name}"),
                    Box::new(e),
                )),
            }
        }
        Some(mut lease) => {
            if holder(&lease) != Some(identity) && !lease_expired(&lease) {
                return Ok(false);
            }
            let transitions = lease
                .spec
                .as_ref()
                .and_then(|s| s.lease_transitions)
                .unwrap_or(0);
            let bump = if holder(&lease) == Some(identity) { 0 } else { 1 };
            lease.spec = Some(lease_spec(identity, transitions + bump));
            // replace carries the resource version read above, so two
            // candidates racing for an expired lease conflict instead of
            // both winning
            match api.replace(name, &PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(Error::KubeError(
                    format!("failed to update lease {name}"),
                    Box::new(e),
                )),
            }
        }
    }
}

/// Block until this process holds the lease.
pub async fn acquire(client: Client, namespace: &str, name: &str, identity: &str) -> Result<()> {
    let api = Api::<Lease>::namespaced(client, namespace);
    info!(msg = "waiting for leader lease", name, identity);
    loop {
        match try_acquire(&api, name, identity).await {
            Ok(true) => {
                info!(msg = "acquired leader lease", name, identity);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(msg = "lease acquisition attempt failed", %e),
        }
        sleep(RETRY_INTERVAL).await;
    }
}

/// Keep renewing the lease in the background. Losing it means another
/// replica may start reconciling, so the only safe reaction is to exit.
pub fn spawn_renewal(
    client: Client,
    namespace: String,
    name: String,
    identity: String,
) -> tokio::task::JoinHandle<()> {
    let api = Api::<Lease>::namespaced(client, &namespace);
    tokio::spawn(async move {
        loop {
            sleep(RENEW_INTERVAL).await;
            match try_acquire(&api, &name, &identity).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(msg = "leader lease lost, shutting down", name);
                    std::process::exit(1);
                }
                Err(e) => warn!(msg = "lease renewal failed, will retry", %e),
            }
        }
    })
}

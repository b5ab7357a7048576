use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

use stackop_k8s_util::types::short_type_name;

use std::fmt::Debug;
use std::sync::Arc;

use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::Recorder;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::error;

/// Eager continuation: the branch made progress and wants the next one now.
pub const SHORT_REQUEUE: Duration = Duration::from_secs(5);
/// Recoverable error: back off a little before replaying the tick.
pub const MEDIUM_REQUEUE: Duration = Duration::from_secs(30);
/// Steady state.
pub const LONG_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// State shared between the controller and the web server.
#[derive(Clone)]
pub struct State {
    pub metrics: Metrics,
    pub config: Arc<Config>,
}

impl State {
    pub fn new(config: Config) -> Self {
        Self {
            metrics: Metrics::default(),
            config: Arc::new(config),
        }
    }

    /// Render the Prometheus registry in text exposition format.
    pub fn metrics_text(&self) -> Result<String> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry)
            .map_err(|e| Error::FormattingError("failed to encode metrics".to_string(), e))?;
        Ok(buffer)
    }

    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            recorder: Recorder::new(client.clone(), "stackop".into()),
            client,
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        })
    }
}

/// Per-controller reconcile context.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub metrics: Metrics,
    pub recorder: Recorder,
    pub config: Arc<Config>,
}

pub fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(msg = "failed reconciliation", name = %obj.name_any(), %error);
    ctx.metrics.reconcile.set_failure(&obj, error);
    if error.is_permanent() {
        Action::requeue(LONG_REQUEUE)
    } else {
        Action::requeue(MEDIUM_REQUEUE)
    }
}

/// Fail fast at startup when the controller cannot list a resource it is
/// about to watch.
pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

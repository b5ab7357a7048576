use crate::crd::PRStack;
use crate::reconcile::reconcile_stack;

use stackop_operator::controller::{check_api_queryable, error_policy, State};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=stackop";

/// Start the PRStack controller and block until shutdown.
pub async fn run(state: State, client: Client) {
    let stacks = check_api_queryable::<PRStack>(client.clone()).await;
    let deployments = Api::<Deployment>::all(client.clone());
    let jobs = Api::<Job>::all(client.clone());

    let ctx = state.to_context(client);

    info!(msg = "starting prstack controller");
    let stack_controller = Controller::new(stacks, watcher::Config::default().any_semantic())
        // collapse bursts of events into the latest state
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .owns(
            deployments,
            watcher::Config::default().labels(MANAGED_BY_SELECTOR),
        )
        .owns(jobs, watcher::Config::default().labels(MANAGED_BY_SELECTOR))
        .shutdown_on_signal()
        .run(reconcile_stack, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready.set(1);
    stack_controller.await;
}

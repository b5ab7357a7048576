use std::path::PathBuf;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, Router};
use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config as KubeConfig;
use stackop_operator::config::{BackupStore, Config};
use stackop_operator::controller::State as OperatorState;
use stackop_operator::{leader, telemetry};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser, Debug)]
#[command(
    name = "stackop",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Admin connection URI for the shared database cluster
    #[arg(long, env = "DB_URI")]
    db_uri: String,

    /// Database admin user
    #[arg(long, env = "DB_USER", default_value = "admin")]
    db_user: String,

    /// Database admin password
    #[arg(long, env = "DB_PASSWORD", default_value = "password")]
    db_password: String,

    /// Default host suffix for stack ingresses
    #[arg(long, env = "BASE_DOMAIN", default_value = "shop.pilab.hu")]
    base_domain: String,

    /// Fixed suffix appended to every stack namespace name
    #[arg(long, env, default_value = "shop-pilab-hu")]
    namespace_suffix: String,

    /// Registry and organization prefix for service images
    #[arg(long, env, default_value = "ghcr.io/pilab-dev")]
    registry: String,

    /// Image registry user; pull secrets are skipped when unset
    #[arg(long, env)]
    registry_user: Option<String>,

    /// Image registry token
    #[arg(long, env)]
    registry_token: Option<String>,

    /// Image registry e-mail
    #[arg(long, env)]
    registry_email: Option<String>,

    /// Seconds of inactivity before an active stack is expired
    #[arg(long, env, default_value_t = 3600)]
    expiration_ttl: i64,

    /// Root path of the filesystem backup store (PVC-mounted in-cluster)
    #[arg(long, env, default_value = "/var/lib/stackop/backups")]
    backup_root: PathBuf,

    /// S3 bucket for backups; overrides the filesystem store when set
    #[arg(long, env)]
    backup_s3_bucket: Option<String>,

    #[arg(long, env, default_value = "us-east-1")]
    backup_s3_region: String,

    #[arg(long, env)]
    backup_s3_endpoint: Option<String>,

    /// Prometheus exposition bind address
    #[arg(long, env, default_value = ":8080")]
    metrics_addr: String,

    /// Liveness/readiness probe bind address
    #[arg(long, env, default_value = ":8081")]
    probe_addr: String,

    /// Run a leader election so only one replica reconciles
    #[arg(long, env, default_value_t = false)]
    leader_elect: bool,

    /// Filter directive for `tracing_subscriber::filter::EnvFilter`,
    /// e.g. "info,kube=debug,stackop=debug"
    #[arg(long, env, default_value = "info")]
    log_filter: String,

    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// OTLP endpoint for traces; tracing disabled when unset
    #[arg(long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Ratio of traces to sample
    #[arg(long, env, default_value_t = 0.1)]
    sample_ratio: f64,
}

impl Args {
    fn to_config(&self) -> Config {
        let backup_store = match &self.backup_s3_bucket {
            Some(bucket) => BackupStore::S3 {
                bucket: bucket.clone(),
                region: self.backup_s3_region.clone(),
                endpoint: self.backup_s3_endpoint.clone(),
            },
            None => BackupStore::Filesystem {
                root: self.backup_root.clone(),
            },
        };
        Config {
            db_uri: self.db_uri.clone(),
            db_user: self.db_user.clone(),
            db_password: self.db_password.clone(),
            base_domain: self.base_domain.clone(),
            namespace_suffix: self.namespace_suffix.clone(),
            registry_prefix: self.registry.clone(),
            registry_user: self.registry_user.clone(),
            registry_token: self.registry_token.clone(),
            registry_email: self.registry_email.clone(),
            expiration_ttl_secs: self.expiration_ttl,
            backup_store,
        }
    }
}

/// Bind addresses are given as ":8080" or "host:8080".
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
    match state.metrics_text() {
        Ok(body) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {e:?}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> impl IntoResponse {
    Json("ok")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // misconfiguration exits with 1, like every other startup failure;
    // help and version requests are not errors
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    telemetry::init(
        &args.log_filter,
        args.log_format.clone(),
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let kube_config = KubeConfig::infer().await?;
    let client = kube::Client::try_from(kube_config)?;

    if args.leader_elect {
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "stackop".to_string());
        leader::acquire(client.clone(), &namespace, "stackop-leader", &identity).await?;
        leader::spawn_renewal(
            client.clone(),
            namespace,
            "stackop-leader".to_string(),
            identity,
        );
    }

    let state = OperatorState::new(args.to_config());

    let controller = stackop_stack::controller::run(state.clone(), client);

    let metrics_app = Router::new()
        .route("/metrics", get(metrics))
        .with_state(state.clone());
    let probe_app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz));

    let metrics_listener = TcpListener::bind(listen_addr(&args.metrics_addr)).await?;
    let probe_listener = TcpListener::bind(listen_addr(&args.probe_addr)).await?;
    let metrics_server = axum::serve(metrics_listener, metrics_app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();
    let probe_server = axum::serve(probe_listener, probe_app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    let (_, metrics_result, probe_result) =
        tokio::join!(controller, metrics_server, probe_server);
    metrics_result?;
    probe_result?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

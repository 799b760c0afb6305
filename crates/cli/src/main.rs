mod health;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rudder_agent::{Agent, AgentConfig, PollFailurePolicy};
use rudder_apply::KubeApplier;
use rudder_control::HttpControlPlane;
use rudder_kubehub::{ApiResolver, KubeObserver};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "rudderd", version, about = "Reconcile this cluster toward the control plane's desired state")]
struct Cli {
    /// Control-plane base URL, e.g. http://kotsadm-api:3000
    #[arg(long, env = "RUDDER_API_ENDPOINT")]
    endpoint: Url,

    /// Credential sent as the basic-auth password
    #[arg(long, env = "RUDDER_TOKEN", hide_env_values = true)]
    token: String,

    /// Application identifier reported with every status snapshot
    #[arg(long = "app-id", env = "RUDDER_APP_ID")]
    app_id: String,

    #[arg(long = "poll-interval-secs", env = "RUDDER_POLL_INTERVAL_SECS", default_value_t = 10)]
    poll_interval_secs: u64,

    /// Upper bound for every control-plane and cluster call
    #[arg(long = "request-timeout-secs", env = "RUDDER_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Behaviour when the desired state cannot be fetched
    #[arg(long = "on-poll-error", env = "RUDDER_ON_POLL_ERROR", value_enum, default_value_t = OnPollError::Retry)]
    on_poll_error: OnPollError,

    #[arg(long = "max-backoff-secs", env = "RUDDER_MAX_BACKOFF_SECS", default_value_t = 300)]
    max_backoff_secs: u64,

    /// How long shutdown waits for in-flight removals
    #[arg(long = "shutdown-grace-secs", env = "RUDDER_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,

    /// Address serving GET /healthz. Metrics are served separately when RUDDER_METRICS_ADDR is set
    #[arg(long = "health-addr", env = "RUDDER_HEALTH_ADDR", default_value = "0.0.0.0:3000")]
    health_addr: SocketAddr,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OnPollError { Exit, Retry }

impl Cli {
    fn agent_config(&self) -> AgentConfig {
        let mut cfg = AgentConfig::new(&self.app_id);
        cfg.poll_interval = Duration::from_secs(self.poll_interval_secs.max(1));
        cfg.poll_failure = match self.on_poll_error {
            OnPollError::Exit => PollFailurePolicy::Exit,
            OnPollError::Retry => PollFailurePolicy::Retry,
        };
        cfg.max_backoff = Duration::from_secs(self.max_backoff_secs);
        cfg.shutdown_grace = Duration::from_secs(self.shutdown_grace_secs);
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RUDDER_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel on Ctrl-C or SIGTERM.
fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
                        _ = term.recv() => info!("SIGTERM received; shutting down"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl-C received; shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received; shutting down");
        }
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.request_timeout_secs.max(1));
    let config = cli.agent_config();
    info!(endpoint = %cli.endpoint, app_id = %config.app_id, "rudderd starting");

    let control = Arc::new(HttpControlPlane::new(&cli.endpoint, cli.token.clone(), timeout)?);
    let client = rudder_kubehub::get_kube_client().await?;
    let resolver = Arc::new(ApiResolver::new(client));
    let applier = Arc::new(KubeApplier::new(Arc::clone(&resolver), timeout));
    let observer = Arc::new(KubeObserver::new(resolver, timeout));

    let mut agent = Agent::new(config, control.clone(), applier, observer, control);
    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());
    health::spawn(cli.health_addr, agent.subscribe_phase(), cancel.clone());

    agent.run(cancel).await.context("failed to get desired state from server")?;
    Ok(())
}

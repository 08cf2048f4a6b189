//! Fleet controller - registers fleet control loops and runs them as leader

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fleet_common::crd::fleet_crds;
use fleet_common::kube_utils::ConnectionConfig;
use fleet_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use fleet_common::{Namespaces, DEFAULT_SYSTEM_NAMESPACE};
use fleet_controller::{
    fleet_registry, seed, start_all, CapabilityContext, RunGate, DEFAULT_START_CONCURRENCY,
};

/// Fleet controller - delivers bundles to registered clusters
#[derive(Parser, Debug)]
#[command(name = "fleet-controller", version, about, long_about = None)]
struct Cli {
    /// Print the fleet CRDs as JSON and exit
    #[arg(long)]
    crd: bool,

    /// Kubeconfig file; in-cluster configuration is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long)]
    context: Option<String>,

    /// Namespace the controller and its configuration live in
    #[arg(long, env = "NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    namespace: String,

    /// Identity used for leader election (defaults to hostname plus a random suffix)
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Maximum number of informer factories syncing at once
    #[arg(long, default_value_t = DEFAULT_START_CONCURRENCY)]
    start_concurrency: usize,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Json)]
    log_format: LogFormatArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", serde_json::to_string_pretty(&fleet_crds())?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..Default::default()
    })?;

    if let Err(e) = run(cli).await {
        error!(error = %e, "fleet controller exited");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let namespaces = Namespaces::new(cli.namespace);
    let identity = cli.identity.unwrap_or_else(default_identity);
    info!(
        system_namespace = %namespaces.system(),
        registration_namespace = %namespaces.registration(),
        identity = %identity,
        "fleet controller starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let connection = ConnectionConfig {
        kubeconfig: cli.kubeconfig,
        context: cli.context,
        ..Default::default()
    };
    let ctx = CapabilityContext::build(&connection).await?;

    seed::seed(ctx.applier(), &namespaces).await?;
    let registered = fleet_registry()?.register_all(&ctx, &namespaces).await?;
    info!(controllers = ?registered, "control loops registered");

    let gate = RunGate::new(ctx.client().clone(), &namespaces, &identity);
    let concurrency = cli.start_concurrency;
    let starters = ctx.starters().to_vec();
    gate.run(shutdown, |token| async move {
        start_all(token, concurrency, &starters).await
    })
    .await?;

    info!("fleet controller stopped");
    Ok(())
}

fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "fleet-controller".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("shutdown signal received");
    shutdown.cancel();
}

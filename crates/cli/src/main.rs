use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use cqlop_controller::SchedulerConfig;
use cqlop_core::ResourceKind;
use cqlop_persist::Store;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod operator;
mod local;
mod output;

use local::LocalPlane;

#[derive(Parser, Debug)]
#[command(name = "cqlopctl", version, about = "Reconcile Cassandra keyspaces, roles and grants")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// State database (objects, cluster tables, secrets)
    #[arg(long = "state", global = true, env = "CQLOP_DB_PATH")]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile the objects declared in manifest files
    Apply {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
        /// Pass budget (default: CQLOP_MAX_PASSES or 5)
        #[arg(long = "max-passes")]
        max_passes: Option<usize>,
        /// Keep reconciling until Ctrl-C
        #[arg(long = "watch", action = ArgAction::SetTrue)]
        watch: bool,
        /// Seconds between watch cycles
        #[arg(long = "interval", default_value_t = 10)]
        interval: u64,
    },
    /// Delete the objects declared in manifest files
    Delete {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
    },
    /// List stored objects
    Get,
    /// Recent reconcile outcomes of one object
    History {
        kind: String,
        name: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Show the local cluster tables
    Cluster,
    /// Reconcile managed resources stored on a Kubernetes API server
    Run {
        /// Seconds between full resyncs
        #[arg(long = "resync", default_value_t = 60)]
        resync: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("CQLOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CQLOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CQLOP_METRICS_ADDR; expected host:port");
        }
    }
}

/// Token cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            t.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut sched = SchedulerConfig::from_env();

    match cli.command {
        Commands::Apply { files, max_passes, watch, interval } => {
            if let Some(n) = max_passes {
                sched.max_passes = n.max(1);
            }
            let plane = LocalPlane::open(cli.state.as_deref())?;
            let ctx = shutdown_token();
            loop {
                let set = local::read_manifests(&files)?;
                let report = plane.apply(&ctx, set, sched).await?;
                output::print_converge(cli.output, &report.converge, &report.statements)?;
                if !watch || ctx.is_cancelled() {
                    if !report.converge.converged {
                        anyhow::bail!("not converged after {} passes", report.converge.passes);
                    }
                    break;
                }
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                }
            }
        }
        Commands::Delete { files } => {
            let plane = LocalPlane::open(cli.state.as_deref())?;
            let set = local::read_manifests(&files)?;
            let report = plane.delete(&shutdown_token(), set, sched).await?;
            output::print_converge(cli.output, &report.converge, &report.statements)?;
        }
        Commands::Get => {
            let plane = LocalPlane::open(cli.state.as_deref())?;
            output::print_objects(cli.output, &plane.store().list_objects()?)?;
        }
        Commands::History { kind, name, limit } => {
            let kind = ResourceKind::from_str(&kind)?;
            let plane = LocalPlane::open(cli.state.as_deref())?;
            output::print_history(cli.output, &plane.store().history(kind, &name, limit)?)?;
        }
        Commands::Cluster => {
            let plane = LocalPlane::open(cli.state.as_deref())?;
            output::print_cluster(cli.output, &plane.cluster().snapshot())?;
        }
        Commands::Run { resync } => {
            let client = cqlop_kubehub::client().await?;
            operator::run(&shutdown_token(), client, sched, Duration::from_secs(resync.max(1)))
                .await
                .context("kube reconcile loop")?;
        }
    }

    Ok(())
}

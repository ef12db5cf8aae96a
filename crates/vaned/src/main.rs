//! vaned — the Vane daemon.
//!
//! Single binary that assembles the controller:
//! - Object store (redb, on disk or in memory)
//! - Metric providers and traffic routers
//! - Controller (cache, work queues, reconcile workers)
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! vaned run --config /etc/vane/vane.toml --port 8480
//! vaned run --in-memory --simulate-readiness
//! vaned config > vane.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vane_analysis::ProviderRegistry;
use vane_controller::{Controller, ControllerOptions};
use vane_core::{SystemClock, VaneConfig};
use vane_metrics::ControllerMetrics;
use vane_state::StateStore;
use vane_traffic::RouterRegistry;

#[derive(Parser)]
#[command(name = "vaned", about = "Vane progressive-delivery controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and the API server.
    Run(RunArgs),

    /// Print the default configuration as TOML.
    Config,
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Path to vane.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port for the API server.
    #[arg(long)]
    port: Option<u16>,

    /// Directory for the object store.
    #[arg(long, conflicts_with = "in_memory")]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory; nothing survives a restart.
    #[arg(long)]
    in_memory: bool,

    /// Number of reconcile workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Report replica sets as available as soon as they are scaled.
    #[arg(long)]
    simulate_readiness: bool,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let config = resolve_config(&args)?;
            init_tracing(&config);
            run(config).await
        }
        Command::Config => {
            print!("{}", VaneConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

/// Load the config file (if any) and apply command-line overrides.
fn resolve_config(args: &RunArgs) -> anyhow::Result<VaneConfig> {
    let mut config = match &args.config {
        Some(path) => VaneConfig::from_file(path)?,
        None => VaneConfig::default(),
    };
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if args.in_memory {
        config.store.data_dir = None;
    } else if let Some(dir) = &args.data_dir {
        config.store.data_dir = Some(dir.clone());
    }
    if let Some(workers) = args.workers {
        config.controller.workers = workers;
    }
    if args.simulate_readiness {
        config.controller.simulate_readiness = true;
    }
    if args.log_json {
        config.logging.json = true;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &VaneConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(config: VaneConfig) -> anyhow::Result<()> {
    info!("Vane daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    // Object store.
    let store = match &config.store.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join("vane.redb");
            let store = StateStore::open(&path)?;
            info!(path = ?path, "object store opened");
            store
        }
        None => {
            info!("object store in memory");
            StateStore::open_in_memory()?
        }
    };

    // Providers and routers.
    let providers = ProviderRegistry::with_builtins();
    let routers = RouterRegistry::with_builtins();
    info!(routers = ?routers.names(), "traffic routers registered");

    // Controller.
    let metrics = ControllerMetrics::new();
    let options = ControllerOptions::from_config(&config)?;
    let controller = Controller::new(
        store.clone(),
        providers,
        routers,
        Arc::new(SystemClock),
        metrics.clone(),
        options,
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let handles = controller.spawn(shutdown_rx)?;

    // ── Start API server ───────────────────────────────────────

    let router = vane_api::build_router(vane_api::ApiState::new(store, metrics));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for the controller to drain.
    for handle in handles {
        let _ = handle.await;
    }

    info!("Vane daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "vaned",
            "run",
            "--port",
            "9000",
            "--in-memory",
            "--workers",
            "2",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.port, Some(9000));
        assert!(args.in_memory);
        assert_eq!(args.workers, Some(2));
    }

    #[test]
    fn data_dir_conflicts_with_in_memory() {
        let result = Cli::try_parse_from(["vaned", "run", "--in-memory", "--data-dir", "/tmp/x"]);
        assert!(result.is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let args = RunArgs {
            port: Some(9000),
            in_memory: true,
            workers: Some(8),
            simulate_readiness: true,
            ..Default::default()
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.store.data_dir, None);
        assert_eq!(config.controller.workers, 8);
        assert!(config.controller.simulate_readiness);
        assert!(!config.logging.json);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let args = RunArgs {
            workers: Some(0),
            ..Default::default()
        };
        assert!(resolve_config(&args).is_err());
    }
}

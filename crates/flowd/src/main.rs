//! flowd — the svcflow daemon.
//!
//! Single binary that assembles the lifecycle engine:
//! - Service store (redb)
//! - Compute backend (HTTP, or simulated with `--simulate`)
//! - Event bus subscriber and wait dispatcher
//! - Lifecycle dispatcher
//!
//! On start every stored service is caught up, then any service files
//! given with `--service` are created and deployed.
//!
//! # Usage
//!
//! ```text
//! flowd run --config /etc/svcflow/flow.toml --service shop.json
//! flowd run --simulate --store /tmp/flow.redb --service shop.json
//! flowd list --store /var/lib/svcflow/flow.redb
//! flowd config > flow.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use svcflow_backend::{ComputeBackend, HttpBackend, SimulatedBackend};
use svcflow_core::FlowConfig;
use svcflow_events::{EventSource, LocalBus, TcpEventSource};
use svcflow_lifecycle::{LifecycleAction, LifecycleManager};
use svcflow_state::{Service, ServicePool, ServiceStore};

const DEFAULT_FILTER: &str = "info,flowd=debug,svcflow=debug";

#[derive(Parser)]
#[command(name = "flowd", about = "svcflow service lifecycle daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lifecycle engine until Ctrl-C.
    Run {
        /// Configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Service store path, overriding the configuration.
        #[arg(long)]
        store: Option<PathBuf>,

        /// Use the in-process simulated backend and event bus.
        #[arg(long)]
        simulate: bool,

        /// Service document (JSON) to create and deploy. Repeatable.
        #[arg(long = "service")]
        services: Vec<PathBuf>,
    },

    /// Print every stored service.
    List {
        #[arg(long, default_value = "/var/lib/svcflow/flow.redb")]
        store: PathBuf,
    },

    /// Print the default configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            store,
            simulate,
            services,
        } => {
            let mut config = match config {
                Some(path) => FlowConfig::from_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => FlowConfig::default(),
            };
            if let Some(store) = store {
                config.store.path = store;
            }
            run(config, simulate, services).await
        }
        Command::List { store } => list(&store),
        Command::Config => {
            print!("{}", FlowConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: FlowConfig, simulate: bool, service_files: Vec<PathBuf>) -> anyhow::Result<()> {
    config.validate()?;
    info!(simulate, "svcflow daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    if let Some(dir) = config.store.path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store = ServiceStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "service store opened");

    let (backend, source): (Arc<dyn ComputeBackend>, Arc<dyn EventSource>) = if simulate {
        let bus = LocalBus::default();
        let backend = SimulatedBackend::new(Duration::from_secs(2)).with_hook(bus.transition_hook());
        info!("simulated backend initialized");
        (Arc::new(backend), Arc::new(bus))
    } else {
        let backend = HttpBackend::from_config(&config.backend);
        let subscriber = config.events.subscriber_addr()?;
        info!(backend = backend.address(), %subscriber, "backend client initialized");
        (Arc::new(backend), Arc::new(TcpEventSource::new(subscriber)))
    };

    let manager = LifecycleManager::new(ServicePool::new(store), backend, source, &config);

    // ── Resume interrupted work, then start ────────────────────

    let resumed = manager.catch_up().await?;
    info!(resumed, "catch-up done");
    manager.start();

    for path in &service_files {
        match create_service(&manager, path) {
            Ok(id) => info!(service = id, file = %path.display(), "service submitted"),
            Err(e) => warn!(file = %path.display(), error = %format!("{e:#}"), "service file rejected"),
        }
    }

    // ── Wait for shutdown ──────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    manager.shutdown().await;
    info!("svcflow daemon stopped");
    Ok(())
}

/// Store a service document read from `path` and queue its deploy.
fn create_service(manager: &LifecycleManager, path: &Path) -> anyhow::Result<u64> {
    let content = std::fs::read_to_string(path)?;
    let service: Service = serde_json::from_str(&content)?;
    let service = manager.create_service(service)?;
    manager.trigger(LifecycleAction::Deploy {
        service_id: service.id,
    })?;
    Ok(service.id)
}

fn list(path: &Path) -> anyhow::Result<()> {
    let store = ServiceStore::open(path)
        .with_context(|| format!("opening store {}", path.display()))?;
    for svc in store.list_services()? {
        let roles: Vec<String> = svc
            .roles
            .iter()
            .map(|r| format!("{}={}({}/{})", r.name, r.state, r.live_count(), r.cardinality))
            .collect();
        println!("{:>6}  {:<20}  {:<18}  {}", svc.id, svc.name, svc.state.as_str(), roles.join(" "));
    }
    Ok(())
}

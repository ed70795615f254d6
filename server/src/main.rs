//! Keel server.
//!
//! One binary, three roles sharing the same application factory:
//!
//! - `keel serve` handles HTTP requests
//! - `keel worker` executes deferred tasks from the broker
//! - `keel beat` queues periodic tasks from `CELERYBEAT_SCHEDULE`
//!
//! Settings come from the built-in defaults, `instance/settings.toml`, then
//! the environment (a `.env` file is loaded first when present).

mod api;
mod tasks;

use anyhow::Result;
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use keel_core::config::{ConfigSource, Configuration};
use keel_core::fault::FaultBus;
use keel_runtime::metrics::MetricsServer;
use keel_runtime::{Beat, Broker, RedisBroker, Schedule, TaskRunner};
use keel_web::{AppFactory, ApplicationInstance};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::SqlIdentityLookup;
use crate::tasks::ApiTasks;

#[derive(Parser, Debug)]
#[command(author, version, about = "Keel application server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Serve HTTP requests
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:8000")]
        address: SocketAddr,
    },
    /// Execute queued tasks
    Worker {
        /// Number of workers (defaults to `WORKER_CONCURRENCY`)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },
    /// Queue periodic tasks
    Beat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dotenv = dotenvy::dotenv().ok();

    let source = ConfigSource::from_env();
    let bus = FaultBus::default();
    init_tracing(&source.clone().load()?, &bus);
    if let Some(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    let instance = AppFactory::new()
        .config_source(source)
        .namespace(api::namespace())
        .identity_lookup(Arc::new(SqlIdentityLookup))
        .fault_bus(bus)
        .build(None)?;
    info!(instance = %instance.id(), role = ?cli.command, "Application ready");

    start_metrics(instance.config()).await?;

    let (shutdown, _) = broadcast::channel::<()>(1);
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = trigger.send(());
    });

    match cli.command {
        Command::Serve { address } => serve(&instance, address, &shutdown).await?,
        Command::Worker { concurrency } => work(&instance, concurrency, &shutdown).await?,
        Command::Beat => beat(&instance, &shutdown).await?,
    }

    info!("Server stopped");
    Ok(())
}

/// `RUST_LOG` wins; otherwise the `LOG_LEVEL` setting applies.
fn init_tracing(config: &Configuration, bus: &FaultBus) {
    let level = config.get_str("LOG_LEVEL").unwrap_or("info");

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{level},tower_http=info,sqlx=warn"))),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(bus.capture_layer())
        .init();
}

/// Serve `/metrics` on `METRICS_ADDR` when it is set.
async fn start_metrics(config: &Configuration) -> Result<()> {
    let Some(addr) = config.get_str("METRICS_ADDR") else {
        return Ok(());
    };
    let addr: SocketAddr = addr.parse()?;

    let mut metrics = MetricsServer::new(addr);
    metrics.start()?;
    let handle = metrics.handle().cloned();

    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.map(|h| h.render()).unwrap_or_default() }
        }),
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Metrics endpoint listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "Metrics endpoint stopped");
        }
    });
    Ok(())
}

async fn serve(
    instance: &ApplicationInstance,
    address: SocketAddr,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %address, "Server listening");

    let mut stop = shutdown.subscribe();
    axum::serve(
        listener,
        instance
            .router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = stop.recv().await;
    })
    .await?;
    Ok(())
}

async fn work(
    instance: &ApplicationInstance,
    concurrency: Option<usize>,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::from_config(instance.config()).await?);

    let mut builder = TaskRunner::builder(instance.context(), broker).module(&ApiTasks);
    if let Some(workers) = concurrency {
        builder = builder.concurrency(workers);
    }
    let runner = Arc::new(builder.build()?);
    info!(tasks = ?runner.task_names(), "Tasks registered");

    runner.run(shutdown).await;
    Ok(())
}

async fn beat(instance: &ApplicationInstance, shutdown: &broadcast::Sender<()>) -> Result<()> {
    let schedule = Schedule::from_config(instance.config())?;
    if schedule.is_empty() {
        warn!("CELERYBEAT_SCHEDULE is empty; beat will idle");
    }
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::from_config(instance.config()).await?);

    Beat::new(schedule, broker).run(shutdown.subscribe()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}

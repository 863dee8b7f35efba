//! devicio CLI: device routine simulator and processor.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use devicio_rs::config::{Config, DatabaseConfig};
use devicio_rs::db::{Db, PgRoutineRepository};
use devicio_rs::dispatch::{RoutineDispatcher, WorkerPool};
use devicio_rs::processor::ProcessingService;
use devicio_rs::processor::unstable::UnstableApi;
use devicio_rs::queue::QueueClient;
use devicio_rs::shutdown;
use devicio_rs::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "devicio", about = "Device routine pipeline over RabbitMQ")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish synthetic device routines
    Simulate {
        /// Number of routines to publish
        #[arg(long, default_value_t = 10)]
        records: u64,
        /// Concurrent publishing workers
        #[arg(long, default_value_t = 5)]
        concurrency: usize,
    },
    /// Consume routines and persist them to Postgres
    Process,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: config.service_name.clone(),
        log_level: config.log_level.clone(),
    })?;

    let result = match cli.command {
        Command::Simulate {
            records,
            concurrency,
        } => cmd_simulate(&config, records, concurrency).await,
        Command::Process => cmd_process(&config).await,
    };

    if let Err(ref e) = result {
        error!(error = %e, "devicio exited with error");
    }
    shutdown_telemetry(guard);
    result
}

async fn cmd_simulate(config: &Config, records: u64, concurrency: usize) -> anyhow::Result<()> {
    let queue = Arc::new(QueueClient::connect(&config.queue).await?);
    let pool = WorkerPool::new(concurrency, Arc::new(RoutineDispatcher::new(queue.clone())))?;

    let cancel = CancellationToken::new();
    let signals = shutdown::cancel_on(shutdown::signal(), cancel.clone());

    let result = pool.run(cancel.clone(), records).await;
    cancel.cancel();
    signals.await.ok();
    queue.close().await;

    let summary = result?;
    println!(
        "Published {} of {} routines to {}",
        summary.succeeded,
        summary.total_jobs,
        config.queue.queue_name
    );
    Ok(())
}

async fn cmd_process(config: &Config) -> anyhow::Result<()> {
    let db_config = DatabaseConfig::from_env()?;

    let queue = QueueClient::connect(&config.queue).await?;

    let db = match connect_db(&db_config).await {
        Ok(db) => db,
        Err(e) => {
            queue.close().await;
            return Err(e);
        }
    };

    let repository = match PgRoutineRepository::new(&db).await {
        Ok(repository) => repository,
        Err(e) => {
            queue.close().await;
            db.close().await;
            return Err(e.into());
        }
    };

    let service = ProcessingService::new(
        Arc::new(UnstableApi::new(config.unstable_api.clone())),
        Arc::new(repository),
    );

    let cancel = CancellationToken::new();
    if let Err(e) = queue.subscribe(cancel.clone(), Arc::new(service)).await {
        queue.close().await;
        db.close().await;
        return Err(e.into());
    }

    info!(queue = %queue.queue_name(), "processor running");
    shutdown::signal().await;
    info!("shutting down processor");

    cancel.cancel();
    queue.close().await;
    db.close().await;
    Ok(())
}

async fn connect_db(config: &DatabaseConfig) -> anyhow::Result<Db> {
    let db = Db::connect(config).await?;
    db.migrate().await?;
    db.health_check().await?;
    Ok(db)
}

fn shutdown_telemetry(guard: TelemetryGuard) {
    guard.force_flush();
    drop(guard);
}

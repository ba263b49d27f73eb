use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use agenttrace::config::AppConfig;
use agenttrace::domain::ApiKey;
use agenttrace::observability::{init_metrics, init_tracing};
use agenttrace::queue::SqlJobQueue;
use agenttrace::retention::RetentionSweepHandler;
use agenttrace::storage::{connect, ConfigStore, StoreKind, TelemetryStore};
use agenttrace::worker::TaskContext;

#[derive(Parser)]
#[command(name = "agenttrace", version, about = "Observability backend for AI coding agents")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "agenttrace.toml", env = "AGENTTRACE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingest/query API, batcher and worker pool
    Serve,
    /// Open all stores and apply pending migrations, then exit
    Migrate,
    /// Drop telemetry partitions past each project's retention window once
    SweepRetention,
    /// Generate an API key pair for a project; the secret is printed once
    CreateApiKey {
        #[arg(long)]
        project_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: AppConfig) -> agenttrace::Result<()> {
    match command {
        Command::Serve => {
            init_metrics(&config.metrics)?;
            let app = agenttrace::app::build(config).await?;
            app.run().await?;
            info!("Clean shutdown");
            Ok(())
        }
        Command::Migrate => {
            connect(StoreKind::Config, &config.config_store).await?;
            connect(StoreKind::Telemetry, &config.telemetry_store).await?;
            connect(StoreKind::Queue, &config.job_queue).await?;
            info!("All store migrations applied");
            Ok(())
        }
        Command::SweepRetention => {
            let config_pool = connect(StoreKind::Config, &config.config_store).await?;
            let telemetry_pool = connect(StoreKind::Telemetry, &config.telemetry_store).await?;
            let queue_pool = connect(StoreKind::Queue, &config.job_queue).await?;

            // one-shot run; interval 0 means no self-rescheduling
            let handler = RetentionSweepHandler::new(
                ConfigStore::new(config_pool),
                TelemetryStore::new(telemetry_pool),
                Arc::new(SqlJobQueue::new(queue_pool)),
                0,
            );
            let (_shutdown, rx) = tokio::sync::watch::channel(false);
            let dropped = handler.sweep_once(&TaskContext::new(rx)).await?;
            println!("dropped {dropped} telemetry rows");
            Ok(())
        }
        Command::CreateApiKey { project_id } => {
            let pool = connect(StoreKind::Config, &config.config_store).await?;
            let store = ConfigStore::new(pool);

            let project = store.get_project(&project_id).await?.ok_or_else(|| {
                agenttrace::AgentTraceError::NotFound(format!("project {project_id}"))
            })?;

            let generated = ApiKey::generate(project.id, vec!["ingest".into(), "read".into()]);
            store.create_api_key(&generated.key).await?;

            println!("public key: {}", generated.key.public_key);
            println!("secret key: {}", generated.secret_key);
            println!("The secret is not stored and cannot be shown again.");
            Ok(())
        }
    }
}

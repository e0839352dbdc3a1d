//! Operator CLI for the crawl state database
//!
//! Runs migrations, crash recovery and table maintenance, and inspects or
//! aborts jobs. Job listings are printed as JSON.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crawl_state::jobs::{Job, JobStatus};
use crawl_state::traits::{NoopCacheInvalidator, StaticConnectorRegistry};
use crawl_state::{Config, CrawlState};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "crawl-state")]
#[command(about = "Crawl job and bookkeeping state maintenance")]
struct Cli {
    /// Connection names whose connectors are installed in this process
    #[arg(long = "connection", global = true)]
    connections: Vec<String>,

    /// Output connection names whose connectors are installed in this process
    #[arg(long = "output", global = true)]
    outputs: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Roll back interrupted passes and collapse startup/seeding job states
    Recover,

    /// Run whatever table maintenance is due
    Maintain,

    /// List jobs
    Jobs,

    /// Abort a job
    Abort {
        id: i64,
        /// Restart the job once the abort has wound down
        #[arg(long)]
        restart: bool,
        /// Error text recorded on the job
        #[arg(long)]
        reason: Option<String>,
    },
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize)]
struct JobSummary {
    id: i64,
    description: String,
    connection: String,
    output: String,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            description: job.description.clone(),
            connection: job.connection_name.clone(),
            output: job.output_name.clone(),
            status: job.status(),
            error: job.state.error_text.clone(),
        }
    }
}

#[derive(Serialize)]
struct AbortResponse {
    id: i64,
    aborted: bool,
    status: JobStatus,
}

fn output<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(value).context("Failed to serialize output")?
    );
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crawl_state=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let connectors = Arc::new(StaticConnectorRegistry::new());
    for name in &cli.connections {
        connectors.register_connection(name).await;
    }
    for name in &cli.outputs {
        connectors.register_output(name).await;
    }

    let state = CrawlState::connect(&config, connectors, Arc::new(NoopCacheInvalidator))
        .await
        .context("Failed to open crawl state")?;

    match cli.command {
        Commands::Migrate => {
            // connect() already applied pending migrations
            tracing::info!("Migrations are up to date");
            Ok(())
        }
        Commands::Recover => cmd_recover(&state).await,
        Commands::Maintain => state
            .conditionally_maintain()
            .await
            .context("Table maintenance failed"),
        Commands::Jobs => cmd_jobs(&state).await,
        Commands::Abort {
            id,
            restart,
            reason,
        } => cmd_abort(&state, id, restart, reason.as_deref()).await,
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_recover(state: &CrawlState) -> Result<()> {
    let report = state.recover().await.context("Recovery failed")?;
    tracing::info!(jobs_recovered = report.jobs_recovered, "Recovery complete");
    Ok(())
}

async fn cmd_jobs(state: &CrawlState) -> Result<()> {
    let jobs = state.jobs.get_all().await.context("Failed to list jobs")?;
    let summaries: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();
    output(&summaries)
}

async fn cmd_abort(state: &CrawlState, id: i64, restart: bool, reason: Option<&str>) -> Result<()> {
    let aborted = if restart {
        state.jobs.abort_restart_job(id).await
    } else {
        state.jobs.abort_job(id, reason).await
    }
    .with_context(|| format!("Failed to abort job {}", id))?;

    let status = state.jobs.get_status(id).await?;
    output(&AbortResponse {
        id,
        aborted,
        status,
    })
}

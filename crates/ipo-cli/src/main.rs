use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ipo_core::SystemClock;
use ipo_storage::{IpoStore, PgIpoStore};
use ipo_sync::{RunReport, SyncConfig, SyncPipeline, SyncTarget};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ipo-cli")]
#[command(about = "IPO and GMP reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now and write its run report.
    Sync {
        #[arg(value_enum, default_value_t = Target::All)]
        target: Target,
    },
    /// Apply SQL migrations.
    Migrate,
    /// Serve the JSON API, plus scheduled syncs when IPO_SCHEDULER_ENABLED is set.
    Serve,
    /// Run scheduled syncs until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Target {
    Ipo,
    Gmp,
    All,
}

impl From<Target> for SyncTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::Ipo => SyncTarget::Ipo,
            Target::Gmp => SyncTarget::Gmp,
            Target::All => SyncTarget::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ipo_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { target: Target::All }) {
        Commands::Sync { target } => {
            let store = connect_store(&config).await?;
            let pipeline = SyncPipeline::new(config, store)?;
            let reports = pipeline.run_once(target.into()).await?;
            for report in &reports {
                print_summary(report);
            }
            if let Some(report) = reports.iter().find(|r| r.all_sources_failed()) {
                anyhow::bail!("{} sync failed for every source: {}", report.kind.as_str(), report.error_sample.join("; "));
            }
        }
        Commands::Migrate => {
            let store = PgIpoStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let store = connect_store(&config).await?;
            let port = config.web_port;
            let state = ipo_web::AppState::new(Arc::clone(&store), Arc::new(SystemClock), config.workspace_root.clone());
            let pipeline = Arc::new(SyncPipeline::new(config, store)?);
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            ipo_web::serve(state, port).await?;
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let store = connect_store(&config).await?;
            let pipeline = Arc::new(SyncPipeline::new(config, store)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "scheduler shutdown failed");
            }
        }
    }

    Ok(())
}

async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn IpoStore>> {
    let store = PgIpoStore::connect(&config.database_url).await?;
    Ok(Arc::new(store))
}

fn print_summary(report: &RunReport) {
    println!(
        "{} sync: run_id={} total={} succeeded={} failed={} persisted={} completeness={:.2}",
        report.kind.as_str(),
        report.run_id,
        report.total,
        report.succeeded,
        report.failed,
        report.persisted,
        report.completeness
    );
    for error in &report.error_sample {
        println!("  {error}");
    }
}

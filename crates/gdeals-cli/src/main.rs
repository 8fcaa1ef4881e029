use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gdeals_storage::{DealStore, PgDealStore};
use gdeals_sync::{SyncConfig, SyncRuntime};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "gdeals")]
#[command(about = "Free game giveaway aggregator")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass (ends with a liveness sweep).
    Sync,
    /// Run one liveness sweep against the current feed.
    Sweep,
    /// Print the tag catalog, refreshing it when stale.
    Tags {
        /// Refresh from the catalog even if the stored set is fresh.
        #[arg(long)]
        refresh: bool,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Serve the API and run the reconcile and sweep schedules.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Migrate => migrate().await?,
        Commands::Sync => {
            let runtime = SyncRuntime::connect(load_config()?).await?;
            let result = runtime.engine.run_pass().await;
            runtime.store.close().await;
            let report = result?;
            println!(
                "sync complete: run_id={} listings={} outcomes={} swept={}",
                report.run_id,
                report.fetched_listings,
                report.outcomes.len(),
                report.sweep.as_ref().map(|s| s.deactivated.len()).unwrap_or(0)
            );
        }
        Commands::Sweep => {
            let runtime = SyncRuntime::connect(load_config()?).await?;
            let result = runtime.sweeper.sweep().await;
            runtime.store.close().await;
            let report = result?;
            println!(
                "sweep complete: checked={} deactivated={} failed={}",
                report.checked,
                report.deactivated.len(),
                report.failed.len()
            );
        }
        Commands::Tags { refresh } => {
            let runtime = SyncRuntime::connect(load_config()?).await?;
            let result = if refresh {
                runtime.tag_catalog.refresh().await
            } else {
                runtime.tag_catalog.get_tags().await
            };
            runtime.store.close().await;
            let mut tags = result.context("loading tag catalog")?;
            tags.sort_by(|a, b| (a.kind, a.catalog_tag_id).cmp(&(b.kind, b.catalog_tag_id)));
            for tag in &tags {
                println!("{}\t{}\t{}", tag.kind.as_str(), tag.catalog_tag_id, tag.name);
            }
        }
        Commands::Serve => serve(load_config()?).await?,
    }

    Ok(())
}

fn load_config() -> Result<SyncConfig> {
    SyncConfig::from_env().context("loading configuration")
}

/// Only needs `DATABASE_URL`, so schema setup works before catalog credentials exist.
async fn migrate() -> Result<()> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let store = PgDealStore::connect(&database_url)
        .await
        .context("connecting to database")?;
    let migrated = store.migrate().await.context("running migrations");
    store.close().await;
    migrated?;
    info!("migrations applied");
    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let port = config.web_port;
    let runtime = SyncRuntime::connect(config).await?;

    let mut scheduler = runtime.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("reconcile and sweep schedules started");
    } else {
        warn!("scheduler disabled, serving stored deals only");
    }

    let served = gdeals_web::serve(runtime.store.clone(), port, shutdown_signal()).await;

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(%err, "scheduler did not shut down cleanly");
        }
    }
    runtime.store.close().await;
    info!("storage connection closed");
    served
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to init tracing: {err}")),
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to init tracing: {err}")),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                if let Err(err) = ctrl_c.await {
                    tracing::error!(%err, "ctrl-c signal handler failed");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }

    info!("shutdown signal received");
}

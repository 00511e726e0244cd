use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use embed_server::admission::JobService;
use embed_server::config::{AppConfig, CliConfig, FileConfig};
use embed_server::indexer::{Indexer, SubsonicClient};
use embed_server::job_store::{JobStore, SqliteJobStore};
use embed_server::pipeline::PipelineEngine;
use embed_server::queue::{JobQueue, SqliteJobQueue, WorkerPool};
use embed_server::resolver::{GdClient, UpstreamResolver};
use embed_server::server::{run_server, ServerConfig};
use embed_server::tagger::{LoftyTagger, Tagger};

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML configuration file.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Directory holding the SQLite databases.
    #[clap(long)]
    pub db_dir: Option<PathBuf>,

    /// Directory for per-job download workspaces.
    #[clap(long)]
    pub work_dir: Option<PathBuf>,

    /// Root of the music library downloads are moved into.
    #[clap(long)]
    pub music_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        port: cli_args.port,
        db_dir: cli_args.db_dir,
        work_dir: cli_args.work_dir,
        music_dir: cli_args.music_dir,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    if config.security.api_keys.is_empty() {
        warn!("No API keys configured; all /v1 requests will be rejected");
    }
    if let Some(addr) = &config.queue.redis_addr {
        warn!("REDIS_URL is set ({addr}) but this build uses the embedded queue; ignoring");
    }

    std::fs::create_dir_all(&config.db_dir)
        .with_context(|| format!("Failed to create db dir {:?}", config.db_dir))?;
    std::fs::create_dir_all(&config.storage.work_dir)
        .with_context(|| format!("Failed to create work dir {:?}", config.storage.work_dir))?;
    std::fs::create_dir_all(&config.storage.music_dir)
        .with_context(|| format!("Failed to create music dir {:?}", config.storage.music_dir))?;

    info!("Opening jobs database at {:?}...", config.jobs_db_path());
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(config.jobs_db_path())?);
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(config.queue_db_path())?);

    let resolver: Arc<dyn UpstreamResolver> = Arc::new(GdClient::new(&config.upstream));
    let indexer: Arc<dyn Indexer> = Arc::new(SubsonicClient::new(&config.indexer));
    let tagger: Arc<dyn Tagger> = Arc::new(LoftyTagger::new());

    if config.indexer.base_url.is_empty() {
        warn!("Indexer base URL not configured; scan stage will be skipped with warnings");
    } else {
        match indexer.ping().await {
            Ok(()) => info!("Indexer connection successful"),
            Err(e) => warn!("Indexer ping failed: {e:#}"),
        }
    }

    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        resolver,
        indexer,
        tagger,
        config.storage.clone(),
        &config.worker,
    ));

    let shutdown = CancellationToken::new();

    let pool = WorkerPool::new(
        queue.clone(),
        engine,
        config.worker.max_concurrent,
        Duration::from_secs(config.worker.poll_interval_secs),
        Duration::from_secs(config.worker.stale_claim_threshold_secs),
    );
    let pool_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    // Periodically drop terminal rows past the retention window.
    if config.worker.job_retention_days > 0 {
        let retention_days = config.worker.job_retention_days;
        let interval_hours = config.worker.prune_interval_hours;
        let pruning_store = store.clone();

        info!(
            "Job pruning enabled: retaining {} days, pruning every {} hours",
            retention_days, interval_hours
        );

        tokio::spawn(async move {
            let interval = Duration::from_secs(interval_hours * 60 * 60);
            let mut ticker = tokio::time::interval(interval);

            // Skip the first immediate tick, wait for the first interval
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let cutoff =
                    chrono::Utc::now().timestamp() - (retention_days as i64 * 24 * 60 * 60);

                match pruning_store.prune_terminal_older_than(cutoff) {
                    Ok(count) => {
                        if count > 0 {
                            info!("Pruned {} old jobs", count);
                        }
                    }
                    Err(e) => {
                        error!("Failed to prune old jobs: {e:#}");
                    }
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let jobs = Arc::new(JobService::new(store, queue));
    let server_config = ServerConfig {
        api_keys: config.security.api_keys.clone(),
    };

    info!("Ready to serve at port {}!", config.port);
    run_server(server_config, jobs, config.port, shutdown.clone()).await?;

    // Let in-flight downloads finish before exiting.
    shutdown.cancel();
    if let Err(e) = pool_handle.await {
        error!("Worker pool task failed: {e}");
    }

    Ok(())
}

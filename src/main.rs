use clap::Parser;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use registre_ocr::capacity::CapacityManager;
use registre_ocr::config::Config;
use registre_ocr::db::Database;
use registre_ocr::pipeline::{Pipeline, ProviderBundle};
use registre_ocr::pool_manager::PoolManager;
use registre_ocr::provider::claude::ClaudeVisionProvider;
use registre_ocr::provider::gemini::{GeminiFileProvider, GeminiVisionProvider};
use registre_ocr::provider::OcrProvider;
use registre_ocr::rasterizer::UnconfiguredRasterizer;
use registre_ocr::rate_limiter::RateLimiter;
use registre_ocr::sanitiser::NoopSanitiser;
use registre_ocr::stale_monitor::StaleMonitor;
use registre_ocr::storage::HttpBlobStorage;
use registre_ocr::worker::Worker;

/// Distributed OCR job processor for the land-registry extraction queue.
#[derive(Parser, Debug)]
#[command(name = "registre-ocr")]
struct Cli {
    /// Run one maintenance sweep (requeue ERREUR rows with attempt budget
    /// left) against every configured environment, then exit, instead of
    /// starting the worker pool.
    #[arg(long)]
    requeue_failed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db = Database::connect(&config).await?;

    if cli.requeue_failed {
        for env in registre_ocr::models::Environment::PRIORITY_ORDER {
            if !config.enabled_environments.contains(&env) {
                continue;
            }
            let count = db.requeue_failed(env).await?;
            tracing::info!(environment = env.as_str(), count, "requeued failed rows");
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    let providers = build_providers(&config);
    let rate_limiter = Arc::new(Mutex::new(
        RateLimiter::connect(&config.redis_url, config.rate.rpm_safe_max, config.rate.tpm_safe_max).await?,
    ));

    // Only one environment's storage base is wired up for the demo
    // deployment path; a multi-bucket storage layer per environment is a
    // straightforward extension once a second backend exists.
    let primary_env = config.enabled_environments[0];
    let storage = Arc::new(HttpBlobStorage::new(config.environments[&primary_env].storage_base_url.clone()));
    let rasterizer = Arc::new(UnconfiguredRasterizer);
    let sanitiser = Arc::new(NoopSanitiser);

    let pipeline = Arc::new(Pipeline::new(
        storage,
        rasterizer,
        sanitiser,
        providers,
        config.provider.clone(),
        rate_limiter,
    ));

    let capacity = Arc::new(CapacityManager::new(config.capacity.clone()));

    let pool_manager = PoolManager::new(db.clone(), &config.redis_url, config.pool.clone()).await?;
    let pool_manager_shutdown = shutdown.clone();
    let pool_manager_handle = tokio::spawn(pool_manager.run(pool_manager_shutdown));

    let stale_monitor = StaleMonitor::new(db.clone(), config.stale.clone());
    let stale_monitor_shutdown = shutdown.clone();
    let stale_monitor_handle = tokio::spawn(stale_monitor.run(stale_monitor_shutdown));

    let mut worker_handles = Vec::with_capacity(config.pool.size);
    for slot in 0..config.pool.size {
        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
        let worker = Worker::new(
            slot,
            config.pool.size,
            config.poll_interval,
            db.clone(),
            pipeline.clone(),
            capacity.clone(),
            redis_conn,
            &config.temp_dir,
        )?;
        let worker_shutdown = shutdown.clone();
        worker_handles.push(tokio::spawn(worker.run(worker_shutdown)));
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining workers");
    shutdown.cancel();

    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = pool_manager_handle.await;
    let _ = stale_monitor_handle.await;

    Ok(())
}

fn build_providers(config: &Config) -> ProviderBundle {
    let gemini_vision = config.provider.gemini_api_key.as_ref().map(|key| {
        Arc::new(GeminiVisionProvider::new(key.clone(), config.provider.gemini_model.clone(), config.provider.max_attempts))
            as Arc<dyn OcrProvider>
    });
    let gemini_file = config.provider.gemini_api_key.as_ref().map(|key| {
        Arc::new(GeminiFileProvider::new(key.clone(), config.provider.gemini_model.clone(), config.provider.max_attempts))
            as Arc<dyn OcrProvider>
    });
    let claude_vision = config.provider.claude_api_key.as_ref().map(|key| {
        Arc::new(ClaudeVisionProvider::new(key.clone(), config.provider.claude_model.clone(), config.provider.max_attempts))
            as Arc<dyn OcrProvider>
    });

    ProviderBundle { preferred: config.provider.preferred, gemini_vision, claude_vision, gemini_file }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

//! aptos-event-indexer entry point.
//!
//! Runs one polling loop per enabled event stream until Ctrl-C or until
//! every stream has stopped. Exits non-zero if any stream halted.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use aptos_event_indexer::cache::{CacheInvalidator, CacheKeys, NoopCache, RedisCache};
use aptos_event_indexer::config::IndexerConfig;
use aptos_event_indexer::observer::Processor;
use aptos_event_indexer::pipeline::{Driver, streams_from_config};
use aptos_event_indexer::source::EventSource;
use aptos_event_indexer::store::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = IndexerConfig::from_env()?;
    tracing::info!(
        node = %config.node_url,
        streams = config.streams.len(),
        "starting aptos-event-indexer"
    );

    // Persistence
    let store = PgStore::connect(&config).await?;
    if config.run_migrations {
        store.migrate().await?;
    }

    // Cache invalidation
    let cache: Arc<dyn CacheInvalidator> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url, config.cache_timeout).await?),
        None => {
            tracing::info!("REDIS_URL not set; cache invalidation disabled");
            Arc::new(NoopCache)
        }
    };

    // Pipeline
    let client = reqwest::Client::builder()
        .connect_timeout(config.http_timeout)
        .timeout(config.http_timeout)
        .build()
        .context("failed to build HTTP client")?;
    let source = EventSource::new(client, config.node_url.clone());
    let streams = streams_from_config::<PgStore>(&config, &source)?;
    let processor = Processor::new(
        store,
        cache,
        CacheKeys::new(config.cache_key_prefix.clone()),
        config.tx_timeout,
    )
    .with_cache_timeout(config.cache_timeout);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                // dropping the sender would stop every stream
                std::future::pending::<()>().await;
            }
        }
    });

    let driver = Driver::new(processor, config.poll, shutdown_rx);
    driver.run(streams).await?;

    tracing::info!("all streams stopped");
    Ok(())
}

use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use pixelchain::common::model::Config;
use pixelchain::engine::{StageConsumer, StageProcessor};
use pixelchain::errors::{Error, Result};
use pixelchain::imaging::build_filter;
use pixelchain::ledger::SeaOrmLedger;
use pixelchain::queue::{KafkaQueue, NackPolicy};
use pixelchain::storage::FileObjectStore;
use pixelchain::utils::connector::db_connection;
use pixelchain::utils::logger::LoggerConfig;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    let config_path =
        std::env::var("PIXELCHAIN_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = LoggerConfig::for_stage(&config.logger, config.stage.filter.slug()).init() {
        eprintln!("Failed to initialize logger: {}", e);
    }

    if let Err(e) = run(config).await {
        error!("Stage terminated: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting {} stage: {:?}", config.stage.filter, config);

    let db = db_connection(&config.database.url, config.database.pool_size).await?;
    let ledger = Arc::new(SeaOrmLedger::new(Arc::new(db)));
    ledger.ensure_schema().await?;

    let store = Arc::new(FileObjectStore::new(
        &config.storage.root,
        config.storage.temp_tag.clone(),
    ));
    let filter = build_filter(&config)?;

    let group_id = config
        .kafka
        .group_id
        .clone()
        .unwrap_or_else(|| format!("pixelchain-{}", config.stage.filter.slug()));
    let queue = Arc::new(KafkaQueue::new(
        &config.kafka,
        &group_id,
        NackPolicy::from_config(&config.backoff),
    )?);

    let processor = Arc::new(StageProcessor::new(
        filter,
        ledger,
        store.clone(),
        queue.clone(),
        &config,
    ));
    let consumer = StageConsumer::new(processor, queue, config.stage.concurrency);

    let (shutdown_tx, _) = broadcast::channel(1);
    let consuming = consumer.run(shutdown_tx.subscribe());
    let purging = purge_loop(
        store,
        Duration::from_secs(config.storage.temp_ttl_secs),
        shutdown_tx.subscribe(),
    );
    let signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested, finishing in-flight messages");
        let _ = shutdown_tx.send(());
        Ok::<(), Error>(())
    };

    futures::future::try_join3(consuming, purging, signal).await?;
    info!("Stage stopped");
    Ok(())
}

async fn purge_loop(
    store: Arc<FileObjectStore>,
    ttl: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            _ = ticker.tick() => match store.purge_expired(ttl).await {
                Ok(0) => {}
                Ok(removed) => info!("Purged {} expired temporary artifacts", removed),
                Err(e) => error!("Temporary artifact purge failed: {}", e),
            },
        }
    }
}

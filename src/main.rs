use std::sync::Arc;

use ride_dispatch::config::{AppConfig, StoreBackend};
use ride_dispatch::db::{self, KvStore, PartitionedStore, PostgresStore};
use ride_dispatch::{kafka, FleetModule};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    info!("Starting Ride Dispatch Service...");

    let partitions = config.dispatch.partition_count;
    let store = match config.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory store with {} partitions", partitions);
            PartitionedStore::in_memory(partitions)
        }
        StoreBackend::Postgres => {
            let pool = db::init_pool(&config.database_url).await?;
            info!("Connected to database");
            let shards = (0..partitions)
                .map(|p| Arc::new(PostgresStore::new(pool.clone(), p as i32)) as Arc<dyn KvStore>)
                .collect();
            PartitionedStore::new(shards)
        }
    };

    let module = FleetModule::launch(config.dispatch.clone(), store);

    if config.kafka_enabled {
        let depot = module.depot();
        tokio::select! {
            result = kafka::start_kafka_consumer(&config, depot) => {
                if let Err(e) = result {
                    error!("Kafka consumer failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        }
    } else {
        info!("Kafka intake disabled; waiting for shutdown signal");
        tokio::signal::ctrl_c().await?;
    }

    module.shutdown().await;
    info!("Ride Dispatch Service stopped");
    Ok(())
}

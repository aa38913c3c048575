//! Intake queue and partition lifecycle.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::FleetClient;
use crate::config::DispatchConfig;
use crate::db::PartitionedStore;
use crate::error::ClientError;
use crate::models::{IntakeEvent, LatLng, NearbyVehicle};
use crate::processor::{Clock, Outcome, PartitionClock, PartitionWorker, Router, SystemClock, Task};

/// How long [`Depot::append`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLevel {
    /// Return once the event is queued on its partition.
    Queued,
    /// Return once every stage the event triggers has finished.
    Processed,
}

#[derive(Clone)]
pub struct Depot {
    router: Router,
}

impl Depot {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    pub fn partition_count(&self) -> usize {
        self.router.partition_count()
    }

    pub async fn append(&self, event: IntakeEvent, ack: AckLevel) -> Result<Outcome, ClientError> {
        let partition = self.router.partition_of(&event.routing_key());
        debug!("Appending {} to partition {}", event.kind(), partition);

        match ack {
            AckLevel::Queued => {
                self.router
                    .submit(partition, Task::Intake { event, reply: None })
                    .map_err(|_| ClientError::Unavailable)?;
                Ok(Outcome::Queued)
            }
            AckLevel::Processed => {
                let (tx, rx) = oneshot::channel();
                self.router
                    .submit(
                        partition,
                        Task::Intake {
                            event,
                            reply: Some(tx),
                        },
                    )
                    .map_err(|_| ClientError::Unavailable)?;
                rx.await.map_err(|_| ClientError::Unavailable)
            }
        }
    }

    /// Asks every partition for its nearest available vehicles and keeps the
    /// overall `limit` closest.
    pub async fn nearest(&self, point: LatLng, limit: usize) -> Result<Vec<NearbyVehicle>, ClientError> {
        let mut pending = Vec::with_capacity(self.router.partition_count());
        for partition in 0..self.router.partition_count() {
            let (tx, rx) = oneshot::channel();
            self.router
                .submit(
                    partition,
                    Task::Nearest {
                        point,
                        limit,
                        reply: tx,
                    },
                )
                .map_err(|_| ClientError::Unavailable)?;
            pending.push(rx);
        }

        let mut merged = Vec::new();
        for result in futures::future::join_all(pending).await {
            merged.extend(result.map_err(|_| ClientError::Unavailable)??);
        }
        merged.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
        merged.truncate(limit);
        Ok(merged)
    }
}

/// The running set of partitions.
pub struct FleetModule {
    config: Arc<DispatchConfig>,
    store: PartitionedStore,
    depot: Depot,
    workers: Vec<JoinHandle<()>>,
}

impl FleetModule {
    /// Starts one worker per store shard. Must be called inside a tokio runtime.
    pub fn launch(config: DispatchConfig, store: PartitionedStore) -> Self {
        Self::launch_with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn launch_with_clock(
        config: DispatchConfig,
        store: PartitionedStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let partitions = store.partition_count();

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..partitions).map(|_| mpsc::unbounded_channel::<Task>()).unzip();
        let router = Router::new(senders);

        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(partition, tasks)| {
                let worker = PartitionWorker::new(
                    partition,
                    store.shard(partition),
                    PartitionClock::new(clock.clone()),
                    router.clone(),
                    config.clone(),
                );
                tokio::spawn(worker.run(tasks))
            })
            .collect();

        info!("Launched {} partitions", partitions);
        Self {
            config,
            store,
            depot: Depot::new(router),
            workers,
        }
    }

    pub fn depot(&self) -> Depot {
        self.depot.clone()
    }

    pub fn client(&self) -> FleetClient {
        FleetClient::new(self.depot.clone(), self.store.clone(), self.config.clone())
    }

    /// Closes intake, waits until every queued task and the stages it forwards
    /// have finished, then stops the partitions.
    pub async fn shutdown(self) {
        let router = &self.depot.router;
        router.close();
        if router.in_flight() > 0 {
            info!("Draining {} in-flight tasks before shutdown", router.in_flight());
        }
        router.drained().await;

        for partition in 0..router.partition_count() {
            if router.stop(partition).is_err() {
                warn!("Partition {} already stopped", partition);
            }
        }
        for worker in futures::future::join_all(self.workers).await {
            if let Err(e) = worker {
                warn!("Partition worker ended abnormally: {}", e);
            }
        }
        info!("All partitions stopped");
    }
}

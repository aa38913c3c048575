//! Partition workers. Each one owns its store shard, spatial index and clock,
//! and handles its tasks one at a time in arrival order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use super::clock::PartitionClock;
use super::ride_saga::{check_vehicle, Compensation, RideSaga};
use crate::config::DispatchConfig;
use crate::db::{self, partition_of, timestamp_sub_key, Key, KvStore, Space};
use crate::error::{RideRejection, StoreError};
use crate::models::ride::build_route;
use crate::models::rider::{normalize_email, rider_id_for_email};
use crate::models::{
    ActiveRide, CompletedRide, IntakeEvent, LatLng, LocationSample, NearbyVehicle, RideBegin,
    RideEnd, RideEvent, RiderRecord, RiderRegistration, VehicleCreate, VehicleRecord,
    VehicleUpdate,
};
use crate::spatial::SpatialIndex;

/// What became of an intake event. Only delivered to callers that wait for processing.
#[derive(Debug)]
pub enum Outcome {
    /// Accepted onto the owning partition's queue; not yet applied.
    Queued,
    /// Applied, or resolved to a no-op.
    Applied,
    RideStarted { ride_id: String },
    RideRejected(RideRejection),
    Failed(StoreError),
}

pub type Reply = oneshot::Sender<Outcome>;

/// Stages that run on the rider's partition.
#[derive(Debug)]
pub enum RiderStage {
    Register(RiderRecord),
    Confirm(RideSaga),
    Finish(CompletedRide),
}

pub enum Task {
    Intake {
        event: IntakeEvent,
        reply: Option<Reply>,
    },
    Rider {
        stage: RiderStage,
        reply: Option<Reply>,
    },
    /// Undo a committed stage, then deliver `then` to the caller.
    Compensate {
        action: Compensation,
        then: Outcome,
        reply: Option<Reply>,
    },
    Nearest {
        point: LatLng,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<NearbyVehicle>, StoreError>>,
    },
    Shutdown,
}

/// Tasks queued on or being handled by any partition.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

/// Queues of every partition, indexed by partition number.
///
/// Every task except a stop is counted from the moment it is queued until its
/// worker has finished it, including any follow-up stage it forwarded. Once
/// intake is closed and the count reaches zero, no saga is mid-flight.
#[derive(Clone)]
pub struct Router {
    senders: Arc<Vec<mpsc::UnboundedSender<Task>>>,
    in_flight: Arc<InFlight>,
}

impl Router {
    pub fn new(senders: Vec<mpsc::UnboundedSender<Task>>) -> Self {
        Self {
            senders: Arc::new(senders),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.senders.len()
    }

    pub fn partition_of(&self, routing_key: &str) -> usize {
        partition_of(routing_key, self.senders.len())
    }

    /// Queues a new task from outside the partitions. Refused once intake is closed.
    pub fn submit(&self, partition: usize, task: Task) -> Result<(), Task> {
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        if self.in_flight.closed.load(Ordering::SeqCst) {
            self.finish();
            return Err(task);
        }
        self.enqueue(partition, task)
    }

    /// Queues a follow-up stage. Accepted after intake closes, so running sagas complete.
    pub fn send(&self, partition: usize, task: Task) -> Result<(), Task> {
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        self.enqueue(partition, task)
    }

    pub fn route(&self, routing_key: &str, task: Task) -> Result<(), Task> {
        self.send(self.partition_of(routing_key), task)
    }

    fn enqueue(&self, partition: usize, task: Task) -> Result<(), Task> {
        self.senders[partition].send(task).map_err(|e| {
            self.finish();
            e.0
        })
    }

    /// Marks one counted task as handled.
    pub fn finish(&self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_one();
        }
    }

    /// Refuses further [`submit`](Self::submit)s.
    pub fn close(&self) {
        self.in_flight.closed.store(true, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Resolves once no counted task is queued or running.
    pub async fn drained(&self) {
        while self.in_flight() > 0 {
            self.in_flight.idle.notified().await;
        }
    }

    /// Asks `partition` to stop after the tasks already queued on it.
    pub fn stop(&self, partition: usize) -> Result<(), Task> {
        self.senders[partition].send(Task::Shutdown).map_err(|e| e.0)
    }
}

/// Where a handler sends its result.
enum Next {
    Reply(Outcome),
    Rider { rider_id: String, stage: RiderStage },
    Compensate { action: Compensation, then: Outcome },
}

fn respond(reply: Option<Reply>, outcome: Outcome) {
    if let Some(reply) = reply {
        // The caller may have stopped waiting.
        let _ = reply.send(outcome);
    }
}

pub struct PartitionWorker {
    partition: usize,
    store: Arc<dyn KvStore>,
    index: SpatialIndex,
    /// Vehicles of this partition holding an `ActiveRide` entry.
    reserved: HashSet<String>,
    clock: PartitionClock,
    router: Router,
    config: Arc<DispatchConfig>,
}

impl PartitionWorker {
    pub fn new(
        partition: usize,
        store: Arc<dyn KvStore>,
        clock: PartitionClock,
        router: Router,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            partition,
            store,
            index: SpatialIndex::new(),
            reserved: HashSet::new(),
            clock,
            router,
            config,
        }
    }

    pub async fn run(mut self, mut tasks: mpsc::UnboundedReceiver<Task>) {
        info!("Partition {} worker started", self.partition);

        while let Some(task) = tasks.recv().await {
            match task {
                Task::Shutdown => break,
                Task::Intake { event, reply } => self.apply(event, reply).await,
                Task::Rider { stage, reply } => self.apply_rider_stage(stage, reply).await,
                Task::Compensate {
                    action,
                    then,
                    reply,
                } => {
                    self.compensate(action).await;
                    respond(reply, then);
                }
                Task::Nearest {
                    point,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(self.nearest(point, limit).await);
                }
            }
            self.router.finish();
        }

        info!(
            "Partition {} worker stopped ({} vehicles indexed)",
            self.partition,
            self.index.len()
        );
    }

    async fn apply(&mut self, event: IntakeEvent, reply: Option<Reply>) {
        debug!(
            "Partition {} applying {} for {}",
            self.partition,
            event.kind(),
            event.routing_key()
        );
        let next = match event {
            IntakeEvent::VehicleCreate(e) => self.create_vehicle(e).await,
            IntakeEvent::VehicleUpdate(e) => self.update_vehicle(e).await,
            IntakeEvent::RiderRegistration(e) => self.claim_email(e).await,
            IntakeEvent::Ride(RideEvent::Begin(e)) => self.begin_ride(e).await,
            IntakeEvent::Ride(RideEvent::End(e)) => self.end_ride(e).await,
        };
        self.dispatch(next, reply);
    }

    async fn apply_rider_stage(&mut self, stage: RiderStage, reply: Option<Reply>) {
        let next = match stage {
            RiderStage::Register(record) => self.register_rider(record).await,
            RiderStage::Confirm(saga) => Ok(self.confirm_ride(saga).await),
            RiderStage::Finish(ride) => Ok(self.finish_ride(ride).await),
        };
        self.dispatch(next, reply);
    }

    fn dispatch(&self, next: Result<Next, StoreError>, reply: Option<Reply>) {
        match next {
            Ok(Next::Reply(outcome)) => respond(reply, outcome),
            Ok(Next::Rider { rider_id, stage }) => {
                self.forward(&rider_id, Task::Rider { stage, reply });
            }
            Ok(Next::Compensate { action, then }) => {
                let Compensation::ReleaseVehicle { vehicle_id, .. } = &action;
                let vehicle_id = vehicle_id.clone();
                self.forward(
                    &vehicle_id,
                    Task::Compensate {
                        action,
                        then,
                        reply,
                    },
                );
            }
            Err(e) => {
                error!("Partition {} store error: {}", self.partition, e);
                respond(reply, Outcome::Failed(e));
            }
        }
    }

    fn forward(&self, routing_key: &str, task: Task) {
        if self.router.route(routing_key, task).is_err() {
            error!(
                "Partition owning {} has stopped; follow-up stage dropped",
                routing_key
            );
        }
    }

    // Vehicle partition

    async fn create_vehicle(&mut self, create: VehicleCreate) -> Result<Next, StoreError> {
        let record = VehicleRecord::new(&create.vehicle_id, create.creation_token);
        let key = Key::new(Space::Vehicle, &create.vehicle_id);

        if db::write_if_absent(&*self.store, key, &record).await? {
            self.index
                .insert(&create.vehicle_id, record.location.as_point());
            info!("Created vehicle {}", create.vehicle_id);
        } else {
            debug!("Vehicle {} already exists; create ignored", create.vehicle_id);
        }
        Ok(Next::Reply(Outcome::Applied))
    }

    async fn update_vehicle(&mut self, update: VehicleUpdate) -> Result<Next, StoreError> {
        let store = &*self.store;
        let key = Key::new(Space::Vehicle, &update.vehicle_id);

        if !update.location.is_finite() {
            warn!(
                "Update for vehicle {} with non-finite location ignored",
                update.vehicle_id
            );
            return Ok(Next::Reply(Outcome::Applied));
        }

        let Some(mut vehicle) = db::read::<VehicleRecord>(store, key.clone()).await? else {
            debug!("Update for unknown vehicle {} ignored", update.vehicle_id);
            return Ok(Next::Reply(Outcome::Applied));
        };

        vehicle.battery = update.battery.min(100);
        vehicle.location = update.location;
        db::write(store, key, &vehicle).await?;

        let timestamp = self.clock.tick();
        let sample = LocationSample {
            vehicle_id: update.vehicle_id.clone(),
            timestamp,
            location: update.location,
        };
        let sample_key = Key::sub(
            Space::LocationHistory,
            &update.vehicle_id,
            &timestamp_sub_key(timestamp),
        );
        db::write(store, sample_key, &sample).await?;

        self.index
            .insert(&update.vehicle_id, update.location.as_point());
        Ok(Next::Reply(Outcome::Applied))
    }

    async fn begin_ride(&mut self, begin: RideBegin) -> Result<Next, StoreError> {
        let store = &*self.store;
        let vehicle: Option<VehicleRecord> =
            db::read(store, Key::new(Space::Vehicle, &begin.vehicle_id)).await?;
        let active: Option<ActiveRide> =
            db::read(store, Key::new(Space::ActiveRide, &begin.vehicle_id)).await?;

        let start_location = match check_vehicle(
            vehicle.as_ref(),
            active.as_ref(),
            &begin.rider_location,
            &self.config,
        ) {
            Ok(vehicle) => vehicle.location,
            Err(rejection) => {
                info!(
                    "Ride {} on vehicle {} rejected: {}",
                    begin.ride_id, begin.vehicle_id, rejection
                );
                return Ok(Next::Reply(Outcome::RideRejected(rejection)));
            }
        };

        let mut saga = RideSaga::new(&begin);
        let reservation = saga.reserve(start_location, self.clock.tick());
        db::write(
            store,
            Key::new(Space::ActiveRide, &begin.vehicle_id),
            &reservation,
        )
        .await?;
        self.reserved.insert(begin.vehicle_id.clone());
        debug!(
            "Reserved vehicle {} for ride {}",
            begin.vehicle_id, begin.ride_id
        );

        Ok(Next::Rider {
            rider_id: begin.rider_id,
            stage: RiderStage::Confirm(saga),
        })
    }

    async fn end_ride(&mut self, end: RideEnd) -> Result<Next, StoreError> {
        let store = &*self.store;
        let ride_key = Key::new(Space::ActiveRide, &end.vehicle_id);

        let Some(active) = db::read::<ActiveRide>(store, ride_key.clone()).await? else {
            debug!("No active ride on vehicle {}; end ignored", end.vehicle_id);
            return Ok(Next::Reply(Outcome::Applied));
        };
        if active.rider_id != end.rider_id {
            debug!(
                "Rider {} may not end ride {} on vehicle {}; ignored",
                end.rider_id, active.ride_id, end.vehicle_id
            );
            return Ok(Next::Reply(Outcome::Applied));
        }

        let mut saga = RideSaga::in_progress(&end.vehicle_id, &active);
        let end_timestamp = self.clock.tick();
        let end_location = db::read::<VehicleRecord>(store, Key::new(Space::Vehicle, &end.vehicle_id))
            .await?
            .map(|v| v.location)
            .unwrap_or(active.start_location);
        let samples: Vec<LocationSample> = db::read_range(
            store,
            Space::LocationHistory,
            &end.vehicle_id,
            timestamp_sub_key(active.start_timestamp),
            timestamp_sub_key(end_timestamp),
        )
        .await?;
        let route = build_route(
            active.start_location,
            active.start_timestamp,
            end_timestamp,
            &samples,
        );

        // Everything the rider stage needs is in hand; only now release the vehicle.
        store.delete(ride_key).await?;
        self.reserved.remove(&end.vehicle_id);
        saga.finish();
        info!(
            "Ride {} on vehicle {} ended with {} route points",
            active.ride_id,
            end.vehicle_id,
            route.len()
        );

        Ok(Next::Rider {
            rider_id: active.rider_id.clone(),
            stage: RiderStage::Finish(CompletedRide {
                rider_id: active.rider_id,
                ride_id: active.ride_id,
                vehicle_id: end.vehicle_id,
                start_location: active.start_location,
                end_location,
                start_timestamp: active.start_timestamp,
                end_timestamp,
                route,
            }),
        })
    }

    /// Retries until the reservation is gone. A vehicle left reserved could
    /// never be ridden again.
    async fn compensate(&mut self, action: Compensation) {
        let Compensation::ReleaseVehicle {
            vehicle_id,
            ride_id,
        } = action;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.release_vehicle(&vehicle_id, &ride_id).await {
                Ok(()) => return,
                Err(e) => {
                    error!(
                        "Releasing vehicle {} from ride {} failed (attempt {}): {}; retrying",
                        vehicle_id, ride_id, attempt, e
                    );
                    tokio::time::sleep(self.config.compensation_backoff()).await;
                }
            }
        }
    }

    async fn release_vehicle(&mut self, vehicle_id: &str, ride_id: &str) -> Result<(), StoreError> {
        let key = Key::new(Space::ActiveRide, vehicle_id);
        match db::read::<ActiveRide>(&*self.store, key.clone()).await? {
            Some(active) if active.ride_id == ride_id => {
                self.store.delete(key).await?;
                self.reserved.remove(vehicle_id);
                info!("Released vehicle {} from rejected ride {}", vehicle_id, ride_id);
            }
            _ => debug!(
                "Vehicle {} no longer holds ride {}; nothing to release",
                vehicle_id, ride_id
            ),
        }
        Ok(())
    }

    async fn nearest(&self, point: LatLng, limit: usize) -> Result<Vec<NearbyVehicle>, StoreError> {
        // Over-fetch by the number of reserved vehicles so filtering them out
        // still leaves `limit` candidates when enough exist.
        let candidates = self
            .index
            .nearest(point.as_point(), limit.saturating_add(self.reserved.len()));

        let mut found = Vec::with_capacity(limit.min(candidates.len()));
        for candidate in candidates {
            if found.len() == limit {
                break;
            }
            if self.reserved.contains(&candidate.id) {
                continue;
            }
            let key = Key::new(Space::Vehicle, &candidate.id);
            if let Some(vehicle) = db::read::<VehicleRecord>(&*self.store, key).await? {
                found.push(NearbyVehicle {
                    vehicle_id: candidate.id,
                    battery: vehicle.battery,
                    location: vehicle.location,
                    distance_meters: candidate.distance_meters,
                });
            }
        }
        Ok(found)
    }

    // Email-index partition

    async fn claim_email(&mut self, registration: RiderRegistration) -> Result<Next, StoreError> {
        let Some(email) = normalize_email(&registration.email) else {
            warn!("Registration with invalid email '{}' ignored", registration.email);
            return Ok(Next::Reply(Outcome::Applied));
        };
        let rider_id = rider_id_for_email(&email);

        let claimed = db::write_if_absent(
            &*self.store,
            Key::new(Space::EmailIndex, &email),
            &rider_id,
        )
        .await?;
        if !claimed {
            // The rider record is written if-absent as well, so forwarding
            // again only repairs a registration whose second stage was lost.
            debug!("Email {} already claimed by rider {}", email, rider_id);
        }

        Ok(Next::Rider {
            rider_id: rider_id.clone(),
            stage: RiderStage::Register(RiderRecord {
                rider_id,
                email,
                creation_token: registration.creation_token,
                active_ride: false,
            }),
        })
    }

    // Rider partition

    async fn register_rider(&mut self, record: RiderRecord) -> Result<Next, StoreError> {
        let key = Key::new(Space::Rider, &record.rider_id);
        if db::write_if_absent(&*self.store, key, &record).await? {
            info!("Registered rider {}", record.rider_id);
        } else {
            debug!("Rider {} already registered", record.rider_id);
        }
        Ok(Next::Reply(Outcome::Applied))
    }

    async fn confirm_ride(&mut self, mut saga: RideSaga) -> Next {
        match self.mark_rider_active(&saga.rider_id).await {
            Ok(None) => {
                saga.confirm();
                info!(
                    "Ride {} started: rider {} on vehicle {}",
                    saga.ride_id, saga.rider_id, saga.vehicle_id
                );
                Next::Reply(Outcome::RideStarted {
                    ride_id: saga.ride_id,
                })
            }
            Ok(Some(rejection)) => {
                info!(
                    "Ride {} rejected on rider stage: {}; releasing vehicle {}",
                    saga.ride_id, rejection, saga.vehicle_id
                );
                Next::Compensate {
                    action: saga.roll_back(),
                    then: Outcome::RideRejected(rejection),
                }
            }
            Err(e) => {
                error!(
                    "Rider stage of ride {} failed: {}; releasing vehicle {}",
                    saga.ride_id, e, saga.vehicle_id
                );
                Next::Compensate {
                    action: saga.roll_back(),
                    then: Outcome::Failed(e),
                }
            }
        }
    }

    /// Sets the rider's active-ride flag, or says why it cannot.
    async fn mark_rider_active(&self, rider_id: &str) -> Result<Option<RideRejection>, StoreError> {
        let key = Key::new(Space::Rider, rider_id);
        let Some(mut rider) = db::read::<RiderRecord>(&*self.store, key.clone()).await? else {
            return Ok(Some(RideRejection::NotFound));
        };
        if rider.active_ride {
            return Ok(Some(RideRejection::RiderBusy));
        }
        rider.active_ride = true;
        db::write(&*self.store, key, &rider).await?;
        Ok(None)
    }

    /// The vehicle was already released, so this stage must land: retried until it does.
    async fn finish_ride(&mut self, ride: CompletedRide) -> Next {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.record_completed_ride(&ride).await {
                Ok(()) => return Next::Reply(Outcome::Applied),
                Err(e) => {
                    error!(
                        "Recording ride {} for rider {} failed (attempt {}): {}; retrying",
                        ride.ride_id, ride.rider_id, attempt, e
                    );
                    tokio::time::sleep(self.config.compensation_backoff()).await;
                }
            }
        }
    }

    async fn record_completed_ride(&self, ride: &CompletedRide) -> Result<(), StoreError> {
        let store = &*self.store;
        let key = Key::new(Space::Rider, &ride.rider_id);

        match db::read::<RiderRecord>(store, key.clone()).await? {
            Some(mut rider) if rider.active_ride => {
                rider.active_ride = false;
                db::write(store, key, &rider).await?;
            }
            Some(_) => {}
            None => warn!(
                "Completed ride {} belongs to unknown rider {}",
                ride.ride_id, ride.rider_id
            ),
        }

        let history_key = Key::sub(Space::RideHistory, &ride.rider_id, &ride.ride_id);
        if !db::write_if_absent(store, history_key, ride).await? {
            debug!("Ride {} already recorded", ride.ride_id);
        }
        Ok(())
    }
}

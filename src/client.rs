//! Caller-facing operations. Creates are confirmed by reading back the record
//! and comparing its creation token; the read may precede the write, so it is polled.

use std::sync::Arc;

use rand::Rng;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::db::{self, Key, PartitionedStore, Space};
use crate::error::ClientError;
use crate::intake::{AckLevel, Depot};
use crate::models::rider::normalize_email;
use crate::models::{
    ActiveRide, CompletedRide, IntakeEvent, LatLng, NearbyVehicle, RideBegin, RideEnd, RideEvent,
    RiderRecord, RiderRegistration, VehicleCreate, VehicleRecord, VehicleUpdate,
};
use crate::processor::Outcome;

const VEHICLE_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Upper bound on a nearby-vehicles query, whatever the caller asks for.
pub const MAX_NEAREST_LIMIT: usize = 10_000;

fn checked_location(lat: f64, lon: f64) -> Result<LatLng, ClientError> {
    let location = LatLng::new(lat, lon);
    if location.is_finite() {
        Ok(location)
    } else {
        Err(ClientError::InvalidLocation)
    }
}

fn generate_vehicle_id(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| VEHICLE_ID_ALPHABET[rng.gen_range(0..VEHICLE_ID_ALPHABET.len())] as char)
        .collect()
}

#[derive(Clone)]
pub struct FleetClient {
    depot: Depot,
    store: PartitionedStore,
    config: Arc<DispatchConfig>,
}

impl FleetClient {
    pub fn new(depot: Depot, store: PartitionedStore, config: Arc<DispatchConfig>) -> Self {
        Self {
            depot,
            store,
            config,
        }
    }

    // Vehicles

    /// Registers a new vehicle under a fresh short code, retrying on collisions.
    pub async fn create_vehicle(&self) -> Result<String, ClientError> {
        let creation_token = Uuid::new_v4();

        for attempt in 1..=self.config.create_max_attempts {
            let vehicle_id = generate_vehicle_id(self.config.vehicle_id_length);
            let event = IntakeEvent::VehicleCreate(VehicleCreate {
                creation_token,
                vehicle_id: vehicle_id.clone(),
            });
            self.depot.append(event, AckLevel::Queued).await?;

            let record: VehicleRecord = self
                .await_record(Key::new(Space::Vehicle, &vehicle_id), &vehicle_id)
                .await?;
            if record.creation_token == creation_token {
                info!("Vehicle {} created", vehicle_id);
                return Ok(vehicle_id);
            }
            debug!(
                "Vehicle id {} already taken (attempt {}); retrying",
                vehicle_id, attempt
            );
        }

        Err(ClientError::DuplicateIdentifier)
    }

    pub async fn update_vehicle(
        &self,
        vehicle_id: &str,
        battery: u8,
        lat: f64,
        lon: f64,
    ) -> Result<(), ClientError> {
        let event = IntakeEvent::VehicleUpdate(VehicleUpdate {
            vehicle_id: vehicle_id.to_string(),
            battery,
            location: checked_location(lat, lon)?,
        });
        match self.depot.append(event, AckLevel::Processed).await? {
            Outcome::Failed(e) => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub async fn vehicle(&self, vehicle_id: &str) -> Result<Option<VehicleRecord>, ClientError> {
        let shard = self.store.shard_for(vehicle_id);
        Ok(db::read(&*shard, Key::new(Space::Vehicle, vehicle_id)).await?)
    }

    /// Nearest vehicles not currently in a ride, closest first. `limit`
    /// defaults to the configured nearest limit.
    pub async fn vehicles_near(
        &self,
        lat: f64,
        lon: f64,
        limit: Option<usize>,
    ) -> Result<Vec<NearbyVehicle>, ClientError> {
        let limit = limit
            .unwrap_or(self.config.nearest_limit)
            .min(MAX_NEAREST_LIMIT);
        self.depot.nearest(checked_location(lat, lon)?, limit).await
    }

    // Riders

    /// Registers `email`, returning the rider id, or `None` if the email is invalid.
    pub async fn create_rider(&self, email: &str) -> Result<Option<String>, ClientError> {
        match self.register_rider(email).await {
            Ok(rider_id) => Ok(Some(rider_id)),
            Err(ClientError::InvalidEmail) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn register_rider(&self, email: &str) -> Result<String, ClientError> {
        let email = normalize_email(email).ok_or(ClientError::InvalidEmail)?;
        let creation_token = Uuid::new_v4();

        let event = IntakeEvent::RiderRegistration(RiderRegistration {
            creation_token,
            email: email.clone(),
        });
        self.depot.append(event, AckLevel::Queued).await?;

        let rider_id: String = self
            .await_record(Key::new(Space::EmailIndex, &email), &email)
            .await?;
        let rider: RiderRecord = self
            .await_record(Key::new(Space::Rider, &rider_id), &rider_id)
            .await?;

        if rider.creation_token == creation_token {
            info!("Rider {} registered", rider_id);
        } else {
            debug!("Email {} already belongs to rider {}", email, rider_id);
        }
        Ok(rider_id)
    }

    pub async fn rider(&self, rider_id: &str) -> Result<Option<RiderRecord>, ClientError> {
        let shard = self.store.shard_for(rider_id);
        Ok(db::read(&*shard, Key::new(Space::Rider, rider_id)).await?)
    }

    // Rides

    /// Starts a ride, returning its id, or the reason it could not start.
    pub async fn begin_ride(
        &self,
        vehicle_id: &str,
        rider_id: &str,
        rider_lat: f64,
        rider_lon: f64,
    ) -> Result<String, ClientError> {
        let rider_location = checked_location(rider_lat, rider_lon)?;
        let ride_id = Uuid::new_v4().to_string();
        let event = IntakeEvent::Ride(RideEvent::Begin(RideBegin {
            ride_id: ride_id.clone(),
            rider_id: rider_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            rider_location,
        }));

        match self.depot.append(event, AckLevel::Processed).await? {
            Outcome::RideStarted { ride_id: started } if started == ride_id => Ok(ride_id),
            Outcome::RideRejected(rejection) => Err(rejection.into()),
            Outcome::Failed(e) => Err(e.into()),
            other => {
                warn!("Unexpected outcome for ride {}: {:?}", ride_id, other);
                Err(ClientError::Unavailable)
            }
        }
    }

    /// Ends the rider's ride on `vehicle_id`. Missing rides and rides owned by
    /// another rider are ignored; only a stopped partition is reported.
    pub async fn end_ride(&self, vehicle_id: &str, rider_id: &str) -> Result<(), ClientError> {
        let event = IntakeEvent::Ride(RideEvent::End(RideEnd {
            rider_id: rider_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
        }));
        if let Outcome::Failed(e) = self.depot.append(event, AckLevel::Processed).await? {
            warn!("Ending ride on vehicle {} failed: {}", vehicle_id, e);
        }
        Ok(())
    }

    pub async fn active_ride(&self, vehicle_id: &str) -> Result<Option<ActiveRide>, ClientError> {
        let shard = self.store.shard_for(vehicle_id);
        Ok(db::read(&*shard, Key::new(Space::ActiveRide, vehicle_id)).await?)
    }

    /// Completed rides of `rider_id`, oldest first.
    pub async fn ride_history(&self, rider_id: &str) -> Result<Vec<CompletedRide>, ClientError> {
        let shard = self.store.shard_for(rider_id);
        let mut rides: Vec<CompletedRide> =
            db::read_all(&*shard, Space::RideHistory, rider_id).await?;
        rides.sort_by_key(|r| r.start_timestamp);
        Ok(rides)
    }

    /// Polls `key` on the partition owning `routing_key` until it exists.
    async fn await_record<T: DeserializeOwned>(
        &self,
        key: Key,
        routing_key: &str,
    ) -> Result<T, ClientError> {
        let shard = self.store.shard_for(routing_key);
        let attempts = self.config.confirm_retries.max(1);
        for _ in 0..attempts {
            if let Some(record) = db::read(&*shard, key.clone()).await? {
                return Ok(record);
            }
            tokio::time::sleep(self.config.confirm_backoff()).await;
        }
        Err(ClientError::ConfirmationTimeout { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::error::{RideRejection, StoreError};
    use crate::intake::FleetModule;
    use crate::spatial::haversine_meters;
    use crate::test_support::{faulty_shards, memory_shards};

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            compensation_backoff_ms: 1,
            confirm_backoff_ms: 1,
            ..DispatchConfig::default()
        }
    }

    fn launch(config: DispatchConfig, partitions: usize) -> (FleetModule, FleetClient, Vec<Arc<MemoryStore>>) {
        let (store, shards) = memory_shards(partitions);
        let module = FleetModule::launch(config, store);
        let client = module.client();
        (module, client, shards)
    }

    async fn ready_vehicle(client: &FleetClient, battery: u8, lat: f64, lon: f64) -> String {
        let vehicle_id = client.create_vehicle().await.unwrap();
        client.update_vehicle(&vehicle_id, battery, lat, lon).await.unwrap();
        vehicle_id
    }

    async fn rider(client: &FleetClient, email: &str) -> String {
        client.create_rider(email).await.unwrap().unwrap()
    }

    async fn count_entries(shards: &[Arc<MemoryStore>], space: Space) -> usize {
        let mut total = 0;
        for shard in shards {
            total += shard.entries(space).await.len();
        }
        total
    }

    async fn count_active_riders(shards: &[Arc<MemoryStore>]) -> usize {
        let mut total = 0;
        for shard in shards {
            for (_, bytes) in shard.entries(Space::Rider).await {
                let rider: RiderRecord = serde_json::from_slice(&bytes).unwrap();
                if rider.active_ride {
                    total += 1;
                }
            }
        }
        total
    }

    #[tokio::test]
    async fn test_create_vehicle_starts_empty_at_origin() {
        let (module, client, _) = launch(test_config(), 4);

        let vehicle_id = client.create_vehicle().await.unwrap();
        assert_eq!(vehicle_id.len(), 4);
        assert!(vehicle_id
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        let vehicle = client.vehicle(&vehicle_id).await.unwrap().unwrap();
        assert_eq!(vehicle.battery, 0);
        assert_eq!(vehicle.location, LatLng::ORIGIN);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_vehicle_gives_up_when_every_id_is_taken() {
        let config = DispatchConfig {
            vehicle_id_length: 0,
            create_max_attempts: 3,
            ..test_config()
        };
        let (module, client, _) = launch(config, 2);

        // Only one id of length zero exists.
        assert_eq!(client.create_vehicle().await.unwrap(), "");
        assert!(matches!(
            client.create_vehicle().await,
            Err(ClientError::DuplicateIdentifier)
        ));

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_of_unknown_vehicle_is_ignored() {
        let (module, client, shards) = launch(test_config(), 2);

        client.update_vehicle("NONE", 50, 1.0, 1.0).await.unwrap();
        assert!(client.vehicle("NONE").await.unwrap().is_none());
        assert_eq!(count_entries(&shards, Space::LocationHistory).await, 0);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_rider_finds_vehicle_busy() {
        let (module, client, _) = launch(test_config(), 4);
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let first = rider(&client, "first@example.com").await;
        let second = rider(&client, "second@example.com").await;

        let ride_id = client.begin_ride(&vehicle, &first, 0.0, 0.0).await.unwrap();
        assert!(!ride_id.is_empty());
        assert!(matches!(
            client.begin_ride(&vehicle, &second, 0.0, 0.0).await,
            Err(ClientError::Rejected(RideRejection::VehicleBusy))
        ));

        let active = client.active_ride(&vehicle).await.unwrap().unwrap();
        assert_eq!(active.ride_id, ride_id);
        assert_eq!(active.rider_id, first);
        assert!(client.rider(&first).await.unwrap().unwrap().active_ride);
        assert!(!client.rider(&second).await.unwrap().unwrap().active_ride);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_low_battery_is_rejected() {
        let (module, client, _) = launch(test_config(), 4);
        let vehicle = ready_vehicle(&client, 9, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        assert!(matches!(
            client.begin_ride(&vehicle, &rider_id, 0.0, 0.0).await,
            Err(ClientError::Rejected(RideRejection::LowBattery))
        ));
        assert!(client.active_ride(&vehicle).await.unwrap().is_none());

        client.update_vehicle(&vehicle, 10, 0.0, 0.0).await.unwrap();
        assert!(client.begin_ride(&vehicle, &rider_id, 0.0, 0.0).await.is_ok());

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_pickup_distance_limit_is_inclusive() {
        let rider_lat = 0.0002;
        let config = DispatchConfig {
            max_pickup_distance_meters: haversine_meters([0.0, 0.0], [rider_lat, 0.0]),
            ..test_config()
        };
        let (module, client, _) = launch(config, 4);
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        assert!(matches!(
            client.begin_ride(&vehicle, &rider_id, rider_lat * 1.01, 0.0).await,
            Err(ClientError::Rejected(RideRejection::TooFar))
        ));
        assert!(client
            .begin_ride(&vehicle, &rider_id, rider_lat, 0.0)
            .await
            .is_ok());

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_rider_just_beyond_25_meters_is_too_far() {
        let (module, client, _) = launch(test_config(), 4);
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        // 0.000226 degrees of latitude is about 25.13 meters.
        assert!(haversine_meters([0.0, 0.0], [0.000226, 0.0]) > 25.1);
        assert!(matches!(
            client.begin_ride(&vehicle, &rider_id, 0.000226, 0.0).await,
            Err(ClientError::Rejected(RideRejection::TooFar))
        ));

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_vehicle_is_not_found() {
        let (module, client, _) = launch(test_config(), 4);
        let rider_id = rider(&client, "a@b.com").await;

        assert!(matches!(
            client.begin_ride("ZZZZ", &rider_id, 0.0, 0.0).await,
            Err(ClientError::Rejected(RideRejection::NotFound))
        ));

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_rider_releases_second_vehicle() {
        let (module, client, shards) = launch(test_config(), 4);
        let first = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let second = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        client.begin_ride(&first, &rider_id, 0.0, 0.0).await.unwrap();
        assert!(matches!(
            client.begin_ride(&second, &rider_id, 0.0, 0.0).await,
            Err(ClientError::Rejected(RideRejection::RiderBusy))
        ));

        assert!(client.active_ride(&second).await.unwrap().is_none());
        assert_eq!(count_entries(&shards, Space::ActiveRide).await, 1);

        // The released vehicle is offered again.
        let near = client.vehicles_near(0.0, 0.0, None).await.unwrap();
        let ids: Vec<&str> = near.iter().map(|v| v.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec![second.as_str()]);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_rider_releases_vehicle() {
        let (module, client, _) = launch(test_config(), 4);
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;

        assert!(matches!(
            client.begin_ride(&vehicle, "no-such-rider", 0.0, 0.0).await,
            Err(ClientError::Rejected(RideRejection::NotFound))
        ));
        assert!(client.active_ride(&vehicle).await.unwrap().is_none());

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_follows_updates_during_ride() {
        let (module, client, _) = launch(test_config(), 4);
        let vehicle = ready_vehicle(&client, 100, 1.0, 2.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        let ride_id = client.begin_ride(&vehicle, &rider_id, 1.0, 2.0).await.unwrap();
        for (lat, lon) in [(3.0, 4.0), (5.0, 6.0), (7.0, 8.0)] {
            client.update_vehicle(&vehicle, 90, lat, lon).await.unwrap();
        }
        client.end_ride(&vehicle, &rider_id).await.unwrap();

        let history = client.ride_history(&rider_id).await.unwrap();
        assert_eq!(history.len(), 1);
        let ride = &history[0];
        assert_eq!(ride.ride_id, ride_id);
        assert_eq!(ride.vehicle_id, vehicle);
        assert_eq!(
            ride.route,
            vec![
                LatLng::new(1.0, 2.0),
                LatLng::new(3.0, 4.0),
                LatLng::new(5.0, 6.0),
                LatLng::new(7.0, 8.0),
            ]
        );
        assert_eq!(ride.start_location, LatLng::new(1.0, 2.0));
        assert_eq!(ride.end_location, LatLng::new(7.0, 8.0));
        assert!(ride.end_timestamp > ride.start_timestamp);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_consecutive_rides_do_not_share_samples() {
        let (module, client, _) = launch(test_config(), 4);
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        client.begin_ride(&vehicle, &rider_id, 0.0, 0.0).await.unwrap();
        client.update_vehicle(&vehicle, 100, 0.0001, 0.0).await.unwrap();
        client.end_ride(&vehicle, &rider_id).await.unwrap();

        client.begin_ride(&vehicle, &rider_id, 0.0001, 0.0).await.unwrap();
        client.end_ride(&vehicle, &rider_id).await.unwrap();

        let history = client.ride_history(&rider_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0].route,
            vec![LatLng::new(0.0, 0.0), LatLng::new(0.0001, 0.0)]
        );
        assert_eq!(history[1].route, vec![LatLng::new(0.0001, 0.0)]);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_ride_twice_matches_ending_once() {
        let (module, client, shards) = launch(test_config(), 4);
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;
        client.begin_ride(&vehicle, &rider_id, 0.0, 0.0).await.unwrap();

        client.end_ride(&vehicle, &rider_id).await.unwrap();
        let history_once = client.ride_history(&rider_id).await.unwrap();
        let rider_once = client.rider(&rider_id).await.unwrap().unwrap();

        client.end_ride(&vehicle, &rider_id).await.unwrap();
        let history_twice = client.ride_history(&rider_id).await.unwrap();
        let rider_twice = client.rider(&rider_id).await.unwrap().unwrap();

        assert_eq!(history_once.len(), 1);
        assert_eq!(history_once, history_twice);
        assert_eq!(rider_once, rider_twice);
        assert!(!rider_twice.active_ride);
        assert_eq!(count_entries(&shards, Space::ActiveRide).await, 0);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_only_the_riding_rider_can_end() {
        let (module, client, _) = launch(test_config(), 4);
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let owner = rider(&client, "owner@example.com").await;
        let other = rider(&client, "other@example.com").await;
        let ride_id = client.begin_ride(&vehicle, &owner, 0.0, 0.0).await.unwrap();

        client.end_ride(&vehicle, &other).await.unwrap();
        let active = client.active_ride(&vehicle).await.unwrap().unwrap();
        assert_eq!(active.ride_id, ride_id);
        assert!(client.ride_history(&other).await.unwrap().is_empty());

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_without_ride_is_a_no_op() {
        let (module, client, _) = launch(test_config(), 2);
        let rider_id = rider(&client, "a@b.com").await;

        client.end_ride("NONE", &rider_id).await.unwrap();
        assert!(client.ride_history(&rider_id).await.unwrap().is_empty());

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_email_leaves_no_trace() {
        let (module, client, shards) = launch(test_config(), 4);

        assert_eq!(client.create_rider("bad-email").await.unwrap(), None);
        assert!(matches!(
            client.register_rider("two@@b.com").await,
            Err(ClientError::InvalidEmail)
        ));
        assert_eq!(count_entries(&shards, Space::EmailIndex).await, 0);
        assert_eq!(count_entries(&shards, Space::Rider).await, 0);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeat_registration_returns_same_rider() {
        let (module, client, shards) = launch(test_config(), 4);

        let first = client.create_rider("a@b.com").await.unwrap().unwrap();
        let second = client.create_rider(" A@B.com ").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(count_entries(&shards, Space::EmailIndex).await, 1);
        assert_eq!(count_entries(&shards, Space::Rider).await, 1);

        let record = client.rider(&first).await.unwrap().unwrap();
        assert_eq!(record.email, "a@b.com");
        assert!(!record.active_ride);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_nearby_skips_vehicles_in_rides() {
        let (module, client, _) = launch(test_config(), 4);
        let close = ready_vehicle(&client, 80, 0.0, 0.0).await;
        let middle = ready_vehicle(&client, 70, 0.001, 0.0).await;
        let far = ready_vehicle(&client, 60, 0.01, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        let near = client.vehicles_near(0.0, 0.0, Some(2)).await.unwrap();
        let ids: Vec<&str> = near.iter().map(|v| v.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec![close.as_str(), middle.as_str()]);
        assert_eq!(near[0].battery, 80);
        assert!(near[0].distance_meters <= near[1].distance_meters);

        client.begin_ride(&close, &rider_id, 0.0, 0.0).await.unwrap();
        let near = client.vehicles_near(0.0, 0.0, Some(2)).await.unwrap();
        let ids: Vec<&str> = near.iter().map(|v| v.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec![middle.as_str(), far.as_str()]);

        client.end_ride(&close, &rider_id).await.unwrap();
        let near = client.vehicles_near(0.0, 0.0, None).await.unwrap();
        assert_eq!(near.len(), 3);
        assert_eq!(near[0].vehicle_id, close);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_flags_match_active_rides_when_quiet() {
        let (module, client, shards) = launch(test_config(), 4);
        let mut vehicles = Vec::new();
        for _ in 0..4 {
            vehicles.push(ready_vehicle(&client, 100, 0.0, 0.0).await);
        }
        let mut riders = Vec::new();
        for i in 0..4 {
            riders.push(rider(&client, &format!("rider{}@example.com", i)).await);
        }

        // Contending begins, including busy riders and busy vehicles.
        let mut begins = Vec::new();
        for (v, r) in [(0, 0), (0, 1), (1, 1), (1, 0), (2, 2), (3, 2), (3, 3)] {
            let client = client.clone();
            let vehicle = vehicles[v].clone();
            let rider_id = riders[r].clone();
            begins.push(tokio::spawn(async move {
                client.begin_ride(&vehicle, &rider_id, 0.0, 0.0).await
            }));
        }
        for begin in futures::future::join_all(begins).await {
            let _ = begin.unwrap();
        }
        assert_eq!(
            count_active_riders(&shards).await,
            count_entries(&shards, Space::ActiveRide).await
        );

        for (vehicle, rider_id) in vehicles.iter().zip(&riders) {
            client.end_ride(vehicle, rider_id).await.unwrap();
        }
        assert_eq!(
            count_active_riders(&shards).await,
            count_entries(&shards, Space::ActiveRide).await
        );

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_rider_stage_fault_rolls_back_reservation() {
        let (store, shards) = faulty_shards(4);
        let module = FleetModule::launch(test_config(), store);
        let client = module.client();
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        for shard in &shards {
            shard.fail_puts(Space::Rider, 1);
        }
        assert!(matches!(
            client.begin_ride(&vehicle, &rider_id, 0.0, 0.0).await,
            Err(ClientError::Store(StoreError::Injected(_)))
        ));
        assert!(client.active_ride(&vehicle).await.unwrap().is_none());
        assert!(!client.rider(&rider_id).await.unwrap().unwrap().active_ride);

        // Nothing is left stranded: the vehicle can be ridden.
        for shard in &shards {
            shard.fail_puts(Space::Rider, 0);
        }
        assert!(client.begin_ride(&vehicle, &rider_id, 0.0, 0.0).await.is_ok());

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_compensation_is_retried_until_it_lands() {
        let (store, shards) = faulty_shards(4);
        let module = FleetModule::launch(test_config(), store);
        let client = module.client();
        let first = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let second = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;
        client.begin_ride(&first, &rider_id, 0.0, 0.0).await.unwrap();

        for shard in &shards {
            shard.fail_deletes(Space::ActiveRide, 2);
        }
        assert!(matches!(
            client.begin_ride(&second, &rider_id, 0.0, 0.0).await,
            Err(ClientError::Rejected(RideRejection::RiderBusy))
        ));

        // The reply only arrives once the release has landed.
        assert!(client.active_ride(&second).await.unwrap().is_none());
        let owner = &shards[client.store.partition_of(&second)];
        assert_eq!(owner.pending_delete_faults(Space::ActiveRide), 0);
        assert!(owner.inner().entries(Space::ActiveRide).await.is_empty());

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_finite_locations_are_refused() {
        let (module, client, shards) = launch(test_config(), 2);
        let vehicle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;

        assert!(matches!(
            client.update_vehicle(&vehicle, 100, f64::NAN, 0.0).await,
            Err(ClientError::InvalidLocation)
        ));
        assert!(matches!(
            client.begin_ride(&vehicle, &rider_id, 0.0, f64::INFINITY).await,
            Err(ClientError::InvalidLocation)
        ));
        assert!(matches!(
            client.vehicles_near(f64::NAN, 0.0, None).await,
            Err(ClientError::InvalidLocation)
        ));

        // The vehicle is untouched and still usable.
        client.update_vehicle(&vehicle, 100, 0.0, 0.0).await.unwrap();
        assert_eq!(count_entries(&shards, Space::LocationHistory).await, 2);
        let near = client.vehicles_near(0.0, 0.0, None).await.unwrap();
        assert_eq!(near.len(), 1);
        assert!(client.begin_ride(&vehicle, &rider_id, 0.0, 0.0).await.is_ok());

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_finite_update_through_depot_is_ignored() {
        let (module, client, _) = launch(test_config(), 2);
        let vehicle = ready_vehicle(&client, 100, 1.0, 1.0).await;

        let update = IntakeEvent::VehicleUpdate(VehicleUpdate {
            vehicle_id: vehicle.clone(),
            battery: 50,
            location: LatLng::new(f64::NAN, 0.0),
        });
        module.depot().append(update, AckLevel::Processed).await.unwrap();

        let record = client.vehicle(&vehicle).await.unwrap().unwrap();
        assert_eq!(record.location, LatLng::new(1.0, 1.0));
        assert_eq!(record.battery, 100);
        let near = client.vehicles_near(1.0, 1.0, None).await.unwrap();
        assert_eq!(near[0].vehicle_id, vehicle);

        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_huge_nearby_limit_keeps_partitions_alive() {
        let (module, client, _) = launch(test_config(), 2);
        let riding = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let idle = ready_vehicle(&client, 100, 0.0, 0.0).await;
        let rider_id = rider(&client, "a@b.com").await;
        client.begin_ride(&riding, &rider_id, 0.0, 0.0).await.unwrap();

        let near = client.vehicles_near(0.0, 0.0, Some(usize::MAX)).await.unwrap();
        let ids: Vec<&str> = near.iter().map(|v| v.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec![idle.as_str()]);

        // Even unclamped, a partition survives the request.
        let near = module.depot().nearest(LatLng::ORIGIN, usize::MAX).await.unwrap();
        assert_eq!(near.len(), 1);
        client.update_vehicle(&idle, 90, 0.0, 0.0).await.unwrap();

        module.shutdown().await;
    }
}

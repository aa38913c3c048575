pub mod event;
pub mod location;
pub mod ride;
pub mod rider;
pub mod vehicle;

pub use event::{IntakeEvent, RideBegin, RideEnd, RideEvent, RiderRegistration, VehicleCreate, VehicleUpdate};
pub use location::LatLng;
pub use ride::{ActiveRide, CompletedRide, LocationSample};
pub use rider::RiderRecord;
pub use vehicle::{NearbyVehicle, VehicleRecord};

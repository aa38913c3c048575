//! Geographic helpers: great-circle distance and the per-partition vehicle index.

pub mod distance;
pub mod kdtree;

pub use distance::haversine_meters;
pub use kdtree::{Neighbor, SpatialIndex};

pub mod clock;
pub mod message_processor;
pub mod partition;
pub mod ride_saga;

pub use clock::{Clock, PartitionClock, SystemClock};
pub use partition::{Outcome, PartitionWorker, Router, Task};
pub use ride_saga::{Compensation, RideSaga, SagaState};

use std::sync::Arc;

use chrono::Utc;

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Per-partition timestamps. Strictly increasing, so two writes handled in the
/// same millisecond still get distinct, ordered location-history keys.
pub struct PartitionClock {
    source: Arc<dyn Clock>,
    last: i64,
}

impl PartitionClock {
    pub fn new(source: Arc<dyn Clock>) -> Self {
        Self {
            source,
            last: i64::MIN,
        }
    }

    pub fn tick(&mut self) -> i64 {
        let now = self.source.now_ms();
        self.last = now.max(self.last.saturating_add(1));
        self.last
    }
}

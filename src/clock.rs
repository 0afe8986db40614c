use std::time::Duration;
use tokio::time::Instant;
use crate::safe_converter::SaturatingCast;

/// Microseconds since the clock's epoch - the time unit of the whole engine
pub type Mics = u64;

pub fn duration_to_mics(duration: Duration) -> Mics {
    duration.as_micros().saturating_cast()
}

/// A monotonic microsecond clock. It is based on tokio's `Instant` so that tests running on a
///  paused runtime control time explicitly.
#[derive(Clone, Copy, Debug)]
pub struct MicsClock {
    epoch: Instant,
}

impl Default for MicsClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MicsClock {
    pub fn new() -> MicsClock {
        MicsClock {
            epoch: Instant::now(),
        }
    }

    pub fn now_mics(&self) -> Mics {
        duration_to_mics(self.epoch.elapsed())
    }
}

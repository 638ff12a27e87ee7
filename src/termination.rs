//! Termination conditions: the shared termination-time cell and the user
//! functor. Either can idle a core; in multi-core runs the core that fires
//! the functor broadcasts its current time so peers stop at the same
//! simulated instant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;

use crate::model::ModelView;
use crate::time::Timestamp;

/// User-supplied stop condition, evaluated against the resident models after
/// every small step.
pub type TerminationCheck = Arc<dyn Fn(&[ModelView]) -> bool + Send + Sync>;

/// Shared, monotonically decreasing termination time. Only the time field
/// matters: a core is idle once `time.time >= bound`.
#[derive(Clone)]
pub struct TerminationTime {
    bound: Arc<AtomicU64>,
}

impl TerminationTime {
    pub fn new(t: Timestamp) -> Self {
        Self {
            bound: Arc::new(AtomicU64::new(t.time)),
        }
    }

    pub fn get(&self) -> Timestamp {
        Timestamp::from_time(self.bound.load(Ordering::Acquire))
    }

    /// True when `time` has reached the bound.
    pub fn reached(&self, time: Timestamp) -> bool {
        time.time >= self.bound.load(Ordering::Acquire)
    }

    /// Lower the bound to `time` (functor broadcast). Never raises it.
    pub fn broadcast(&self, time: Timestamp) {
        let prev = self.bound.fetch_min(time.time, Ordering::AcqRel);
        if time.time < prev {
            info!("termination time lowered to {} (was {})", time.time, prev);
        }
    }
}

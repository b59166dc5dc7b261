//! Minimum-interval pacing for outbound calls
//!
//! A [`Pacer`] is shared by every task of one stage. Each call to
//! [`Pacer::wait`] reserves the next free slot, so successive calls are spaced
//! at least `interval` apart no matter how many tasks are running. A pacer
//! built without an interval never waits.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces out successive calls across tasks (cloneable - state is Arc-wrapped)
#[derive(Clone, Debug)]
pub struct Pacer {
    interval: Option<Duration>,
    /// Earliest instant the next call may start
    next_slot: Arc<Mutex<Option<Instant>>>,
}

impl Pacer {
    /// Create a pacer; `None` disables pacing
    #[must_use]
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.filter(|d| !d.is_zero()),
            next_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// A pacer that never waits
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Configured spacing, if any
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait until this caller's slot comes up
    pub async fn wait(&self) {
        let Some(interval) = self.interval else {
            return;
        };

        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + interval);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

//! Timer utilities
//!
//! Measures elapsed time for execution units and invocations.

use std::time::Duration;
use tokio::time::Instant;

/// Simple timer for measuring elapsed time
///
/// Backed by tokio's clock so paused-time tests observe virtual durations.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Create and start a new timer
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    /// Stop timer and return elapsed milliseconds
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{}: {}ms", self.label, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_tracks_virtual_time() {
        let timer = Timer::start("test");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(timer.elapsed_ms() >= 250);
        assert!(timer.stop() >= 250);
    }
}

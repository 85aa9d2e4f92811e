//! The monotonic recording timeline.
//!
//! All pacing math runs on `CLOCK_MONOTONIC` seconds. Pausing does not stop
//! the clock; instead the accumulated paused wall time is subtracted so
//! that video timestamps resume without a jump.

use std::time::Instant;

/// Monotonic seconds since an arbitrary process-local origin.
pub fn monotonic_seconds() -> f64 {
    // One origin per process so all readings share a base.
    static ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_secs_f64()
}

/// Pause-aware recording clock.
#[derive(Debug, Default)]
pub struct RecordingClock {
    paused_time_offset: f64,
    paused_since: Option<f64>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The video timeline "now": monotonic time minus everything spent
    /// paused.
    pub fn video_time(&self, monotonic_now: f64) -> f64 {
        monotonic_now - self.paused_time_offset
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    /// Flip the pause state at `monotonic_now`.
    ///
    /// Returns the new paused state.
    pub fn toggle_pause(&mut self, monotonic_now: f64) -> bool {
        match self.paused_since.take() {
            Some(since) => {
                self.paused_time_offset += monotonic_now - since;
                false
            }
            None => {
                self.paused_since = Some(monotonic_now);
                true
            }
        }
    }

    /// Total wall time spent paused so far (excluding a running pause).
    pub fn paused_time_offset(&self) -> f64 {
        self.paused_time_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_is_monotonic() {
        let a = monotonic_seconds();
        let b = monotonic_seconds();
        assert!(b >= a);
    }

    #[test]
    fn test_pause_accumulates_offset() {
        let mut clock = RecordingClock::new();
        assert!(!clock.is_paused());
        assert_eq!(clock.video_time(10.0), 10.0);

        assert!(clock.toggle_pause(10.0));
        assert!(clock.is_paused());

        // Unpause 3 seconds later: the video timeline lost those seconds.
        assert!(!clock.toggle_pause(13.0));
        assert!((clock.paused_time_offset() - 3.0).abs() < 1e-9);
        assert!((clock.video_time(14.0) - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_double_pause_cycle() {
        let mut clock = RecordingClock::new();
        clock.toggle_pause(1.0);
        clock.toggle_pause(2.0);
        clock.toggle_pause(5.0);
        clock.toggle_pause(6.0);
        assert!((clock.paused_time_offset() - 2.0).abs() < 1e-9);
    }
}

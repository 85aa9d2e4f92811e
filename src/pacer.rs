//! The frame pacer: when to capture, how many packets to emit, which pts.
//!
//! Owns three pieces of state: the recording start time, the video pts
//! counter, and (for variable rate) the previous pts. The session's main
//! loop ticks much faster than the target frame rate so damage signals are
//! seen promptly; the pacer decides which ticks actually capture.
//!
//! Drift handling: after a capture the frame timer restarts at
//! `now - min(overflow, period)`, so a late frame shifts the schedule
//! instead of accumulating an ever-growing debt.

use tracing::debug;

use crate::config::FramerateMode;

/// Microseconds time base for variable-rate pts.
pub const VFR_TIME_BASE_DEN: i64 = 1_000_000;

/// What the pacer decided for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickDecision {
    /// Do not capture this tick.
    Skip,

    /// Capture once, then emit packets at each listed pts (duplicating
    /// the captured frame when there is more than one).
    Capture { pts: Vec<i64> },
}

/// Pacer configuration, fixed per session.
#[derive(Debug, Clone, Copy)]
pub struct PacerConfig {
    pub fps: u32,
    pub mode: FramerateMode,
}

/// Frame pacing state machine. See the module docs.
pub struct FramePacer {
    config: PacerConfig,
    period: f64,

    record_start_time: f64,
    frame_timer_start: f64,
    video_pts_counter: i64,
    video_prev_pts: i64,
}

impl FramePacer {
    /// Create a pacer whose timeline starts at `video_now`.
    pub fn new(config: PacerConfig, video_now: f64) -> Self {
        let period = 1.0 / f64::from(config.fps.max(1));
        Self {
            config,
            period,
            record_start_time: video_now,
            frame_timer_start: video_now,
            video_pts_counter: 0,
            video_prev_pts: -1,
        }
    }

    /// The capture period in seconds.
    pub fn period(&self) -> f64 {
        self.period
    }

    /// Packets emitted so far.
    pub fn emitted(&self) -> i64 {
        self.video_pts_counter
    }

    /// Decide this tick.
    ///
    /// `monotonic_now` drives the frame timer; `video_now` (pause
    /// adjusted) drives pts. `damaged` is the consolidated damage signal -
    /// callers pass `true` unconditionally outside content mode. `paused`
    /// suppresses emission but still restarts the frame timer so frames
    /// are not bunched up on resume.
    pub fn tick(
        &mut self,
        monotonic_now: f64,
        video_now: f64,
        damaged: bool,
        paused: bool,
    ) -> TickDecision {
        let elapsed = monotonic_now - self.frame_timer_start;
        let overflow = elapsed - self.period;
        let due = overflow >= 0.0 || self.video_pts_counter == 0;
        if !due || !damaged {
            return TickDecision::Skip;
        }

        // Absorb lateness instead of accumulating it.
        self.frame_timer_start = monotonic_now - overflow.clamp(0.0, self.period);

        if paused {
            return TickDecision::Skip;
        }

        let pts = match self.config.mode {
            FramerateMode::Constant => {
                let expected =
                    ((video_now - self.record_start_time) / self.period).round() as i64;
                let missing = (expected - self.video_pts_counter).max(0);
                (self.video_pts_counter..self.video_pts_counter + missing).collect()
            }
            FramerateMode::Variable | FramerateMode::Content => {
                let pts =
                    ((video_now - self.record_start_time) * VFR_TIME_BASE_DEN as f64) as i64;
                if pts == self.video_prev_pts {
                    // A second packet with the same pts would be rejected
                    // by the muxer.
                    debug!("Skipping duplicate pts {}", pts);
                    Vec::new()
                } else {
                    self.video_prev_pts = pts;
                    vec![pts]
                }
            }
        };

        if pts.is_empty() {
            return TickDecision::Skip;
        }
        self.video_pts_counter += pts.len() as i64;
        TickDecision::Capture { pts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_simulation(
        mode: FramerateMode,
        fps: u32,
        duration: f64,
        tick_rate: f64,
        damaged: impl Fn(f64) -> bool,
        paused: impl Fn(f64) -> bool,
    ) -> Vec<i64> {
        let mut pacer = FramePacer::new(PacerConfig { fps, mode }, 0.0);
        let mut all_pts = Vec::new();
        let step = 1.0 / tick_rate;
        let mut now = 0.0;
        let mut paused_offset = 0.0;
        let mut paused_since: Option<f64> = None;
        while now < duration {
            let is_paused = paused(now);
            match (is_paused, paused_since) {
                (true, None) => paused_since = Some(now),
                (false, Some(since)) => {
                    paused_offset += now - since;
                    paused_since = None;
                }
                _ => {}
            }
            let video_now = now - paused_offset;
            let content_gate = mode != FramerateMode::Content || damaged(now);
            if let TickDecision::Capture { pts } =
                pacer.tick(now, video_now, content_gate, is_paused)
            {
                all_pts.extend(pts);
            }
            now += step;
        }
        all_pts
    }

    #[test]
    fn test_cfr_packet_count_matches_wall_time() {
        // 2 seconds at 60 fps, ticking at 240 Hz: 120 packets +-1.
        let pts = run_simulation(
            FramerateMode::Constant,
            60,
            2.0,
            240.0,
            |_| true,
            |_| false,
        );
        assert!(
            (119..=121).contains(&(pts.len() as i64)),
            "got {} packets",
            pts.len()
        );
        // CFR pts are the frame index sequence.
        for (i, p) in pts.iter().enumerate() {
            assert_eq!(*p, i as i64);
        }
    }

    #[test]
    fn test_cfr_duplicates_after_stall() {
        let mut pacer = FramePacer::new(
            PacerConfig {
                fps: 30,
                mode: FramerateMode::Constant,
            },
            0.0,
        );
        // At t=0 zero frames are expected yet; the tick is a no-op.
        assert_eq!(pacer.tick(0.0, 0.0, true, false), TickDecision::Skip);

        // Nothing for half a second, then one tick: ~15 duplicated frames
        // fill the gap in one burst.
        let decision = pacer.tick(0.5, 0.5, true, false);
        let TickDecision::Capture { pts } = decision else {
            panic!("expected capture");
        };
        assert!((14..=16).contains(&(pts.len() as i64)), "{} frames", pts.len());
        assert_eq!(pts[0], 0);
        // Distinct, consecutive pts for the duplicates.
        for pair in pts.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn test_vfr_pts_strictly_increasing() {
        let pts = run_simulation(
            FramerateMode::Variable,
            60,
            1.0,
            240.0,
            |_| true,
            |_| false,
        );
        assert!(!pts.is_empty());
        for pair in pts.windows(2) {
            assert!(pair[1] > pair[0], "pts not increasing: {:?}", pair);
        }
        // Microsecond base: last pts close to one second.
        let last = *pts.last().expect("non-empty");
        assert!((900_000..=1_000_100).contains(&last), "last pts {last}");
    }

    #[test]
    fn test_content_mode_emits_nothing_when_idle() {
        // Damage only during the first half second.
        let pts = run_simulation(
            FramerateMode::Content,
            30,
            2.0,
            120.0,
            |now| now < 0.5,
            |_| false,
        );
        let half_second_us = 600_000;
        assert!(!pts.is_empty());
        assert!(
            pts.iter().all(|&p| p < half_second_us),
            "packet emitted while idle: {:?}",
            pts.iter().max()
        );
    }

    #[test]
    fn test_pause_freezes_the_timeline() {
        // 3 seconds wall time with the middle second paused: pts span ~2s.
        let pts = run_simulation(
            FramerateMode::Variable,
            30,
            3.0,
            120.0,
            |_| true,
            |now| (1.0..2.0).contains(&now),
        );
        let last = *pts.last().expect("non-empty");
        assert!(
            (1_850_000..=2_050_000).contains(&last),
            "timeline did not freeze during pause: {last}"
        );
        for pair in pts.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_cfr_pause_reduces_expected_count() {
        // 3s wall, 1s paused, 30 fps: about 60 packets.
        let pts = run_simulation(
            FramerateMode::Constant,
            30,
            3.0,
            120.0,
            |_| true,
            |now| (1.0..2.0).contains(&now),
        );
        assert!(
            (58..=62).contains(&(pts.len() as i64)),
            "got {} packets",
            pts.len()
        );
    }

    #[test]
    fn test_first_frame_fires_immediately() {
        let mut pacer = FramePacer::new(
            PacerConfig {
                fps: 60,
                mode: FramerateMode::Variable,
            },
            100.0,
        );
        // Even with zero elapsed time, frame zero captures.
        let decision = pacer.tick(100.0, 100.0, true, false);
        assert!(matches!(decision, TickDecision::Capture { .. }));
    }
}

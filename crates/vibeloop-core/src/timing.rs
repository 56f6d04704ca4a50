//! Step clock.
//!
//! This module turns a BPM value into step deadlines:
//!
//! - [`step_interval`] - Duration of one step at a given BPM and subdivision
//! - [`StepClock`] - Anchored clock computing absolute per-step deadlines
//! - [`spin_until`] - Short busy-wait used for the last stretch before a deadline
//!
//! Deadlines are always computed as `anchor + (step - anchor_step) * interval`
//! so sleep overshoot on one step never shifts the following ones.

use std::time::{Duration, Instant};

/// Steps per beat (16th notes in 4/4).
pub const DEFAULT_SUBDIVISION: u32 = 4;

/// Tempo used when nothing else is configured.
pub const DEFAULT_BPM: f64 = 120.0;

/// Below this much remaining time [`spin_until`] stops yielding and spins.
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Duration of a single step: `60 / bpm / subdivision` seconds.
///
/// Out-of-range inputs saturate instead of panicking; callers validate BPM
/// before it reaches the clock.
pub fn step_interval(bpm: f64, subdivision: u32) -> Duration {
    let secs = 60.0 / bpm / subdivision.max(1) as f64;
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Busy-wait until `deadline`, yielding while there is still slack.
pub fn spin_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        if deadline - now > SPIN_THRESHOLD {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Anchor {
    instant: Instant,
    step: u64,
}

/// Drift-free step clock.
///
/// The clock is either disarmed (transport not playing) or armed at an
/// anchor `(instant, step)`. Tempo changes re-anchor at the deadline of the
/// last fired step, so the change applies from the next boundary on and
/// never moves a step that already fired.
#[derive(Clone, Debug)]
pub struct StepClock {
    bpm: f64,
    subdivision: u32,
    interval: Duration,
    anchor: Option<Anchor>,
    last_fired: Option<(u64, Instant)>,
}

impl StepClock {
    /// Create a disarmed clock.
    pub fn new(bpm: f64, subdivision: u32) -> Self {
        let subdivision = subdivision.max(1);
        Self {
            bpm,
            subdivision,
            interval: step_interval(bpm, subdivision),
            anchor: None,
            last_fired: None,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn subdivision(&self) -> u32 {
        self.subdivision
    }

    /// Current step interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_armed(&self) -> bool {
        self.anchor.is_some()
    }

    /// Arm the clock so that `step` is due at `now`.
    pub fn arm(&mut self, now: Instant, step: u64) {
        self.anchor = Some(Anchor { instant: now, step });
        self.last_fired = None;
    }

    /// Stop producing deadlines until re-armed.
    pub fn disarm(&mut self) {
        self.anchor = None;
        self.last_fired = None;
    }

    /// Switch to a new tempo at the next step boundary.
    ///
    /// Returns `false` if the tempo did not change.
    pub fn retempo(&mut self, bpm: f64) -> bool {
        if bpm == self.bpm {
            return false;
        }
        if let (Some(anchor), Some((step, _))) = (self.anchor, self.last_fired) {
            let instant = self.deadline_from(anchor, step);
            self.anchor = Some(Anchor { instant, step });
        }
        self.bpm = bpm;
        self.interval = step_interval(bpm, self.subdivision);
        true
    }

    /// Absolute deadline of `step`, or `None` while disarmed.
    pub fn deadline(&self, step: u64) -> Option<Instant> {
        self.anchor.map(|anchor| self.deadline_from(anchor, step))
    }

    fn deadline_from(&self, anchor: Anchor, step: u64) -> Instant {
        let steps = step.saturating_sub(anchor.step);
        let offset = Duration::try_from_secs_f64(self.interval.as_secs_f64() * steps as f64)
            .unwrap_or(Duration::MAX);
        anchor
            .instant
            .checked_add(offset)
            .unwrap_or(anchor.instant)
    }

    /// How late a tick for `step` fired at `now`.
    pub fn lateness(&self, step: u64, now: Instant) -> Duration {
        self.deadline(step)
            .map(|deadline| now.saturating_duration_since(deadline))
            .unwrap_or(Duration::ZERO)
    }

    /// Record that `step` fired at `at`.
    ///
    /// Returns the deviation, in microseconds, of the interval since the
    /// previously fired step from its expected length. The first step after
    /// arming has no predecessor and yields `None`.
    pub fn mark_fired(&mut self, step: u64, at: Instant) -> Option<f64> {
        let deviation = match (self.anchor, self.last_fired) {
            (Some(anchor), Some((prev_step, prev_at))) if step > prev_step => {
                let expected = self.deadline_from(anchor, step) - self.deadline_from(anchor, prev_step);
                let actual = at.saturating_duration_since(prev_at);
                Some((actual.as_secs_f64() - expected.as_secs_f64()) * 1_000_000.0)
            }
            _ => None,
        };
        self.last_fired = Some((step, at));
        deviation
    }

    /// Last fired step since arming.
    pub fn last_fired(&self) -> Option<u64> {
        self.last_fired.map(|(step, _)| step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Duration, b: Duration) -> bool {
        let diff = if a > b { a - b } else { b - a };
        diff < Duration::from_micros(1)
    }

    #[test]
    fn test_step_interval_120_bpm_sixteenths() {
        assert!(approx(step_interval(120.0, 4), Duration::from_millis(125)));
        assert!(approx(step_interval(60.0, 1), Duration::from_secs(1)));
        assert!(approx(step_interval(140.0, 4), Duration::from_secs_f64(60.0 / 140.0 / 4.0)));
    }

    #[test]
    fn test_step_interval_invalid_inputs_saturate() {
        assert_eq!(step_interval(0.0, 4), Duration::MAX);
        assert_eq!(step_interval(-10.0, 4), Duration::ZERO);
        assert_eq!(step_interval(f64::NAN, 4), Duration::ZERO);
    }

    #[test]
    fn test_deadlines_are_absolute() {
        let mut clock = StepClock::new(120.0, 4);
        assert_eq!(clock.deadline(0), None);
        let start = Instant::now();
        clock.arm(start, 0);
        assert_eq!(clock.deadline(0), Some(start));
        let d16 = clock.deadline(16).unwrap();
        assert!(approx(d16 - start, Duration::from_secs(2)));
        // Deadlines do not depend on when steps actually fired.
        clock.mark_fired(0, start + Duration::from_millis(3));
        assert_eq!(clock.deadline(16), Some(d16));
    }

    #[test]
    fn test_arm_at_resume_step() {
        let mut clock = StepClock::new(120.0, 4);
        let now = Instant::now();
        clock.arm(now, 7);
        assert_eq!(clock.deadline(7), Some(now));
        assert!(approx(clock.deadline(8).unwrap() - now, Duration::from_millis(125)));
    }

    #[test]
    fn test_retempo_applies_from_next_boundary() {
        let mut clock = StepClock::new(120.0, 4);
        let start = Instant::now();
        clock.arm(start, 0);
        for step in 0..4 {
            let at = clock.deadline(step).unwrap();
            clock.mark_fired(step, at);
        }
        let fired_3 = clock.deadline(3).unwrap();
        assert!(clock.retempo(60.0));
        // Step 3 already fired and keeps its place on the timeline.
        assert_eq!(clock.deadline(3), Some(fired_3));
        // Step 4 is one new-tempo interval after step 3.
        assert!(approx(clock.deadline(4).unwrap() - fired_3, Duration::from_millis(250)));
        assert!(!clock.retempo(60.0));
    }

    #[test]
    fn test_retempo_before_first_tick_keeps_start() {
        let mut clock = StepClock::new(120.0, 4);
        let start = Instant::now();
        clock.arm(start, 0);
        clock.retempo(240.0);
        assert_eq!(clock.deadline(0), Some(start));
        assert!(approx(clock.deadline(1).unwrap() - start, Duration::from_secs_f64(0.0625)));
    }

    #[test]
    fn test_mark_fired_reports_deviation() {
        let mut clock = StepClock::new(120.0, 4);
        let start = Instant::now();
        clock.arm(start, 0);
        assert_eq!(clock.mark_fired(0, start), None);
        let late = clock.deadline(1).unwrap() + Duration::from_micros(500);
        let deviation = clock.mark_fired(1, late).unwrap();
        assert!((deviation - 500.0).abs() < 1.0);
        let on_time = clock.deadline(2).unwrap();
        let deviation = clock.mark_fired(2, on_time).unwrap();
        assert!((deviation + 500.0).abs() < 1.0);
    }

    #[test]
    fn test_lateness() {
        let mut clock = StepClock::new(120.0, 4);
        let start = Instant::now();
        clock.arm(start, 0);
        assert_eq!(clock.lateness(1, start), Duration::ZERO);
        let lateness = clock.lateness(0, start + Duration::from_millis(2));
        assert!(approx(lateness, Duration::from_millis(2)));
    }

    #[test]
    fn test_spin_until_past_deadline_returns() {
        let before = Instant::now();
        spin_until(before);
        spin_until(Instant::now() + Duration::from_micros(300));
        assert!(before.elapsed() >= Duration::from_micros(300));
    }
}

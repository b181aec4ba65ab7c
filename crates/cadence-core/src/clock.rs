//! Time sources consumed by the schedulers.
//!
//! The core never reads engine globals. Frame deltas are handed to it by
//! the host through the [`FrameClock`] owned by the phase registry, wall
//! time comes from a monotonic [`Stopwatch`], and externally driven tasks
//! receive their time through explicit `tick` calls.
//!
//! # Design Principles
//!
//! - The frame counter uses checked arithmetic (no silent overflow).
//! - The scaled delta is derived from the unscaled delta and the time
//!   scale at the moment the frame begins. It is never set independently.
//! - The stopwatch is built on [`tokio::time::Instant`] so tests can pause
//!   and advance time deterministically.

use std::cell::Cell;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// Frame counter would overflow.
    #[error("frame counter overflow: cannot advance beyond u64::MAX")]
    FrameOverflow,

    /// Time scale is negative, NaN, or infinite.
    #[error("invalid time scale {scale}: must be finite and non-negative")]
    InvalidTimeScale {
        /// The rejected scale.
        scale: f64,
    },
}

/// Where a periodic task reads elapsed time from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// Monotonic wall clock, measured between pumps.
    Wall,
    /// Host frame delta, affected by the time scale.
    #[default]
    Frame,
    /// Host frame delta, ignoring the time scale.
    UnscaledFrame,
    /// Only explicit `tick` calls advance time.
    External,
}

/// Per-frame time published by the host.
///
/// The host calls [`begin_frame`](Self::begin_frame) once per tick, before
/// dispatching any phase. Periodic tasks on [`ClockSource::Frame`] and
/// [`ClockSource::UnscaledFrame`] read the deltas from here.
#[derive(Debug)]
pub struct FrameClock {
    frame: Cell<u64>,
    delta: Cell<Duration>,
    unscaled_delta: Cell<Duration>,
    time_scale: Cell<f64>,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock {
    /// Create a frame clock at frame 0 with zero deltas and a time scale of 1.
    pub const fn new() -> Self {
        Self {
            frame: Cell::new(0),
            delta: Cell::new(Duration::ZERO),
            unscaled_delta: Cell::new(Duration::ZERO),
            time_scale: Cell::new(1.0),
        }
    }

    /// Publish the delta for a new frame. Returns the new frame number.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::FrameOverflow`] if the frame counter would
    /// exceed `u64::MAX`.
    pub fn begin_frame(&self, unscaled_delta: Duration) -> Result<u64, ClockError> {
        let frame = self
            .frame
            .get()
            .checked_add(1)
            .ok_or(ClockError::FrameOverflow)?;
        let scale = self.time_scale.get();
        let scaled = if (scale - 1.0).abs() < f64::EPSILON {
            unscaled_delta
        } else {
            Duration::try_from_secs_f64(unscaled_delta.as_secs_f64() * scale).unwrap_or(Duration::MAX)
        };
        self.frame.set(frame);
        self.unscaled_delta.set(unscaled_delta);
        self.delta.set(scaled);
        Ok(frame)
    }

    /// Return the number of frames begun so far.
    pub fn frame(&self) -> u64 {
        self.frame.get()
    }

    /// Return the scaled delta of the current frame.
    pub fn delta(&self) -> Duration {
        self.delta.get()
    }

    /// Return the unscaled delta of the current frame.
    pub fn unscaled_delta(&self) -> Duration {
        self.unscaled_delta.get()
    }

    /// Return the current time scale.
    pub fn time_scale(&self) -> f64 {
        self.time_scale.get()
    }

    /// Set the time scale applied from the next frame on.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidTimeScale`] if `scale` is negative or
    /// not finite.
    pub fn set_time_scale(&self, scale: f64) -> Result<(), ClockError> {
        if !scale.is_finite() || scale < 0.0 {
            return Err(ClockError::InvalidTimeScale { scale });
        }
        self.time_scale.set(scale);
        Ok(())
    }
}

/// Monotonic stopwatch measuring the time between successive laps.
#[derive(Debug, Default, Clone)]
pub struct Stopwatch {
    last: Option<Instant>,
}

impl Stopwatch {
    /// Create a stopped stopwatch.
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Start (or restart) measuring from now.
    pub fn start(&mut self) {
        self.last = Some(Instant::now());
    }

    /// Stop the stopwatch. The next lap reads zero until restarted.
    pub const fn reset(&mut self) {
        self.last = None;
    }

    /// Whether the stopwatch is running.
    pub const fn is_running(&self) -> bool {
        self.last.is_some()
    }

    /// Return the time since the previous lap (or start) and begin a new lap.
    ///
    /// A stopped stopwatch returns [`Duration::ZERO`] and stays stopped.
    pub fn lap(&mut self) -> Duration {
        let Some(last) = self.last else {
            return Duration::ZERO;
        };
        let now = Instant::now();
        self.last = Some(now);
        now.saturating_duration_since(last)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frame_clock_starts_at_frame_zero() {
        let clock = FrameClock::new();
        assert_eq!(clock.frame(), 0);
        assert_eq!(clock.delta(), Duration::ZERO);
        assert_eq!(clock.unscaled_delta(), Duration::ZERO);
    }

    #[test]
    fn begin_frame_advances_counter_and_deltas() {
        let clock = FrameClock::new();
        assert_eq!(clock.begin_frame(Duration::from_millis(16)).unwrap(), 1);
        assert_eq!(clock.begin_frame(Duration::from_millis(20)).unwrap(), 2);
        assert_eq!(clock.delta(), Duration::from_millis(20));
        assert_eq!(clock.unscaled_delta(), Duration::from_millis(20));
    }

    #[test]
    fn time_scale_applies_to_scaled_delta_only() {
        let clock = FrameClock::new();
        clock.set_time_scale(0.5).unwrap();
        clock.begin_frame(Duration::from_millis(100)).unwrap();
        assert_eq!(clock.delta(), Duration::from_millis(50));
        assert_eq!(clock.unscaled_delta(), Duration::from_millis(100));

        clock.set_time_scale(0.0).unwrap();
        clock.begin_frame(Duration::from_millis(100)).unwrap();
        assert_eq!(clock.delta(), Duration::ZERO);
    }

    #[test]
    fn invalid_time_scale_is_rejected() {
        let clock = FrameClock::new();
        assert!(clock.set_time_scale(-1.0).is_err());
        assert!(clock.set_time_scale(f64::NAN).is_err());
        assert!(clock.set_time_scale(f64::INFINITY).is_err());
        assert!((clock.time_scale() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stopped_stopwatch_reads_zero() {
        let mut watch = Stopwatch::new();
        assert!(!watch.is_running());
        assert_eq!(watch.lap(), Duration::ZERO);
        assert!(!watch.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stopwatch_measures_laps() {
        let mut watch = Stopwatch::new();
        watch.start();
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(watch.lap(), Duration::from_millis(30));
        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(watch.lap(), Duration::from_millis(5));

        watch.reset();
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(watch.lap(), Duration::ZERO);
    }

    #[test]
    fn clock_source_deserializes_snake_case() {
        let source: ClockSource = serde_yml::from_str("unscaled_frame").unwrap();
        assert_eq!(source, ClockSource::UnscaledFrame);
        let source: ClockSource = serde_yml::from_str("external").unwrap();
        assert_eq!(source, ClockSource::External);
    }
}

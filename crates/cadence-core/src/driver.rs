//! Async tick loop that plays the host role.
//!
//! The [`TickDriver`] publishes a frame delta and dispatches its phases in
//! order once per period, until a tick bound is reached or the shutdown
//! token is cancelled. It must run on the thread that owns the registry,
//! so hosts drive it from a current-thread runtime or a `LocalSet`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::clock::ClockError;
use crate::phase::{DispatchError, PhaseError, PhaseId, PhaseRegistry, StandardPhase};

/// Errors that stop the tick loop.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A phase in the dispatch order is not registered.
    #[error("phase error: {source}")]
    Phase {
        /// The underlying registry error.
        #[from]
        source: PhaseError,
    },

    /// A dispatch returned an error.
    #[error("dispatch error: {source}")]
    Dispatch {
        /// The underlying dispatch error.
        #[from]
        source: DispatchError,
    },

    /// The frame clock could not advance.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },
}

/// Why the tick loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The configured number of ticks ran.
    MaxTicks,
    /// The shutdown token was cancelled.
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxTicks => f.write_str("max_ticks"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Ticks executed.
    pub ticks: u64,
    /// Why the loop stopped.
    pub end_reason: EndReason,
    /// Wall-clock time the loop started.
    pub started_at: DateTime<Utc>,
}

/// Drives a [`PhaseRegistry`] from a tokio interval.
#[derive(Debug, Clone)]
pub struct TickDriver {
    order: Vec<PhaseId>,
    period: Duration,
    max_ticks: u64,
}

impl TickDriver {
    /// Dispatch every driven [`StandardPhase`] once per `period`, with no
    /// tick bound.
    pub fn new(period: Duration) -> Self {
        let order = StandardPhase::ALL
            .into_iter()
            .filter(|phase| phase.is_driven())
            .map(StandardPhase::id)
            .collect();
        Self {
            order,
            period,
            max_ticks: 0,
        }
    }

    /// Replace the dispatch order.
    #[must_use]
    pub fn with_order(mut self, order: Vec<PhaseId>) -> Self {
        self.order = order;
        self
    }

    /// Stop after `max_ticks` ticks. Zero means unbounded.
    #[must_use]
    pub const fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    /// The phases dispatched each tick, in order.
    pub fn order(&self) -> &[PhaseId] {
        &self.order
    }

    /// The tick period.
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Run until the tick bound or `shutdown`.
    ///
    /// Each tick begins a frame on the registry's clock with the time
    /// measured since the previous tick, then dispatches every phase in
    /// order. The first dispatch error ends the run.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Phase`] if a phase in the order is not
    /// registered, [`DriverError::Dispatch`] if a dispatch fails, or
    /// [`DriverError::Clock`] if the frame counter overflows.
    pub async fn run(
        &self,
        registry: &PhaseRegistry,
        shutdown: &CancellationToken,
    ) -> Result<RunSummary, DriverError> {
        for phase in &self.order {
            if !registry.is_registered(phase) {
                return Err(PhaseError::UnknownPhase {
                    phase: phase.clone(),
                }
                .into());
            }
        }

        let started_at = Utc::now();
        let mut ticks: u64 = 0;
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();

        info!(
            period_ms = self.period.as_millis(),
            max_ticks = self.max_ticks,
            phases = self.order.len(),
            "Tick driver starting"
        );

        let end_reason = loop {
            // --- Check tick limit ---
            if self.max_ticks > 0 && ticks >= self.max_ticks {
                break EndReason::MaxTicks;
            }

            // --- Wait for the next tick or shutdown ---
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break EndReason::Shutdown,
                _ = interval.tick() => {}
            }

            // --- Publish frame time ---
            let now = Instant::now();
            let delta = now.saturating_duration_since(last);
            last = now;
            let frame = registry.frame_clock().begin_frame(delta)?;
            trace!(frame, delta_us = delta.as_micros(), "frame begun");

            // --- Dispatch phases ---
            for phase in &self.order {
                registry.dispatch(phase)?;
            }
            ticks = ticks.saturating_add(1);
        };

        let summary = RunSummary {
            ticks,
            end_reason,
            started_at,
        };
        log_run_end(&summary);
        Ok(summary)
    }
}

/// Log the outcome of a run.
pub fn log_run_end(summary: &RunSummary) {
    let elapsed = Utc::now().signed_duration_since(summary.started_at);
    if summary.ticks == 0 {
        warn!(end_reason = %summary.end_reason, "Tick driver stopped with no ticks executed");
        return;
    }
    info!(
        ticks = summary.ticks,
        end_reason = %summary.end_reason,
        elapsed_ms = elapsed.num_milliseconds(),
        "Tick driver stopped"
    );
}

//! Error types for the reference host binary.
//!
//! [`HostError`] is the top-level error type that wraps all possible
//! failure modes during host startup and the tick loop.

/// Top-level error for the host binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: cadence_core::config::ConfigError,
    },

    /// The time scale was rejected.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: cadence_core::clock::ClockError,
    },

    /// Phase setup failed.
    #[error("phase error: {source}")]
    Phase {
        /// The underlying registry error.
        #[from]
        source: cadence_core::phase::PhaseError,
    },

    /// The demo periodic task could not be created or started.
    #[error("interval error: {source}")]
    Interval {
        /// The underlying periodic task error.
        #[from]
        source: cadence_core::interval::IntervalError,
    },

    /// The demo queue could not be created or started.
    #[error("queue error: {source}")]
    Queue {
        /// The underlying queue error.
        #[from]
        source: cadence_core::queue::QueueError,
    },

    /// The tick loop stopped with an error.
    #[error("driver error: {source}")]
    Driver {
        /// The underlying driver error.
        #[from]
        source: cadence_core::driver::DriverError,
    },
}

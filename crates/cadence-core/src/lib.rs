//! Frame-synchronous task scheduling for hosts driven by a recurring tick.
//!
//! The host calls [`PhaseRegistry::dispatch`] once per phase per tick. Every
//! scheduler in this crate registers a single pump callback under one phase
//! and advances its own state from inside that callback. Nothing here
//! spawns threads: scheduling is cooperative and single-threaded, and all
//! scheduler types are `!Send`.
//!
//! # Modules
//!
//! - [`phase`] -- Phase identifiers, callback collections, and the
//!   [`PhaseRegistry`] that dispatches them.
//! - [`clock`] -- Host frame clock, wall-clock stopwatch, and the
//!   [`ClockSource`] selector used by periodic tasks.
//! - [`pump`] -- Shared helpers for polling actions once per tick.
//! - [`interval`] -- [`PeriodicTask`], a repeating action with lag handling.
//! - [`queue`] -- [`TaskQueue`], a capacity-bounded priority queue with
//!   single-in-flight execution.
//! - [`driver`] -- [`TickDriver`], an async loop that plays the host role.
//! - [`config`] -- YAML configuration for hosts and schedulers.
//!
//! [`PhaseRegistry`]: phase::PhaseRegistry
//! [`PhaseRegistry::dispatch`]: phase::PhaseRegistry::dispatch
//! [`ClockSource`]: clock::ClockSource
//! [`PeriodicTask`]: interval::PeriodicTask
//! [`TaskQueue`]: queue::TaskQueue
//! [`TickDriver`]: driver::TickDriver

pub mod clock;
pub mod config;
pub mod driver;
pub mod interval;
pub mod phase;
pub mod pump;
pub mod queue;

pub use pump::next_tick;
pub use tokio_util::sync::CancellationToken;

//! Periodic task runner.
//!
//! A [`PeriodicTask`] fires an action once per elapsed interval, measured by
//! a [`ClockSource`]. It registers one pump under its phase when started and
//! advances from inside that pump on every dispatch.
//!
//! # Lifecycle
//!
//! `Idle -> Running -> (Idle | Disposed)`. A disposed task cannot be
//! restarted. Starting a running task first stops it, which cancels the
//! in-flight action and resets the accumulator.
//!
//! # Pump order
//!
//! 1. Owner token cancelled: dispose and return.
//! 2. Advance the accumulator from the clock source. Time keeps accumulating
//!    while an action is in flight.
//! 3. Poll the in-flight action. Still pending: return.
//! 4. Accumulator below one interval: return.
//! 5. Subtract one interval. If the remainder is still at least one
//!    interval, apply the [`LagPolicy`]. Then fire.
//!
//! A freshly fired async action is polled once immediately, so an action
//! that never suspends never occupies the in-flight slot.

use std::cell::RefCell;
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::{ClockSource, Stopwatch};
use crate::phase::{CallbackId, PhaseError, PhaseId, PhaseRegistry};
use crate::pump::{self, ActionFuture};

/// Errors raised by periodic tasks.
#[derive(Debug, thiserror::Error)]
pub enum IntervalError {
    /// The task was disposed and cannot be used again.
    #[error("periodic task is disposed")]
    Disposed,

    /// The call is not valid for this task's configuration.
    #[error("invalid operation: {reason}")]
    InvalidOperation {
        /// Why the call was rejected.
        reason: String,
    },

    /// The interval was zero.
    #[error("interval must be greater than zero")]
    ZeroInterval,

    /// Registering or unregistering the pump failed.
    #[error("phase error: {source}")]
    Phase {
        /// The underlying registry error.
        #[from]
        source: PhaseError,
    },

    /// The action failed and no exception handler was registered.
    #[error("periodic action failed: {source}")]
    ActionFailed {
        /// The error returned by the action.
        source: anyhow::Error,
    },
}

/// What to do when more than one interval of time has accumulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagPolicy {
    /// Drop the backlog, keeping at most one pending firing.
    #[default]
    Skip,
    /// Keep the backlog and fire on every pump until it is drained.
    Flood,
}

/// Lifecycle state of a [`PeriodicTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalState {
    /// Constructed or stopped; no pump registered.
    Idle,
    /// Pump registered and firing.
    Running,
    /// Permanently unusable.
    Disposed,
}

/// Scheduling parameters of a periodic task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSpec {
    /// Time between firings.
    pub interval: Duration,
    /// Where elapsed time is read from.
    pub clock: ClockSource,
    /// Backlog handling.
    pub lag: LagPolicy,
    /// Phase to pump on; `None` uses the registry default.
    pub phase: Option<PhaseId>,
}

impl IntervalSpec {
    /// Fire every `interval` on frame time, skipping backlog, on the
    /// default phase.
    pub const fn every(interval: Duration) -> Self {
        Self {
            interval,
            clock: ClockSource::Frame,
            lag: LagPolicy::Skip,
            phase: None,
        }
    }

    /// Same as [`every`](Self::every) with the interval in milliseconds.
    pub const fn from_millis(interval_ms: u64) -> Self {
        Self::every(Duration::from_millis(interval_ms))
    }

    /// Use the given clock source.
    #[must_use]
    pub const fn clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    /// Use the given lag policy.
    #[must_use]
    pub const fn lag(mut self, lag: LagPolicy) -> Self {
        self.lag = lag;
        self
    }

    /// Pump on the given phase instead of the default.
    #[must_use]
    pub fn on_phase(mut self, phase: impl Into<PhaseId>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

type SyncAction = Box<dyn FnMut() -> anyhow::Result<()>>;
type AsyncAction = Box<dyn FnMut(CancellationToken) -> ActionFuture>;
type ExceptionHandler = Box<dyn FnMut(&anyhow::Error)>;

enum Action {
    Sync(SyncAction),
    Async(AsyncAction),
}

/// Result of invoking the action body once.
enum Fired {
    Done(anyhow::Result<()>),
    Started(CancellationToken, ActionFuture),
}

struct InFlight {
    token: CancellationToken,
    /// `None` while the future is being polled further up the stack.
    future: Option<ActionFuture>,
}

struct IntervalInner {
    spec: IntervalSpec,
    state: IntervalState,
    /// Taken out while the body runs so the body may call back into the task.
    action: Option<Action>,
    on_exception: Option<ExceptionHandler>,
    elapsed: Duration,
    stopwatch: Stopwatch,
    owner: Option<CancellationToken>,
    root: Option<CancellationToken>,
    in_flight: Option<InFlight>,
    registration: Option<(PhaseId, CallbackId)>,
    invocations: u64,
    /// Bumped on every stop so a poll in progress can tell it was superseded.
    generation: u64,
}

struct Core {
    cell: RefCell<IntervalInner>,
    registry: Rc<PhaseRegistry>,
}

/// A repeating action fired once per elapsed interval.
///
/// Dropping the task disposes it.
pub struct PeriodicTask {
    core: Rc<Core>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.cell.borrow();
        f.debug_struct("PeriodicTask")
            .field("spec", &inner.spec)
            .field("state", &inner.state)
            .field("elapsed", &inner.elapsed)
            .field("invocations", &inner.invocations)
            .finish_non_exhaustive()
    }
}

impl PeriodicTask {
    /// Create a task with a synchronous action.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::ZeroInterval`] if the interval is zero.
    pub fn new<F>(registry: &Rc<PhaseRegistry>, spec: IntervalSpec, action: F) -> Result<Self, IntervalError>
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        Self::build(registry, spec, Action::Sync(Box::new(action)))
    }

    /// Create a task with an asynchronous action.
    ///
    /// The action receives a token that is cancelled when the task stops,
    /// is disposed, or its owner token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::ZeroInterval`] if the interval is zero.
    pub fn new_async<F, Fut>(
        registry: &Rc<PhaseRegistry>,
        spec: IntervalSpec,
        mut action: F,
    ) -> Result<Self, IntervalError>
    where
        F: FnMut(CancellationToken) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let action: AsyncAction = Box::new(move |token| Box::pin(action(token)));
        Self::build(registry, spec, Action::Async(action))
    }

    fn build(registry: &Rc<PhaseRegistry>, spec: IntervalSpec, action: Action) -> Result<Self, IntervalError> {
        if spec.interval.is_zero() {
            return Err(IntervalError::ZeroInterval);
        }
        let inner = IntervalInner {
            spec,
            state: IntervalState::Idle,
            action: Some(action),
            on_exception: None,
            elapsed: Duration::ZERO,
            stopwatch: Stopwatch::new(),
            owner: None,
            root: None,
            in_flight: None,
            registration: None,
            invocations: 0,
            generation: 0,
        };
        Ok(Self {
            core: Rc::new(Core {
                cell: RefCell::new(inner),
                registry: Rc::clone(registry),
            }),
        })
    }

    /// Route action failures to `handler` instead of the dispatch caller.
    #[must_use]
    pub fn on_exception<H>(self, handler: H) -> Self
    where
        H: FnMut(&anyhow::Error) + 'static,
    {
        self.core.cell.borrow_mut().on_exception = Some(Box::new(handler));
        self
    }

    /// Start firing. The task disposes itself once `owner` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::Disposed`] after disposal, or
    /// [`IntervalError::Phase`] if the pump cannot be registered.
    pub fn start(&self, owner: Option<CancellationToken>) -> Result<(), IntervalError> {
        self.core.start(owner)
    }

    /// Stop firing without disposing. The task can be started again.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Advance an externally driven task by `elapsed`.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::Disposed`] after disposal, or
    /// [`IntervalError::InvalidOperation`] unless the clock source is
    /// [`ClockSource::External`].
    pub fn tick(&self, elapsed: Duration) -> Result<(), IntervalError> {
        let mut inner = self.core.cell.borrow_mut();
        if inner.state == IntervalState::Disposed {
            return Err(IntervalError::Disposed);
        }
        if inner.spec.clock != ClockSource::External {
            return Err(IntervalError::InvalidOperation {
                reason: format!(
                    "tick() requires the external clock source, task uses {:?}",
                    inner.spec.clock
                ),
            });
        }
        inner.elapsed = inner.elapsed.saturating_add(elapsed);
        Ok(())
    }

    /// Unregister, cancel any in-flight action, and make the task unusable.
    /// Calling it again does nothing.
    pub fn dispose(&self) {
        self.core.dispose();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IntervalState {
        self.core.cell.borrow().state
    }

    /// Number of times the action body has been invoked.
    pub fn invocations(&self) -> u64 {
        self.core.cell.borrow().invocations
    }

    /// Whether an async action is suspended waiting for a later tick.
    pub fn is_in_flight(&self) -> bool {
        self.core.cell.borrow().in_flight.is_some()
    }

    /// Accumulated time not yet consumed by firings.
    pub fn elapsed(&self) -> Duration {
        self.core.cell.borrow().elapsed
    }

    /// The task's scheduling parameters.
    pub fn spec(&self) -> IntervalSpec {
        self.core.cell.borrow().spec.clone()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl Core {
    fn start(self: &Rc<Self>, owner: Option<CancellationToken>) -> Result<(), IntervalError> {
        if self.cell.borrow().state == IntervalState::Disposed {
            return Err(IntervalError::Disposed);
        }
        self.stop();

        let requested = self.cell.borrow().spec.phase.clone();
        let phase = self.registry.resolve(requested.as_ref())?;
        let weak = Rc::downgrade(self);
        let callback_id = self.registry.add(
            &phase,
            Rc::new(move || -> anyhow::Result<()> {
                match weak.upgrade() {
                    Some(core) => core.pump().map_err(anyhow::Error::from),
                    None => Ok(()),
                }
            }),
        )?;

        let mut inner = self.cell.borrow_mut();
        inner.root = Some(pump::link_token(owner.as_ref()));
        inner.owner = owner;
        inner.elapsed = Duration::ZERO;
        inner.stopwatch.start();
        inner.state = IntervalState::Running;
        debug!(
            phase = %phase,
            interval_ms = inner.spec.interval.as_millis(),
            clock = ?inner.spec.clock,
            lag = ?inner.spec.lag,
            "periodic task started"
        );
        inner.registration = Some((phase, callback_id));
        Ok(())
    }

    fn stop(&self) {
        let (registration, in_flight, root) = {
            let mut inner = self.cell.borrow_mut();
            inner.generation = inner.generation.wrapping_add(1);
            inner.stopwatch.reset();
            inner.owner = None;
            if inner.state == IntervalState::Running {
                inner.state = IntervalState::Idle;
            }
            (inner.registration.take(), inner.in_flight.take(), inner.root.take())
        };
        if let Some(root) = root {
            root.cancel();
        }
        drop(in_flight);
        if let Some((phase, id)) = registration {
            if let Err(error) = self.registry.remove(&phase, id) {
                warn!(error = %error, "failed to unregister periodic task pump");
            }
            debug!(phase = %phase, "periodic task stopped");
        }
    }

    fn dispose(&self) {
        if self.cell.borrow().state == IntervalState::Disposed {
            return;
        }
        self.stop();
        self.cell.borrow_mut().state = IntervalState::Disposed;
        debug!("periodic task disposed");
    }

    fn is_running(&self) -> bool {
        self.cell.borrow().state == IntervalState::Running
    }

    fn pump(&self) -> Result<(), IntervalError> {
        let owner_cancelled = {
            let inner = self.cell.borrow();
            if inner.state != IntervalState::Running {
                return Ok(());
            }
            inner
                .owner
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
        };
        if owner_cancelled {
            debug!("owner token cancelled, disposing periodic task");
            self.dispose();
            return Ok(());
        }

        self.advance_clock();

        if !self.settle_in_flight()? || !self.is_running() {
            return Ok(());
        }

        {
            let mut inner = self.cell.borrow_mut();
            let interval = inner.spec.interval;
            if inner.elapsed < interval {
                return Ok(());
            }
            inner.elapsed = inner.elapsed.saturating_sub(interval);
            if inner.elapsed >= interval {
                match inner.spec.lag {
                    LagPolicy::Skip => {
                        trace!(backlog = ?inner.elapsed, "skipping periodic backlog");
                        inner.elapsed = interval;
                    }
                    LagPolicy::Flood => {
                        trace!(backlog = ?inner.elapsed, "flooding periodic backlog");
                    }
                }
            }
        }

        self.fire()
    }

    fn advance_clock(&self) {
        let mut inner = self.cell.borrow_mut();
        let delta = match inner.spec.clock {
            ClockSource::Wall => inner.stopwatch.lap(),
            ClockSource::Frame => self.registry.frame_clock().delta(),
            ClockSource::UnscaledFrame => self.registry.frame_clock().unscaled_delta(),
            ClockSource::External => Duration::ZERO,
        };
        inner.elapsed = inner.elapsed.saturating_add(delta);
    }

    /// Poll the in-flight action, if any. Returns `true` once the slot is free.
    fn settle_in_flight(&self) -> Result<bool, IntervalError> {
        let (generation, mut future) = {
            let mut inner = self.cell.borrow_mut();
            let generation = inner.generation;
            let Some(flight) = inner.in_flight.as_mut() else {
                return Ok(true);
            };
            let Some(future) = flight.future.take() else {
                return Ok(false);
            };
            (generation, future)
        };

        let poll = pump::poll_action(&mut future);

        let mut inner = self.cell.borrow_mut();
        if inner.generation != generation {
            drop(inner);
            drop(future);
            return Ok(false);
        }
        match poll {
            Poll::Pending => {
                if let Some(flight) = inner.in_flight.as_mut() {
                    flight.future = Some(future);
                }
                Ok(false)
            }
            Poll::Ready(result) => {
                if let Some(flight) = inner.in_flight.take() {
                    flight.token.cancel();
                }
                drop(inner);
                self.handle_result(result)?;
                Ok(true)
            }
        }
    }

    fn fire(&self) -> Result<(), IntervalError> {
        let (action, generation, root) = {
            let mut inner = self.cell.borrow_mut();
            inner.invocations = inner.invocations.saturating_add(1);
            (inner.action.take(), inner.generation, inner.root.clone())
        };
        let Some(mut action) = action else {
            return Ok(());
        };

        let fired = match &mut action {
            Action::Sync(body) => Fired::Done(body()),
            Action::Async(body) => {
                let token = root.map_or_else(CancellationToken::new, |root| root.child_token());
                let future = body(token.clone());
                Fired::Started(token, future)
            }
        };
        {
            let mut inner = self.cell.borrow_mut();
            if inner.action.is_none() {
                inner.action = Some(action);
            }
        }

        match fired {
            Fired::Done(result) => self.handle_result(result),
            Fired::Started(token, mut future) => match pump::poll_action(&mut future) {
                Poll::Ready(result) => {
                    token.cancel();
                    self.handle_result(result)
                }
                Poll::Pending => {
                    let mut inner = self.cell.borrow_mut();
                    if inner.generation == generation && inner.state == IntervalState::Running {
                        inner.in_flight = Some(InFlight {
                            token,
                            future: Some(future),
                        });
                    } else {
                        drop(inner);
                        token.cancel();
                    }
                    Ok(())
                }
            },
        }
    }

    fn handle_result(&self, result: anyhow::Result<()>) -> Result<(), IntervalError> {
        let Err(error) = result else {
            return Ok(());
        };
        let handler = self.cell.borrow_mut().on_exception.take();
        let Some(mut handler) = handler else {
            return Err(IntervalError::ActionFailed { source: error });
        };
        warn!(error = %error, "periodic action failed");
        handler(&error);
        let mut inner = self.cell.borrow_mut();
        if inner.on_exception.is_none() {
            inner.on_exception = Some(handler);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::phase::StandardPhase;

    fn registry() -> Rc<PhaseRegistry> {
        Rc::new(PhaseRegistry::with_standard_phases())
    }

    fn counter() -> (Rc<Cell<u32>>, impl FnMut() -> anyhow::Result<()> + 'static) {
        let count = Rc::new(Cell::new(0));
        let inner = Rc::clone(&count);
        (count, move || -> anyhow::Result<()> {
            inner.set(inner.get().saturating_add(1));
            Ok(())
        })
    }

    fn frame(registry: &PhaseRegistry, millis: u64) {
        registry
            .frame_clock()
            .begin_frame(Duration::from_millis(millis))
            .unwrap();
        registry.dispatch_default().unwrap();
    }

    #[test]
    fn zero_interval_is_rejected() {
        let registry = registry();
        let (_, action) = counter();
        let result = PeriodicTask::new(&registry, IntervalSpec::every(Duration::ZERO), action);
        assert!(matches!(result, Err(IntervalError::ZeroInterval)));
    }

    #[test]
    fn skip_policy_fires_ten_times_in_one_point_zero_five_seconds() {
        let registry = registry();
        let (count, action) = counter();
        let task = PeriodicTask::new(&registry, IntervalSpec::from_millis(100), action).unwrap();
        task.start(None).unwrap();

        for _ in 0..105 {
            frame(&registry, 10);
        }
        assert_eq!(count.get(), 10);
        assert_eq!(task.invocations(), 10);
    }

    #[test]
    fn skip_policy_collapses_backlog_to_one_catch_up() {
        let registry = registry();
        let (count, action) = counter();
        let task = PeriodicTask::new(&registry, IntervalSpec::from_millis(100), action).unwrap();
        task.start(None).unwrap();

        frame(&registry, 1_000);
        assert_eq!(count.get(), 1);
        assert_eq!(task.elapsed(), Duration::from_millis(100));

        frame(&registry, 0);
        assert_eq!(count.get(), 2);
        frame(&registry, 0);
        frame(&registry, 0);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn flood_policy_drains_backlog_one_firing_per_pump() {
        let registry = registry();
        let (count, action) = counter();
        let spec = IntervalSpec::from_millis(100).lag(LagPolicy::Flood);
        let task = PeriodicTask::new(&registry, spec, action).unwrap();
        task.start(None).unwrap();

        frame(&registry, 450);
        assert_eq!(count.get(), 1);
        for _ in 0..10 {
            frame(&registry, 0);
        }
        assert_eq!(count.get(), 4);
        assert_eq!(task.elapsed(), Duration::from_millis(50));
    }

    #[test]
    fn unscaled_clock_ignores_time_scale() {
        let registry = registry();
        registry.frame_clock().set_time_scale(0.0).unwrap();
        let (scaled_count, scaled) = counter();
        let (unscaled_count, unscaled) = counter();
        let scaled_task = PeriodicTask::new(&registry, IntervalSpec::from_millis(50), scaled).unwrap();
        let unscaled_task = PeriodicTask::new(
            &registry,
            IntervalSpec::from_millis(50).clock(ClockSource::UnscaledFrame),
            unscaled,
        )
        .unwrap();
        scaled_task.start(None).unwrap();
        unscaled_task.start(None).unwrap();

        for _ in 0..10 {
            frame(&registry, 10);
        }
        assert_eq!(scaled_count.get(), 0);
        assert_eq!(unscaled_count.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_measures_between_pumps() {
        let registry = registry();
        let (count, action) = counter();
        let spec = IntervalSpec::from_millis(100).clock(ClockSource::Wall);
        let task = PeriodicTask::new(&registry, spec, action).unwrap();
        task.start(None).unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(50)).await;
            registry.dispatch_default().unwrap();
        }
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn tick_requires_external_clock() {
        let registry = registry();
        let (_, action) = counter();
        let task = PeriodicTask::new(&registry, IntervalSpec::from_millis(100), action).unwrap();
        assert!(matches!(
            task.tick(Duration::from_millis(10)),
            Err(IntervalError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn external_clock_only_advances_through_tick() {
        let registry = registry();
        let (count, action) = counter();
        let spec = IntervalSpec::from_millis(100)
            .clock(ClockSource::External)
            .on_phase(StandardPhase::Manual);
        let task = PeriodicTask::new(&registry, spec, action).unwrap();
        task.start(None).unwrap();

        let manual = StandardPhase::Manual.id();
        registry.frame_clock().begin_frame(Duration::from_secs(5)).unwrap();
        registry.dispatch(&manual).unwrap();
        assert_eq!(count.get(), 0);

        task.tick(Duration::from_millis(100)).unwrap();
        registry.dispatch(&manual).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn async_action_blocks_further_firings_until_complete() {
        let registry = registry();
        let release = Rc::new(Cell::new(false));
        let started = Rc::new(Cell::new(0_u32));
        let spec = IntervalSpec::from_millis(100).clock(ClockSource::External);
        let task = {
            let release = Rc::clone(&release);
            let started = Rc::clone(&started);
            PeriodicTask::new_async(&registry, spec, move |_token| {
                started.set(started.get().saturating_add(1));
                let release = Rc::clone(&release);
                async move {
                    while !release.get() {
                        crate::next_tick().await;
                    }
                    Ok(())
                }
            })
            .unwrap()
        };
        task.start(None).unwrap();

        task.tick(Duration::from_millis(100)).unwrap();
        registry.dispatch_default().unwrap();
        assert_eq!(started.get(), 1);
        assert!(task.is_in_flight());

        task.tick(Duration::from_millis(300)).unwrap();
        registry.dispatch_default().unwrap();
        registry.dispatch_default().unwrap();
        assert_eq!(started.get(), 1);

        release.set(true);
        registry.dispatch_default().unwrap();
        assert_eq!(started.get(), 2);
        assert!(!task.is_in_flight());
    }

    #[test]
    fn failure_without_handler_reaches_the_dispatcher() {
        let registry = registry();
        let spec = IntervalSpec::from_millis(10);
        let task = PeriodicTask::new(&registry, spec, || Err(anyhow::anyhow!("broken"))).unwrap();
        task.start(None).unwrap();

        registry.frame_clock().begin_frame(Duration::from_millis(10)).unwrap();
        let err = registry.dispatch_default().unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
        assert_eq!(task.state(), IntervalState::Running);
    }

    #[test]
    fn failure_with_handler_keeps_running() {
        let registry = registry();
        let failures = Rc::new(Cell::new(0_u32));
        let task = {
            let failures = Rc::clone(&failures);
            PeriodicTask::new(&registry, IntervalSpec::from_millis(10), || Err(anyhow::anyhow!("broken")))
                .unwrap()
                .on_exception(move |_| failures.set(failures.get().saturating_add(1)))
        };
        task.start(None).unwrap();

        for _ in 0..3 {
            frame(&registry, 10);
        }
        assert_eq!(failures.get(), 3);
        assert_eq!(task.state(), IntervalState::Running);
    }

    #[test]
    fn owner_cancellation_disposes_and_unregisters() {
        let registry = registry();
        let (count, action) = counter();
        let task = PeriodicTask::new(&registry, IntervalSpec::from_millis(10), action).unwrap();
        let owner = CancellationToken::new();
        task.start(Some(owner.clone())).unwrap();

        frame(&registry, 10);
        assert_eq!(count.get(), 1);

        owner.cancel();
        frame(&registry, 10);
        assert_eq!(count.get(), 1);
        assert_eq!(task.state(), IntervalState::Disposed);
        let update = StandardPhase::Update.id();
        assert_eq!(registry.callback_count(&update).unwrap(), 0);
        assert!(matches!(task.start(None), Err(IntervalError::Disposed)));
        assert!(matches!(task.tick(Duration::ZERO), Err(IntervalError::Disposed)));
    }

    #[test]
    fn dispose_is_idempotent_and_cancels_in_flight_token() {
        let registry = registry();
        let seen: Rc<RefCell<Option<CancellationToken>>> = Rc::new(RefCell::new(None));
        let spec = IntervalSpec::from_millis(10);
        let task = {
            let seen = Rc::clone(&seen);
            PeriodicTask::new_async(&registry, spec, move |token| {
                *seen.borrow_mut() = Some(token.clone());
                async move {
                    token.cancelled().await;
                    Ok(())
                }
            })
            .unwrap()
        };
        task.start(None).unwrap();
        frame(&registry, 10);
        assert!(task.is_in_flight());

        task.dispose();
        task.dispose();
        assert_eq!(task.state(), IntervalState::Disposed);
        assert!(!task.is_in_flight());
        assert!(seen.borrow().as_ref().unwrap().is_cancelled());
        let update = StandardPhase::Update.id();
        assert_eq!(registry.callback_count(&update).unwrap(), 0);
    }

    #[test]
    fn restart_resets_accumulator_and_registers_once() {
        let registry = registry();
        let (count, action) = counter();
        let spec = IntervalSpec::from_millis(100).clock(ClockSource::External);
        let task = PeriodicTask::new(&registry, spec, action).unwrap();
        task.start(None).unwrap();
        task.tick(Duration::from_millis(90)).unwrap();

        task.start(None).unwrap();
        assert_eq!(task.elapsed(), Duration::ZERO);
        let update = StandardPhase::Update.id();
        assert_eq!(registry.callback_count(&update).unwrap(), 1);

        task.tick(Duration::from_millis(90)).unwrap();
        registry.dispatch_default().unwrap();
        assert_eq!(count.get(), 0);

        task.stop();
        assert_eq!(task.state(), IntervalState::Idle);
        assert_eq!(registry.callback_count(&update).unwrap(), 0);
    }

    #[test]
    fn action_may_dispose_its_own_task() {
        let registry = registry();
        let slot: Rc<RefCell<Option<Rc<PeriodicTask>>>> = Rc::new(RefCell::new(None));
        let task = {
            let slot = Rc::clone(&slot);
            Rc::new(
                PeriodicTask::new(&registry, IntervalSpec::from_millis(10), move || {
                    if let Some(task) = slot.borrow().as_ref() {
                        task.dispose();
                    }
                    Ok(())
                })
                .unwrap(),
            )
        };
        *slot.borrow_mut() = Some(Rc::clone(&task));
        task.start(None).unwrap();

        frame(&registry, 10);
        assert_eq!(task.state(), IntervalState::Disposed);
        slot.borrow_mut().take();
    }

    #[test]
    fn missing_default_phase_fails_start() {
        let registry = Rc::new(PhaseRegistry::new());
        let (_, action) = counter();
        let task = PeriodicTask::new(&registry, IntervalSpec::from_millis(10), action).unwrap();
        assert!(matches!(
            task.start(None),
            Err(IntervalError::Phase {
                source: PhaseError::NoDefaultPhase
            })
        ));
        assert_eq!(task.state(), IntervalState::Idle);
    }
}

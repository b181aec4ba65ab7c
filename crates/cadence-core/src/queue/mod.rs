//! Capacity-bounded priority queue with single-in-flight execution.
//!
//! Items run one at a time in `(priority, submission order)` order, lower
//! priority values first. The queue registers one pump under its phase when
//! started. Each pump invocation polls the executing item once; whenever an
//! item finishes, the next one starts within the same pump, so actions that
//! never suspend drain back to back.
//!
//! # Admission
//!
//! Items may be enqueued as soon as the queue exists. They wait until
//! [`TaskQueue::start`] registers the pump. After every enqueue the
//! [`EvictionPolicy`] brings `count()` back within capacity; see
//! [`select_victim`] for the tie-break.
//!
//! # Cancellation
//!
//! Each executing item receives a child of the queue's root token, which is
//! itself a child of the shutdown token passed to `start`. Cancelling the
//! shutdown token disposes the queue on its next pump.

mod eviction;
mod handle;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::Poll;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub use eviction::{EvictionPolicy, Victim, select_victim};
pub use handle::{CancelReason, Completion, TaskHandle, TaskId, TaskOutcome};

use self::handle::Completer;
use crate::phase::{CallbackId, PhaseError, PhaseId, PhaseRegistry};
use crate::pump::{self, ActionFuture};

/// Errors raised by task queues.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue was disposed and cannot be used again.
    #[error("task queue is disposed")]
    QueueDisposed,

    /// A bounded policy was configured with zero capacity.
    #[error("capacity {capacity} is invalid for eviction policy {policy:?}")]
    InvalidCapacity {
        /// The configured policy.
        policy: EvictionPolicy,
        /// The rejected capacity.
        capacity: usize,
    },

    /// Registering or unregistering the pump failed.
    #[error("phase error: {source}")]
    Phase {
        /// The underlying registry error.
        #[from]
        source: PhaseError,
    },

    /// An item failed and had no exception handler.
    #[error("{task} failed: {message}")]
    TaskFailed {
        /// The failed item.
        task: TaskId,
        /// The rendered error chain.
        message: String,
    },
}

/// Capacity and placement of a task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Eviction policy applied after each enqueue.
    pub policy: EvictionPolicy,
    /// Maximum `count()` once an enqueue settles. Ignored by
    /// [`EvictionPolicy::None`].
    pub capacity: usize,
    /// Phase to pump on; `None` uses the registry default.
    pub phase: Option<PhaseId>,
}

impl QueueSpec {
    /// No capacity limit, default phase.
    pub const fn unbounded() -> Self {
        Self {
            policy: EvictionPolicy::None,
            capacity: 0,
            phase: None,
        }
    }

    /// Enforce `capacity` with `policy`.
    pub const fn bounded(policy: EvictionPolicy, capacity: usize) -> Self {
        Self {
            policy,
            capacity,
            phase: None,
        }
    }

    /// Pump on the given phase instead of the default.
    #[must_use]
    pub fn on_phase(mut self, phase: impl Into<PhaseId>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Lifecycle state of a [`TaskQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    /// Accepting items; no pump registered.
    Created,
    /// Pump registered; items execute.
    Running,
    /// Permanently unusable.
    Disposed,
}

type QueueAction = Box<dyn FnOnce(CancellationToken) -> ActionFuture>;

struct QueuedItem {
    id: TaskId,
    priority: i32,
    action: QueueAction,
    completer: Completer,
}

struct Executing {
    id: TaskId,
    priority: i32,
    token: CancellationToken,
    completer: Completer,
    /// `None` while the future is being polled further up the stack.
    future: Option<ActionFuture>,
}

impl Executing {
    fn abort(self, reason: CancelReason) {
        self.token.cancel();
        debug!(task = %self.id, reason = ?reason, "executing task aborted");
        drop(self.future);
        self.completer.cancel(reason);
    }
}

/// What one pump step has to do once the queue borrow is released.
enum Step {
    Resume(TaskId, ActionFuture),
    Begin(TaskId, QueueAction, CancellationToken),
}

/// Items removed in one borrow, resolved after it is released.
#[derive(Default)]
struct Removed {
    executing: Option<Executing>,
    pending: Vec<QueuedItem>,
}

impl Removed {
    fn resolve(self, pending_reason: CancelReason, executing_reason: CancelReason) {
        if let Some(executing) = self.executing {
            executing.abort(executing_reason);
        }
        for item in self.pending {
            debug!(task = %item.id, reason = ?pending_reason, "pending task cancelled");
            drop(item.action);
            item.completer.cancel(pending_reason);
        }
    }
}

struct QueueInner {
    spec: QueueSpec,
    state: QueueState,
    pending: VecDeque<QueuedItem>,
    executing: Option<Executing>,
    shutdown: Option<CancellationToken>,
    root: Option<CancellationToken>,
    registration: Option<(PhaseId, CallbackId)>,
    next_id: u64,
}

impl QueueInner {
    fn count(&self) -> usize {
        self.pending
            .len()
            .saturating_add(usize::from(self.executing.is_some()))
    }

    fn take_all(&mut self) -> Removed {
        Removed {
            executing: self.executing.take(),
            pending: self.pending.drain(..).collect(),
        }
    }
}

pub(crate) struct QueueCore {
    cell: RefCell<QueueInner>,
    registry: Rc<PhaseRegistry>,
    /// Fired after every pump invocation and on halt.
    ticked: Notify,
}

/// A priority queue of asynchronous actions, executed one at a time.
///
/// Dropping the queue disposes it.
pub struct TaskQueue {
    core: Rc<QueueCore>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.cell.borrow();
        f.debug_struct("TaskQueue")
            .field("spec", &inner.spec)
            .field("state", &inner.state)
            .field("pending", &inner.pending.len())
            .field("executing", &inner.executing.as_ref().map(|item| item.id))
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Create a queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidCapacity`] if a bounded policy has zero
    /// capacity.
    pub fn new(registry: &Rc<PhaseRegistry>, spec: QueueSpec) -> Result<Self, QueueError> {
        if spec.policy.is_bounded() && spec.capacity == 0 {
            return Err(QueueError::InvalidCapacity {
                policy: spec.policy,
                capacity: spec.capacity,
            });
        }
        let inner = QueueInner {
            spec,
            state: QueueState::Created,
            pending: VecDeque::new(),
            executing: None,
            shutdown: None,
            root: None,
            registration: None,
            next_id: 0,
        };
        Ok(Self {
            core: Rc::new(QueueCore {
                cell: RefCell::new(inner),
                registry: Rc::clone(registry),
                ticked: Notify::new(),
            }),
        })
    }

    /// Start executing items. The queue disposes itself once `shutdown` is
    /// cancelled.
    ///
    /// Starting a running queue aborts the executing item and cancels every
    /// pending item with [`CancelReason::Restarted`] before registering again.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::QueueDisposed`] after disposal, or
    /// [`QueueError::Phase`] if the pump cannot be registered.
    pub fn start(&self, shutdown: Option<CancellationToken>) -> Result<(), QueueError> {
        self.core.start(shutdown)
    }

    /// Submit an action. Lower `priority` values run first; equal priorities
    /// run in submission order.
    ///
    /// The returned handle resolves immediately as evicted if the eviction
    /// policy rejects the new item itself.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::QueueDisposed`] after disposal.
    pub fn enqueue<F, Fut>(&self, priority: i32, action: F) -> Result<TaskHandle, QueueError>
    where
        F: FnOnce(CancellationToken) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let action: QueueAction = Box::new(move |token| Box::pin(action(token)));
        self.core.enqueue(priority, action)
    }

    /// Unregister, cancel every item, and make the queue unusable. Calling
    /// it again does nothing.
    pub fn dispose(&self) {
        self.core.dispose();
    }

    /// Pending items plus the executing item.
    pub fn count(&self) -> usize {
        self.core.cell.borrow().count()
    }

    /// Items waiting to execute.
    pub fn pending_len(&self) -> usize {
        self.core.cell.borrow().pending.len()
    }

    /// Whether an item is executing.
    pub fn is_executing(&self) -> bool {
        self.core.cell.borrow().executing.is_some()
    }

    /// Whether any item is pending or executing.
    pub fn any(&self) -> bool {
        self.count() > 0
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        self.core.cell.borrow().state
    }

    /// Whether the queue was disposed.
    pub fn is_disposed(&self) -> bool {
        self.state() == QueueState::Disposed
    }

    /// Whether the pump is registered.
    pub fn is_running(&self) -> bool {
        self.state() == QueueState::Running
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.core.cell.borrow().spec.capacity
    }

    /// Configured eviction policy.
    pub fn policy(&self) -> EvictionPolicy {
        self.core.cell.borrow().spec.policy
    }

    /// Complete once the queue holds no items.
    ///
    /// The count is checked again after each pump of this queue, so the
    /// future sleeps between ticks. It never completes while items wait on a
    /// queue that was not started.
    pub async fn wait_for_empty(&self) {
        loop {
            let ticked = self.core.ticked.notified();
            if !self.any() {
                return;
            }
            ticked.await;
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl QueueCore {
    fn start(self: &Rc<Self>, shutdown: Option<CancellationToken>) -> Result<(), QueueError> {
        let state = self.cell.borrow().state;
        match state {
            QueueState::Disposed => return Err(QueueError::QueueDisposed),
            QueueState::Running => self.halt(CancelReason::Restarted),
            QueueState::Created => {}
        }

        let requested = self.cell.borrow().spec.phase.clone();
        let phase = self.registry.resolve(requested.as_ref())?;
        let weak = Rc::downgrade(self);
        let callback_id = self.registry.add(
            &phase,
            Rc::new(move || -> anyhow::Result<()> {
                match weak.upgrade() {
                    Some(core) => {
                        let result = core.pump();
                        core.ticked.notify_waiters();
                        result.map_err(anyhow::Error::from)
                    }
                    None => Ok(()),
                }
            }),
        )?;

        let mut inner = self.cell.borrow_mut();
        inner.root = Some(pump::link_token(shutdown.as_ref()));
        inner.shutdown = shutdown;
        inner.state = QueueState::Running;
        debug!(
            phase = %phase,
            policy = ?inner.spec.policy,
            capacity = inner.spec.capacity,
            pending = inner.pending.len(),
            "task queue started"
        );
        inner.registration = Some((phase, callback_id));
        Ok(())
    }

    /// Leave the running state, cancelling every item.
    fn halt(&self, reason: CancelReason) {
        let (registration, root, removed) = {
            let mut inner = self.cell.borrow_mut();
            if inner.state == QueueState::Running {
                inner.state = QueueState::Created;
            }
            inner.shutdown = None;
            (inner.registration.take(), inner.root.take(), inner.take_all())
        };
        if let Some(root) = root {
            root.cancel();
        }
        removed.resolve(reason, reason);
        self.ticked.notify_waiters();
        if let Some((phase, id)) = registration {
            if let Err(error) = self.registry.remove(&phase, id) {
                warn!(error = %error, "failed to unregister task queue pump");
            }
        }
    }

    fn dispose(&self) {
        {
            let mut inner = self.cell.borrow_mut();
            if inner.state == QueueState::Disposed {
                return;
            }
            inner.state = QueueState::Disposed;
        }
        self.halt(CancelReason::Disposed);
        debug!("task queue disposed");
    }

    fn enqueue(self: &Rc<Self>, priority: i32, action: QueueAction) -> Result<TaskHandle, QueueError> {
        let (handle, removed) = {
            let mut inner = self.cell.borrow_mut();
            if inner.state == QueueState::Disposed {
                return Err(QueueError::QueueDisposed);
            }
            let id = TaskId(inner.next_id);
            inner.next_id = inner.next_id.wrapping_add(1);
            let (completer, handle) = handle::pair(id, priority, Rc::downgrade(self));

            let index = inner.pending.partition_point(|item| item.priority <= priority);
            inner.pending.insert(
                index,
                QueuedItem {
                    id,
                    priority,
                    action,
                    completer,
                },
            );
            trace!(task = %id, priority, index, "task enqueued");

            let priorities: Vec<i32> = inner.pending.iter().map(|item| item.priority).collect();
            let victim = select_victim(
                inner.spec.policy,
                inner.spec.capacity,
                &priorities,
                index,
                inner.executing.as_ref().map(|item| item.priority),
            );
            let mut removed = Removed::default();
            match victim {
                Victim::None => {}
                Victim::Pending(at) => removed.pending.extend(inner.pending.remove(at)),
                Victim::Executing => removed.executing = inner.executing.take(),
            }
            (handle, removed)
        };
        removed.resolve(CancelReason::Evicted, CancelReason::Aborted);
        Ok(handle)
    }

    fn cancel_task(&self, id: TaskId) -> bool {
        let removed = {
            let mut inner = self.cell.borrow_mut();
            let mut removed = Removed::default();
            if inner.executing.as_ref().is_some_and(|item| item.id == id) {
                removed.executing = inner.executing.take();
            } else if let Some(at) = inner.pending.iter().position(|item| item.id == id) {
                removed.pending.extend(inner.pending.remove(at));
            } else {
                return false;
            }
            removed
        };
        removed.resolve(CancelReason::Caller, CancelReason::Caller);
        true
    }

    fn pump(&self) -> Result<(), QueueError> {
        loop {
            let shutdown_requested = {
                let inner = self.cell.borrow();
                if inner.state != QueueState::Running {
                    return Ok(());
                }
                inner
                    .shutdown
                    .as_ref()
                    .is_some_and(CancellationToken::is_cancelled)
            };
            if shutdown_requested {
                debug!("shutdown token cancelled, disposing task queue");
                self.dispose();
                return Ok(());
            }

            let Some(step) = self.next_step() else {
                return Ok(());
            };
            let (id, mut future) = match step {
                Step::Resume(id, future) => (id, future),
                Step::Begin(id, action, token) => {
                    trace!(task = %id, "task started");
                    (id, action(token))
                }
            };

            let poll = pump::poll_action(&mut future);

            let finished = {
                let mut inner = self.cell.borrow_mut();
                if !inner.executing.as_ref().is_some_and(|item| item.id == id) {
                    drop(inner);
                    drop(future);
                    continue;
                }
                match poll {
                    Poll::Pending => {
                        if let Some(item) = inner.executing.as_mut() {
                            item.future = Some(future);
                        }
                        return Ok(());
                    }
                    Poll::Ready(result) => inner.executing.take().map(|item| (item, result)),
                }
            };
            drop(future);
            let Some((item, result)) = finished else {
                continue;
            };
            item.token.cancel();
            trace!(task = %id, ok = result.is_ok(), "task finished");
            item.completer.finish(id, result)?;
        }
    }

    /// Claim the executing item's future, or promote the head of the
    /// pending list. `None` when idle or when the executing item is already
    /// being polled.
    fn next_step(&self) -> Option<Step> {
        let mut inner = self.cell.borrow_mut();
        if let Some(item) = inner.executing.as_mut() {
            return item.future.take().map(|future| Step::Resume(item.id, future));
        }
        let item = inner.pending.pop_front()?;
        let token = inner
            .root
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        inner.executing = Some(Executing {
            id: item.id,
            priority: item.priority,
            token: token.clone(),
            completer: item.completer,
            future: None,
        });
        Some(Step::Begin(item.id, item.action, token))
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

    fn record(log: &Rc<RefCell<Vec<u32>>>, value: u32) -> impl FnOnce(CancellationToken) -> ActionFuture + 'static {
        let log = Rc::clone(log);
        move |_token: CancellationToken| -> ActionFuture {
            Box::pin(async move {
                log.borrow_mut().push(value);
                Ok(())
            })
        }
    }

    #[test]
    fn zero_capacity_is_rejected_for_bounded_policies() {
        let registry = registry();
        let result = TaskQueue::new(&registry, QueueSpec::bounded(EvictionPolicy::Discard, 0));
        assert!(matches!(result, Err(QueueError::InvalidCapacity { .. })));
        assert!(TaskQueue::new(&registry, QueueSpec::unbounded()).is_ok());
    }

    #[test]
    fn items_wait_for_start() {
        let registry = registry();
        let log = Rc::new(RefCell::new(Vec::new()));
        let queue = TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap();
        let handle = queue.enqueue(0, record(&log, 1)).unwrap();

        registry.dispatch_default().unwrap();
        assert!(log.borrow().is_empty());
        assert_eq!(queue.state(), QueueState::Created);

        queue.start(None).unwrap();
        registry.dispatch_default().unwrap();
        assert_eq!(*log.borrow(), vec![1]);
        assert!(handle.outcome().unwrap().is_completed());
    }

    #[test]
    fn synchronous_items_drain_in_one_dispatch_by_priority_then_fifo() {
        let registry = registry();
        let log = Rc::new(RefCell::new(Vec::new()));
        let queue = TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap();
        queue.start(None).unwrap();
        for (priority, value) in [(1, 10), (0, 20), (1, 11), (-1, 30), (0, 21)] {
            queue.enqueue(priority, record(&log, value)).unwrap();
        }

        registry.dispatch_default().unwrap();
        assert_eq!(*log.borrow(), vec![30, 20, 21, 10, 11]);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn only_one_item_executes_at_a_time() {
        let registry = registry();
        let gate = Rc::new(Cell::new(false));
        let started = Rc::new(Cell::new(0_u32));
        let queue = TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap();
        queue.start(None).unwrap();
        for _ in 0..3 {
            let gate = Rc::clone(&gate);
            let started = Rc::clone(&started);
            queue
                .enqueue(0, move |_token| async move {
                    started.set(started.get().saturating_add(1));
                    while !gate.get() {
                        crate::next_tick().await;
                    }
                    Ok(())
                })
                .unwrap();
        }

        for _ in 0..5 {
            registry.dispatch_default().unwrap();
        }
        assert_eq!(started.get(), 1);
        assert!(queue.is_executing());
        assert_eq!(queue.count(), 3);

        gate.set(true);
        registry.dispatch_default().unwrap();
        assert_eq!(started.get(), 3);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn caller_cancel_removes_pending_and_aborts_executing() {
        let registry = registry();
        let queue = TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap();
        queue.start(None).unwrap();
        let seen: Rc<RefCell<Option<CancellationToken>>> = Rc::new(RefCell::new(None));
        let running = {
            let seen = Rc::clone(&seen);
            queue
                .enqueue(0, move |token| {
                    *seen.borrow_mut() = Some(token.clone());
                    async move {
                        token.cancelled().await;
                        Ok(())
                    }
                })
                .unwrap()
        };
        let waiting = queue.enqueue(0, |_token| async { Ok(()) }).unwrap();
        registry.dispatch_default().unwrap();
        assert!(queue.is_executing());

        assert!(waiting.cancel());
        assert_eq!(waiting.outcome().unwrap().cancel_reason(), Some(CancelReason::Caller));
        assert!(running.cancel());
        assert_eq!(running.outcome().unwrap().cancel_reason(), Some(CancelReason::Caller));
        assert!(seen.borrow().as_ref().unwrap().is_cancelled());
        assert!(!running.cancel());
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn unhandled_failure_surfaces_after_queue_settles() {
        let registry = registry();
        let log = Rc::new(RefCell::new(Vec::new()));
        let queue = TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap();
        queue.start(None).unwrap();
        let failing = queue
            .enqueue(0, |_token| async { Err::<(), _>(anyhow::anyhow!("bad item")) })
            .unwrap();
        queue.enqueue(0, record(&log, 2)).unwrap();

        let err = registry.dispatch_default().unwrap_err();
        assert!(format!("{err:#}").contains("bad item"));
        assert!(failing.outcome().unwrap().is_failed());
        assert_eq!(queue.count(), 1);

        registry.dispatch_default().unwrap();
        assert_eq!(*log.borrow(), vec![2]);
    }

    #[test]
    fn restart_cancels_everything_with_restarted() {
        let registry = registry();
        let queue = TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap();
        queue.start(None).unwrap();
        let first = queue
            .enqueue(0, |token| async move {
                token.cancelled().await;
                Ok(())
            })
            .unwrap();
        let second = queue.enqueue(0, |_token| async { Ok(()) }).unwrap();
        registry.dispatch_default().unwrap();

        queue.start(None).unwrap();
        assert_eq!(first.outcome().unwrap().cancel_reason(), Some(CancelReason::Restarted));
        assert_eq!(second.outcome().unwrap().cancel_reason(), Some(CancelReason::Restarted));
        assert!(queue.is_running());
        let update = StandardPhase::Update.id();
        assert_eq!(registry.callback_count(&update).unwrap(), 1);
    }

    #[test]
    fn enqueue_after_dispose_fails() {
        let registry = registry();
        let queue = TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap();
        queue.dispose();
        assert!(matches!(
            queue.enqueue(0, |_token| async { Ok(()) }),
            Err(QueueError::QueueDisposed)
        ));
        assert!(matches!(queue.start(None), Err(QueueError::QueueDisposed)));
    }

    #[test]
    fn dropping_queue_cancels_pending_items() {
        let registry = registry();
        let queue = TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap();
        queue.start(None).unwrap();
        let handle = queue.enqueue(0, |_token| async { Ok(()) }).unwrap();
        drop(queue);
        assert_eq!(handle.outcome().unwrap().cancel_reason(), Some(CancelReason::Disposed));
        let update = StandardPhase::Update.id();
        assert_eq!(registry.callback_count(&update).unwrap(), 0);
    }

    #[test]
    fn action_may_enqueue_follow_up_work() {
        let registry = registry();
        let log = Rc::new(RefCell::new(Vec::new()));
        let queue = Rc::new(TaskQueue::new(&registry, QueueSpec::unbounded()).unwrap());
        queue.start(None).unwrap();
        {
            let weak = Rc::downgrade(&queue);
            let log = Rc::clone(&log);
            queue
                .enqueue(0, move |_token| async move {
                    log.borrow_mut().push(1);
                    if let Some(queue) = weak.upgrade() {
                        queue.enqueue(0, record(&log, 2))?;
                    }
                    Ok(())
                })
                .unwrap();
        }

        registry.dispatch_default().unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }
}

//! Per-item completion signalling.
//!
//! Every queued item owns a [`Completer`] and hands the matching
//! [`TaskHandle`] to the caller. The completer resolves exactly once, either
//! when the item finishes or when it is cancelled. A completer dropped
//! without resolving reads as cancelled by disposal, so no item is ever
//! silently lost.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::FutureExt as _;
use futures::channel::oneshot;
use futures::future::Shared;
use tracing::{trace, warn};

use super::{QueueCore, QueueError};

/// Identifies one enqueued item within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// The raw sequence number. Ids increase in submission order.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Why an item was cancelled instead of running to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Removed from the pending list by the eviction policy.
    Evicted,
    /// Stopped while executing to make room for a new item.
    Aborted,
    /// Cancelled through its handle.
    Caller,
    /// The queue was disposed.
    Disposed,
    /// The queue was started again while running.
    Restarted,
}

/// How an item ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The action returned `Ok`.
    Completed,
    /// The action returned an error.
    Failed(Rc<anyhow::Error>),
    /// The item never finished.
    Cancelled(CancelReason),
}

impl TaskOutcome {
    /// Whether the action ran to completion.
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether the action returned an error.
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The cancellation reason, if the item was cancelled.
    pub const fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::Cancelled(reason) => Some(*reason),
            Self::Completed | Self::Failed(_) => None,
        }
    }
}

type ExceptionHandler = Box<dyn FnMut(&anyhow::Error)>;

/// State shared between a handle and its completer.
#[derive(Default)]
pub(crate) struct ItemHooks {
    on_exception: RefCell<Option<ExceptionHandler>>,
}

impl ItemHooks {
    /// Pass `error` to the handler. Returns `false` if there is none.
    fn notify(&self, error: &anyhow::Error) -> bool {
        let handler = self.on_exception.borrow_mut().take();
        let Some(mut handler) = handler else {
            return false;
        };
        handler(error);
        let mut slot = self.on_exception.borrow_mut();
        if slot.is_none() {
            *slot = Some(handler);
        }
        true
    }
}

/// Queue-side end of an item's completion signal.
pub(crate) struct Completer {
    sender: Option<oneshot::Sender<TaskOutcome>>,
    hooks: Rc<ItemHooks>,
}

impl Completer {
    fn resolve(&mut self, outcome: TaskOutcome) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        if sender.send(outcome).is_err() {
            trace!("task outcome discarded, no handle left");
        }
    }

    /// Resolve as cancelled.
    pub(crate) fn cancel(mut self, reason: CancelReason) {
        self.resolve(TaskOutcome::Cancelled(reason));
    }

    /// Resolve with the action's result.
    ///
    /// A failure is always recorded on the handle. Without an exception
    /// handler it is also returned so the pump can surface it.
    pub(crate) fn finish(mut self, id: TaskId, result: anyhow::Result<()>) -> Result<(), QueueError> {
        match result {
            Ok(()) => {
                self.resolve(TaskOutcome::Completed);
                Ok(())
            }
            Err(error) => {
                let handled = self.hooks.notify(&error);
                let message = format!("{error:#}");
                self.resolve(TaskOutcome::Failed(Rc::new(error)));
                if handled {
                    warn!(task = %id, error = %message, "queued task failed");
                    Ok(())
                } else {
                    Err(QueueError::TaskFailed { task: id, message })
                }
            }
        }
    }
}

/// A cloneable future resolving to an item's [`TaskOutcome`].
#[derive(Clone)]
pub struct Completion {
    inner: Shared<oneshot::Receiver<TaskOutcome>>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("outcome", &self.inner.peek())
            .finish()
    }
}

impl Future for Completion {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner
            .poll_unpin(cx)
            .map(|received| received.unwrap_or(TaskOutcome::Cancelled(CancelReason::Disposed)))
    }
}

/// Caller-side view of one enqueued item.
pub struct TaskHandle {
    id: TaskId,
    priority: i32,
    hooks: Rc<ItemHooks>,
    completion: Completion,
    queue: Weak<QueueCore>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

/// Create the two ends of an item's completion signal.
pub(crate) fn pair(id: TaskId, priority: i32, queue: Weak<QueueCore>) -> (Completer, TaskHandle) {
    let (sender, receiver) = oneshot::channel();
    let hooks = Rc::new(ItemHooks::default());
    let completer = Completer {
        sender: Some(sender),
        hooks: Rc::clone(&hooks),
    };
    let handle = TaskHandle {
        id,
        priority,
        hooks,
        completion: Completion {
            inner: receiver.shared(),
        },
        queue,
    };
    (completer, handle)
}

impl TaskHandle {
    /// The item's id.
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// The priority the item was enqueued with.
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Route the item's failure to `handler` instead of the dispatch caller.
    #[must_use]
    pub fn on_exception<H>(self, handler: H) -> Self
    where
        H: FnMut(&anyhow::Error) + 'static,
    {
        *self.hooks.on_exception.borrow_mut() = Some(Box::new(handler));
        self
    }

    /// Cancel the item. A pending item is removed, an executing item is
    /// aborted. Returns `false` if the item had already finished.
    pub fn cancel(&self) -> bool {
        self.queue
            .upgrade()
            .is_some_and(|queue| queue.cancel_task(self.id))
    }

    /// The outcome, if the item has finished.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.completion.clone().now_or_never()
    }

    /// Whether the item has finished in any way.
    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }

    /// A future resolving to the item's outcome.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

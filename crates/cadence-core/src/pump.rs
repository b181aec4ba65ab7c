//! Helpers shared by everything that registers a pump.
//!
//! Actions are plain futures. A pump polls its in-flight action exactly once
//! per invocation with a no-op waker, so a pending action is simply polled
//! again on the next tick. That makes "await the next tick" a future that
//! is pending for one poll: [`next_tick`].

use std::task::{Context, Poll};

use futures::FutureExt as _;
use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use tokio_util::sync::CancellationToken;

/// The future produced by a scheduled action.
pub type ActionFuture = LocalBoxFuture<'static, anyhow::Result<()>>;

/// Suspend the calling action until the next tick of its phase.
///
/// It is pending for exactly one poll and wakes itself immediately. Only a
/// pump defers that second poll to the following tick; awaited from an
/// ordinary tokio task it is a plain yield to the runtime.
pub async fn next_tick() {
    tokio::task::yield_now().await;
}

/// Poll an action once without registering interest in a wake-up.
pub fn poll_action(future: &mut ActionFuture) -> Poll<anyhow::Result<()>> {
    let mut cx = Context::from_waker(noop_waker_ref());
    future.poll_unpin(&mut cx)
}

/// Derive a root token that is cancelled when `parent` is.
///
/// Without a parent the root is independent. Cancelling the returned token
/// never cancels the parent.
pub fn link_token(parent: Option<&CancellationToken>) -> CancellationToken {
    parent.map_or_else(CancellationToken::new, CancellationToken::child_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_tick_is_pending_for_one_poll() {
        let mut future: ActionFuture = Box::pin(async {
            next_tick().await;
            Ok::<(), anyhow::Error>(())
        });
        assert!(poll_action(&mut future).is_pending());
        assert!(matches!(poll_action(&mut future), Poll::Ready(Ok(()))));
    }

    #[test]
    fn errors_surface_when_ready() {
        let mut future: ActionFuture = Box::pin(async { Err::<(), _>(anyhow::anyhow!("nope")) });
        assert!(matches!(
            poll_action(&mut future),
            Poll::Ready(Err(ref err)) if err.to_string() == "nope"
        ));
    }

    #[test]
    fn linked_token_follows_parent_only() {
        let parent = CancellationToken::new();
        let child = link_token(Some(&parent));
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = link_token(Some(&parent));
        parent.cancel();
        assert!(child.is_cancelled());

        let root = link_token(None);
        assert!(!root.is_cancelled());
    }
}

//! Capacity enforcement for [`TaskQueue`](super::TaskQueue).
//!
//! Victim selection is a pure function over the queue's priorities so the
//! tie-break rules can be tested without running any actions.

use serde::{Deserialize, Serialize};

/// Rule for choosing which item leaves when an enqueue exceeds capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Capacity is not enforced.
    #[default]
    None,
    /// Replace the last pending item that the new item ties or outranks.
    SwapLast,
    /// Always drop the tail of the pending list.
    Discard,
}

impl EvictionPolicy {
    /// Whether this policy enforces a capacity.
    pub const fn is_bounded(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// The item chosen for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Victim {
    /// Nothing needs to leave.
    None,
    /// The pending item at this index.
    Pending(usize),
    /// The item currently executing.
    Executing,
}

/// Choose the item to evict after an item was inserted at `new_index`.
///
/// `pending` holds the priorities of the pending list in execution order,
/// already including the new item. `executing` is the priority of the item
/// in flight, if any.
///
/// `SwapLast` scans from the tail for the last pending item other than the
/// new one whose priority is at least the new item's. Failing that, the
/// executing item is aborted if its priority is at least the new item's.
/// Otherwise the tail goes, which is then always the new item.
pub fn select_victim(
    policy: EvictionPolicy,
    capacity: usize,
    pending: &[i32],
    new_index: usize,
    executing: Option<i32>,
) -> Victim {
    let count = pending.len().saturating_add(usize::from(executing.is_some()));
    if !policy.is_bounded() || count <= capacity {
        return Victim::None;
    }
    let Some(tail) = pending.len().checked_sub(1) else {
        return Victim::None;
    };

    match policy {
        EvictionPolicy::None => Victim::None,
        EvictionPolicy::Discard => Victim::Pending(tail),
        EvictionPolicy::SwapLast => {
            let Some(&new_priority) = pending.get(new_index) else {
                return Victim::Pending(tail);
            };
            let replaceable = pending
                .iter()
                .enumerate()
                .rev()
                .find(|&(index, &priority)| index != new_index && priority >= new_priority)
                .map(|(index, _)| index);
            match (replaceable, executing) {
                (Some(index), _) => Victim::Pending(index),
                (None, Some(running)) if running >= new_priority => Victim::Executing,
                (None, _) => Victim::Pending(tail),
            }
        }
    }
}

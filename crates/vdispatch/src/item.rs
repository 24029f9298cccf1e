//! Work items
//!
//! An item is a closure plus lifecycle state and the bookkeeping that lets
//! it sit on exactly one queue at a time: a worker queue, the timer queue, a
//! signal monitor list, the zombie list or a cache free-list. Items live in
//! the dispatcher's arena and are addressed by [`ItemId`].

use bitflags::bitflags;
use std::sync::Arc;
use vdispatch_core::{ItemState, ItemType};

bitflags! {
    /// Internal per-item flag byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ItemFlags: u8 {
        /// Submitter joins via `await_item` before reclaiming the item
        const AWAITABLE = 0x01;

        /// Cancellation requested; the item lands in cancelled state at
        /// retirement
        const CANCELLED = 0x20;

        /// Dispatcher owned; returns to the item cache when done
        const CACHEABLE = 0x40;

        /// Auto re-armed when it retires uncancelled (repeating timers,
        /// signal handlers)
        const REPEATING = 0x80;
    }
}

bitflags! {
    /// Flags accepted by `Dispatch::submit`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubmitFlags: u32 {
        /// The submitter will call `await_item` on this item
        const AWAITABLE = 0x01;
    }
}

bitflags! {
    /// Flags accepted by the timer entry points
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimerFlags: u32 {
        /// The deadline is absolute monotonic time rather than a delay
        const ABSTIME = 0x01;
    }
}

bitflags! {
    /// Flags accepted by `Dispatch::terminate`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TerminateFlags: u32 {
        /// Drain queued items instead of letting them run
        const CANCEL_ALL = 0x01;

        /// Block until the dispatcher reaches terminated state
        const AWAIT_ALL = 0x02;
    }
}

/// A user work closure; re-runnable so items can be resubmitted
pub(crate) type WorkFn = Box<dyn FnMut() + Send + 'static>;

/// A value-returning closure used by the `sync` adapter
pub(crate) type WorkValFn = Box<dyn FnMut() -> i32 + Send + 'static>;

/// Post-retirement hook; shared so it can run after the dispatcher mutex is
/// released
pub(crate) type RetireFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// The closure payload of an item
///
/// Closures are `Option`-wrapped so a worker can take one out, run it with
/// the dispatcher mutex released, and put it back on completion.
pub(crate) enum ItemBody {
    /// Cached conv item between uses
    Vacant,

    /// User item: closure plus optional retire hook
    User {
        func: Option<WorkFn>,
        retire: Option<RetireFn>,
    },

    /// Conv item or conv timer payload (spawn/after/repeating)
    Conv { func: Option<WorkFn> },

    /// Conv sync payload with its delivered result
    ConvSync { func: Option<WorkValFn>, result: i32 },
}

/// A work item record in the dispatcher arena
pub(crate) struct Item {
    pub(crate) ty: ItemType,

    /// Signal number for monitor handlers; 0 otherwise
    pub(crate) subtype: i32,

    pub(crate) flags: ItemFlags,
    pub(crate) state: ItemState,
    pub(crate) body: ItemBody,
}

impl Item {
    pub(crate) fn new_user(func: WorkFn, retire: Option<RetireFn>) -> Self {
        Item {
            ty: ItemType::UserItem,
            subtype: 0,
            flags: ItemFlags::empty(),
            state: ItemState::Idle,
            body: ItemBody::User {
                func: Some(func),
                retire,
            },
        }
    }

    pub(crate) fn new_conv(ty: ItemType) -> Self {
        Item {
            ty,
            subtype: 0,
            flags: ItemFlags::empty(),
            state: ItemState::Idle,
            body: ItemBody::Vacant,
        }
    }

    /// True when the item has a closure to run
    pub(crate) fn is_runnable(&self) -> bool {
        match &self.body {
            ItemBody::Vacant => false,
            ItemBody::User { func, .. } | ItemBody::Conv { func } => func.is_some(),
            ItemBody::ConvSync { func, .. } => func.is_some(),
        }
    }

    pub(crate) fn retire_hook(&self) -> Option<RetireFn> {
        match &self.body {
            ItemBody::User { retire, .. } => retire.clone(),
            _ => None,
        }
    }
}

/// A closure extracted from an item for execution off-lock
pub(crate) enum Runnable {
    Plain(WorkFn),
    Valued(WorkValFn),
}

impl Runnable {
    /// Take the closure out of `item`; pair with [`Runnable::restore`]
    pub(crate) fn take(item: &mut Item) -> Option<Runnable> {
        match &mut item.body {
            ItemBody::Vacant => None,
            ItemBody::User { func, .. } | ItemBody::Conv { func } => {
                func.take().map(Runnable::Plain)
            }
            ItemBody::ConvSync { func, .. } => func.take().map(Runnable::Valued),
        }
    }

    /// Run the closure; returns the produced value for `Valued` payloads
    pub(crate) fn run(&mut self) -> i32 {
        match self {
            Runnable::Plain(f) => {
                f();
                0
            }
            Runnable::Valued(f) => f(),
        }
    }

    /// Put the closure back and record the result
    pub(crate) fn restore(self, item: &mut Item, value: i32) {
        match (self, &mut item.body) {
            (Runnable::Plain(f), ItemBody::User { func, .. })
            | (Runnable::Plain(f), ItemBody::Conv { func }) => {
                *func = Some(f);
            }
            (Runnable::Valued(f), ItemBody::ConvSync { func, result }) => {
                *func = Some(f);
                *result = value;
            }
            _ => {}
        }
    }
}

/// Adapt a one-shot closure into the re-runnable work-fn shape; extra calls
/// are no-ops
pub(crate) fn once_fn<F>(f: F) -> WorkFn
where
    F: FnOnce() + Send + 'static,
{
    let mut f = Some(f);
    Box::new(move || {
        if let Some(f) = f.take() {
            f();
        }
    })
}

/// One-shot adapter for value-returning closures
pub(crate) fn once_val_fn<F>(f: F) -> WorkValFn
where
    F: FnOnce() -> i32 + Send + 'static,
{
    let mut f = Some(f);
    Box::new(move || f.take().map(|f| f()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits_disjoint() {
        let all = ItemFlags::all();
        assert!(all.contains(ItemFlags::AWAITABLE));
        assert!(all.contains(ItemFlags::CANCELLED));
        assert_eq!(
            ItemFlags::AWAITABLE.bits() & ItemFlags::CANCELLED.bits(),
            0
        );
    }

    #[test]
    fn test_submit_flags_reject_unknown_bits() {
        assert!(SubmitFlags::from_bits(0x01).is_some());
        assert!(SubmitFlags::from_bits(0x08).is_none());
    }

    #[test]
    fn test_runnable_roundtrip() {
        let mut item = Item::new_user(once_fn(|| {}), None);
        let mut runnable = Runnable::take(&mut item).unwrap();
        assert!(!item.is_runnable());
        runnable.run();
        runnable.restore(&mut item, 0);
        assert!(item.is_runnable());
    }

    #[test]
    fn test_once_val_fn_single_shot() {
        let mut f = once_val_fn(|| 7);
        assert_eq!(f(), 7);
        assert_eq!(f(), 0);
    }
}

//! Item and dispatcher state machines, QoS categories, priority band
//!
//! Permissible item state transitions:
//!
//! ```text
//! Idle      -> Scheduled
//! Scheduled -> Executing | Cancelled
//! Executing -> Finished  | Cancelled
//! Finished  -> Scheduled      (re-submit)
//! Cancelled -> Scheduled      (re-submit)
//! ```
//!
//! The move from Scheduled/Executing into Cancelled happens indirectly:
//! cancellation first sets a flag on the item, and the item only lands in
//! Cancelled state at retirement. Cancelling is cooperative; an executing
//! item must notice the flag itself.

use core::fmt;

/// State of a work item
///
/// The ordering matters: waits compare against `Finished` to detect
/// completion in either terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ItemState {
    /// Not on any queue
    Idle = 0,

    /// On a worker queue, the timer queue, or a monitor list
    Scheduled = 1,

    /// Closure running on a worker, dispatcher mutex dropped
    Executing = 2,

    /// Retired normally
    Finished = 3,

    /// Retired after cancellation
    Cancelled = 4,
}

impl ItemState {
    /// True once the item has retired, in either terminal state
    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, ItemState::Finished | ItemState::Cancelled)
    }

    /// True while the item is owned by a queue or a worker
    #[inline]
    pub const fn is_live(&self) -> bool {
        matches!(self, ItemState::Scheduled | ItemState::Executing)
    }
}

/// What kind of item this is; drives the retirement path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    /// User owned work item
    UserItem = 1,

    /// User owned signal-monitor handler
    UserSignalItem = 2,

    /// User owned timer item
    UserTimer = 3,

    /// Dispatcher owned, cacheable convenience item (spawn/sync)
    ConvItem = 4,

    /// Dispatcher owned, cacheable convenience timer (after/repeating)
    ConvTimer = 5,
}

impl ItemType {
    /// True for dispatcher-owned cacheable types
    #[inline]
    pub const fn is_cacheable(&self) -> bool {
        matches!(self, ItemType::ConvItem | ItemType::ConvTimer)
    }
}

/// Dispatcher lifecycle state
///
/// Transitions are latched: once a dispatcher reaches `Terminating` it never
/// goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DispatchState {
    Active = 0,
    Suspending = 1,
    Suspended = 2,
    Terminating = 3,
    Terminated = 4,
}

impl DispatchState {
    /// Admitting new work?
    #[inline]
    pub const fn is_active(&self) -> bool {
        (*self as u8) < DispatchState::Terminating as u8
    }

    #[inline]
    pub const fn is_suspending_or_suspended(&self) -> bool {
        matches!(self, DispatchState::Suspending | DispatchState::Suspended)
    }
}

/// Quality-of-service category, ascending priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Qos {
    Background = 0,
    Utility = 1,
    Interactive = 2,
    Realtime = 3,
}

impl Default for Qos {
    fn default() -> Self {
        Qos::Utility
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qos::Background => write!(f, "background"),
            Qos::Utility => write!(f, "utility"),
            Qos::Interactive => write!(f, "interactive"),
            Qos::Realtime => write!(f, "realtime"),
        }
    }
}

/// Lowest dispatcher priority within a QoS class
pub const PRI_LOWEST: i8 = -8;

/// Highest dispatcher priority within a QoS class
pub const PRI_HIGHEST: i8 = 7;

/// Number of priority slots per QoS class
pub const PRI_COUNT: i32 = 16;

/// Low vcpu priority slots reserved for runtime bookkeeping
pub const VCPU_PRI_RESERVED_LOW: i32 = 2;

/// Scheduling parameters pushed down to a vcpu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParams {
    pub qos: Qos,
    pub priority: i8,
}

impl SchedParams {
    /// Flatten QoS + priority into the vcpu scheduler's single priority
    /// band, skipping the reserved low slots.
    pub fn effective_priority(&self) -> i32 {
        self.qos as i32 * PRI_COUNT + (self.priority as i32 + PRI_COUNT / 2) + VCPU_PRI_RESERVED_LOW
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_state_order() {
        assert!(ItemState::Idle < ItemState::Scheduled);
        assert!(ItemState::Scheduled < ItemState::Executing);
        assert!(ItemState::Executing < ItemState::Finished);
        assert!(ItemState::Finished.is_done());
        assert!(ItemState::Cancelled.is_done());
        assert!(!ItemState::Executing.is_done());
        assert!(ItemState::Scheduled.is_live());
    }

    #[test]
    fn test_dispatch_state() {
        assert!(DispatchState::Active.is_active());
        assert!(DispatchState::Suspended.is_active());
        assert!(!DispatchState::Terminating.is_active());
        assert!(DispatchState::Suspending.is_suspending_or_suspended());
        assert!(DispatchState::Suspending < DispatchState::Terminating);
    }

    #[test]
    fn test_qos_order() {
        assert!(Qos::Background < Qos::Utility);
        assert!(Qos::Interactive < Qos::Realtime);
    }

    #[test]
    fn test_effective_priority_band() {
        let lo = SchedParams { qos: Qos::Background, priority: PRI_LOWEST };
        let hi = SchedParams { qos: Qos::Realtime, priority: PRI_HIGHEST };
        assert_eq!(lo.effective_priority(), VCPU_PRI_RESERVED_LOW);
        assert!(hi.effective_priority() > lo.effective_priority());
        assert_eq!(hi.effective_priority(), 3 * PRI_COUNT + 15 + VCPU_PRI_RESERVED_LOW);
    }
}

//! Timers
//!
//! Armed timers sit on a queue sorted by ascending absolute deadline, FIFO
//! on ties. Workers pull the front timer once it is due, ahead of any plain
//! work item. A repeating timer that missed several periods while blocked
//! advances its deadline past "now" and fires once for the whole gap.

use crate::dispatch::{Deferred, Dispatch, Inner};
use crate::item::{once_fn, ItemBody, ItemFlags, TimerFlags};
use vdispatch_core::{clock, Error, ItemId, ItemState, ItemType, Result, TimeSpec, TimerId};

/// An armed timer: an item plus its fire time and period
pub(crate) struct Timer {
    pub(crate) item: ItemId,

    /// Absolute monotonic fire time
    pub(crate) deadline: TimeSpec,

    /// Period for repeating timers; infinity marks one-shot
    pub(crate) interval: TimeSpec,
}

/// Repeating means a finite, nonzero period; a zero period arms one-shot so
/// rearming can never spin.
fn is_repeating_interval(interval: TimeSpec) -> bool {
    interval > TimeSpec::ZERO && interval < TimeSpec::INFINITY
}

/// Flag bits outside the defined set are invalid
fn check_timer_flags(flags: TimerFlags) -> Result<()> {
    if TimerFlags::from_bits(flags.bits()).is_none() {
        return Err(Error::Inval);
    }
    Ok(())
}

impl Dispatch {
    fn abs_deadline(flags: TimerFlags, deadline: TimeSpec) -> TimeSpec {
        if flags.contains(TimerFlags::ABSTIME) {
            deadline
        } else {
            clock::now().add(deadline)
        }
    }

    /// Insert an armed timer into the queue and wake the pool
    pub(crate) fn arm_timer_locked(
        &self,
        inner: &mut Inner,
        tid: TimerId,
    ) -> Result<()> {
        // A timer is pointless without somebody to fire it.
        if inner.worker_count() == 0 {
            self.acquire_worker(inner)?;
        }

        let (item, deadline) = {
            let timer = inner.timers.get(tid.raw()).ok_or(Error::Inval)?;
            (timer.item, timer.deadline)
        };
        if let Some(rec) = inner.items.get_mut(item.raw()) {
            rec.state = ItemState::Scheduled;
            rec.flags.remove(ItemFlags::CANCELLED);
        }

        // Sorted by deadline ascending; equal deadlines keep arrival order.
        let pos = {
            let timers = &inner.timers;
            inner.timer_queue.iter().position(|t| {
                timers
                    .get(t.raw())
                    .map_or(false, |other| other.deadline > deadline)
            })
        };
        match pos {
            Some(p) => inner.timer_queue.insert(p, tid),
            None => inner.timer_queue.push_back(tid),
        }

        // Coarse broadcast; exactly one worker wins the race for the timer.
        self.wakeup_all_workers(inner);
        Ok(())
    }

    /// Re-arm a repeating timer after it fired, skipping missed periods
    pub(crate) fn rearm_timer_locked(
        &self,
        inner: &mut Inner,
        tid: TimerId,
    ) -> Result<()> {
        let now = clock::now();
        let item = {
            let Some(timer) = inner.timers.get_mut(tid.raw()) else {
                return Ok(());
            };
            loop {
                timer.deadline = timer.deadline.add(timer.interval);
                if !(timer.deadline <= now && timer.interval > TimeSpec::ZERO) {
                    break;
                }
            }
            timer.item
        };
        if let Some(rec) = inner.items.get_mut(item.raw()) {
            rec.state = ItemState::Idle;
        }
        self.arm_timer_locked(inner, tid)
    }

    /// Free a timer record and retire its item
    pub(crate) fn retire_timer_locked(
        &self,
        inner: &mut Inner,
        tid: TimerId,
        deferred: &mut Deferred,
    ) {
        let Some(timer) = inner.timers.remove(tid.raw()) else {
            return;
        };
        self.retire_item_locked(inner, timer.item, deferred);
    }

    /// Pull the timer that carries `item` off the queue and retire it
    pub(crate) fn withdraw_timer_for_item(
        &self,
        inner: &mut Inner,
        item: ItemId,
        deferred: &mut Deferred,
    ) {
        let pos = {
            let timers = &inner.timers;
            inner.timer_queue.iter().position(|t| {
                timers.get(t.raw()).map_or(false, |timer| timer.item == item)
            })
        };
        if let Some(pos) = pos {
            if let Some(tid) = inner.timer_queue.remove(pos) {
                self.retire_timer_locked(inner, tid, deferred);
            }
        }
    }

    /// Retire every armed timer; runs during termination
    pub(crate) fn drain_timers_locked(&self, inner: &mut Inner, deferred: &mut Deferred) {
        while let Some(tid) = inner.timer_queue.pop_front() {
            self.retire_timer_locked(inner, tid, deferred);
        }
    }

    /// Arm a user item as a timer
    ///
    /// `deadline` is a delay unless `ABSTIME` is set; `interval` of zero or
    /// infinity arms one-shot, anything else repeats.
    pub fn timer(
        &self,
        flags: TimerFlags,
        deadline: TimeSpec,
        interval: TimeSpec,
        item: ItemId,
    ) -> Result<()> {
        check_timer_flags(flags)?;
        if !deadline.is_valid()
            || deadline.is_negative()
            || !interval.is_valid()
            || interval.is_negative()
        {
            return Err(Error::Inval);
        }

        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;

        {
            let rec = inner.items.get_mut(item.raw()).ok_or(Error::Inval)?;
            if rec.state.is_live() {
                return Err(Error::Busy);
            }
            if !rec.is_runnable() {
                return Err(Error::Inval);
            }
            rec.ty = ItemType::UserTimer;
            rec.subtype = 0;
            rec.flags = if is_repeating_interval(interval) {
                ItemFlags::REPEATING
            } else {
                ItemFlags::empty()
            };
        }

        let abs = Self::abs_deadline(flags, deadline);
        let tid = TimerId::new(inner.timers.insert(Timer {
            item,
            deadline: abs,
            interval,
        }));
        match self.arm_timer_locked(&mut inner, tid) {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.timers.remove(tid.raw());
                if let Some(rec) = inner.items.get_mut(item.raw()) {
                    rec.state = ItemState::Idle;
                }
                Err(e)
            }
        }
    }

    /// Run a closure once when `deadline` passes
    ///
    /// Returns the internal item handle for cancellation.
    pub fn after<F>(&self, flags: TimerFlags, deadline: TimeSpec, f: F) -> Result<ItemId>
    where
        F: FnOnce() + Send + 'static,
    {
        check_timer_flags(flags)?;
        if !deadline.is_valid() || deadline.is_negative() {
            return Err(Error::Inval);
        }

        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;

        let item = self.acquire_cached_conv_locked(&mut inner, ItemType::ConvTimer);
        if let Some(rec) = inner.items.get_mut(item.raw()) {
            rec.flags = ItemFlags::CACHEABLE;
            rec.body = ItemBody::Conv {
                func: Some(once_fn(f)),
            };
        }

        let abs = Self::abs_deadline(flags, deadline);
        let tid = TimerId::new(inner.timers.insert(Timer {
            item,
            deadline: abs,
            interval: TimeSpec::INFINITY,
        }));
        match self.arm_timer_locked(&mut inner, tid) {
            Ok(()) => Ok(item),
            Err(e) => {
                inner.timers.remove(tid.raw());
                self.cache_item_locked(&mut inner, item);
                Err(e)
            }
        }
    }

    /// Run a closure whenever the period elapses, starting at `deadline`
    ///
    /// Returns the internal item handle for cancellation.
    pub fn repeating<F>(
        &self,
        flags: TimerFlags,
        deadline: TimeSpec,
        interval: TimeSpec,
        f: F,
    ) -> Result<ItemId>
    where
        F: FnMut() + Send + 'static,
    {
        check_timer_flags(flags)?;
        if !deadline.is_valid()
            || deadline.is_negative()
            || !interval.is_valid()
            || interval.is_negative()
        {
            return Err(Error::Inval);
        }

        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;

        let item = self.acquire_cached_conv_locked(&mut inner, ItemType::ConvTimer);
        if let Some(rec) = inner.items.get_mut(item.raw()) {
            rec.flags = if is_repeating_interval(interval) {
                ItemFlags::CACHEABLE | ItemFlags::REPEATING
            } else {
                ItemFlags::CACHEABLE
            };
            rec.body = ItemBody::Conv {
                func: Some(Box::new(f)),
            };
        }

        let abs = Self::abs_deadline(flags, deadline);
        let tid = TimerId::new(inner.timers.insert(Timer {
            item,
            deadline: abs,
            interval,
        }));
        match self.arm_timer_locked(&mut inner, tid) {
            Ok(()) => Ok(item),
            Err(e) => {
                inner.timers.remove(tid.raw());
                self.cache_item_locked(&mut inner, item);
                Err(e)
            }
        }
    }
}

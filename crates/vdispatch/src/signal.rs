//! Signal monitors
//!
//! Each signal number can carry a list of repeating handler items. When a
//! worker wakes on a monitored signal it moves every registered handler
//! onto its own queue, so one delivery fires each handler exactly once;
//! finished handlers return to the monitor list, not to the cache.
//!
//! A dispatcher-wide bitset lets callers reserve free signal numbers. The
//! dispatch-wake and kill signals are never allocatable.

use crate::dispatch::{Deferred, Dispatch, Inner};
use crate::item::ItemFlags;
use crate::worker;
use std::collections::VecDeque;
use vdispatch_core::{
    Error, ItemId, ItemState, ItemType, Result, SigSet, VcpuGroupId, WorkerId, SIGDISP, SIGKILL,
    SIGMAX, SIGMIN,
};
use vdispatch_runtime::{self as vcpu_rt, SigScope};

/// Per-signal monitor entry
#[derive(Default)]
pub(crate) struct SigTrap {
    /// Armed handlers, FIFO
    pub(crate) handlers: VecDeque<ItemId>,

    /// Registered handlers, armed or in flight; gates hot-signal enablement
    pub(crate) count: usize,
}

fn trap_index(signo: i32) -> usize {
    (signo - SIGMIN) as usize
}

fn reserved(signo: i32) -> bool {
    signo == SIGDISP || signo == SIGKILL
}

impl Dispatch {
    /// Flip `signo` hot or cold on every worker
    pub(crate) fn enable_signal_locked(&self, inner: &mut Inner, signo: i32, enable: bool) {
        let order: Vec<WorkerId> = inner.worker_order.clone();
        for wid in order {
            if let Some(w) = inner.workers.get_mut(wid.raw()) {
                if enable {
                    w.hotsigs.add(signo);
                } else {
                    w.hotsigs.del(signo);
                }
            }
        }
    }

    /// Register `item` as a repeating handler for `signo`
    pub fn signal_monitor(&self, signo: i32, item: ItemId) -> Result<()> {
        if !SigSet::is_valid_signo(signo) || reserved(signo) {
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
            rec.ty = ItemType::UserSignalItem;
            rec.subtype = signo;
            rec.flags = ItemFlags::REPEATING;
            rec.state = ItemState::Idle;
        }

        let trap_count = (SIGMAX - SIGMIN + 1) as usize;
        let traps = inner
            .sigtraps
            .get_or_insert_with(|| (0..trap_count).map(|_| SigTrap::default()).collect());
        let newly_hot = {
            let trap = &mut traps[trap_index(signo)];
            trap.handlers.push_back(item);
            trap.count += 1;
            trap.count == 1
        };

        if newly_hot {
            self.enable_signal_locked(&mut inner, signo, true);
            // Sleeping workers re-enter their wait with the refreshed mask.
            self.wakeup_all_workers(&inner);
        }

        // A delivery needs at least one worker alive to consume it.
        if inner.worker_count() == 0 {
            self.acquire_worker(&mut inner)?;
        }

        Ok(())
    }

    /// Move every armed handler for `signo` onto the consuming worker's
    /// queue
    pub(crate) fn submit_items_for_signal_locked(
        &self,
        inner: &mut Inner,
        signo: i32,
        wid: WorkerId,
    ) {
        if !SigSet::is_valid_signo(signo) {
            return;
        }
        let idx = trap_index(signo);
        loop {
            let popped = inner
                .sigtraps
                .as_mut()
                .and_then(|traps| traps.get_mut(idx))
                .and_then(|trap| trap.handlers.pop_front());
            let Some(item) = popped else {
                break;
            };
            if let Some(rec) = inner.items.get_mut(item.raw()) {
                rec.state = ItemState::Scheduled;
            }
            // No wakeup: this runs on the worker that woke for the signal.
            worker::worker_submit(self, inner, wid, item, false);
        }
    }

    /// Put a finished repeating handler back onto its monitor list
    pub(crate) fn rearm_signal_item_locked(&self, inner: &mut Inner, item: ItemId) {
        let signo = match inner.items.get_mut(item.raw()) {
            Some(rec) => {
                rec.state = ItemState::Idle;
                rec.subtype
            }
            None => return,
        };
        if !SigSet::is_valid_signo(signo) {
            return;
        }
        if let Some(traps) = inner.sigtraps.as_mut() {
            traps[trap_index(signo)].handlers.push_back(item);
        }
    }

    /// Retire a handler for good: drop its registration and turn the signal
    /// cold when it was the last one
    pub(crate) fn retire_signal_item_locked(
        &self,
        inner: &mut Inner,
        item: ItemId,
        deferred: &mut Deferred,
    ) {
        let signo = inner
            .items
            .get(item.raw())
            .map(|rec| rec.subtype)
            .unwrap_or(0);

        self.retire_item_locked(inner, item, deferred);

        if !SigSet::is_valid_signo(signo) {
            return;
        }
        let went_cold = inner
            .sigtraps
            .as_mut()
            .map(|traps| {
                let trap = &mut traps[trap_index(signo)];
                trap.count = trap.count.saturating_sub(1);
                trap.count == 0
            })
            .unwrap_or(false);
        if went_cold {
            self.enable_signal_locked(inner, signo, false);
        }
    }

    /// Unlink an armed handler from its monitor list and retire it
    pub(crate) fn withdraw_signal_item_locked(
        &self,
        inner: &mut Inner,
        item: ItemId,
        deferred: &mut Deferred,
    ) {
        let signo = inner
            .items
            .get(item.raw())
            .map(|rec| rec.subtype)
            .unwrap_or(0);
        if !SigSet::is_valid_signo(signo) {
            return;
        }

        let removed = inner
            .sigtraps
            .as_mut()
            .map(|traps| {
                let trap = &mut traps[trap_index(signo)];
                match trap.handlers.iter().position(|h| *h == item) {
                    Some(pos) => {
                        trap.handlers.remove(pos);
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false);
        if removed {
            self.retire_signal_item_locked(inner, item, deferred);
        }
    }

    /// Reserve a signal number: a specific one, or with `signo == 0` the
    /// first free number scanning from the low-priority end
    pub fn alloc_signal(&self, signo: i32) -> Result<i32> {
        let mut inner = self.lock_inner();
        if signo == 0 {
            for candidate in (SIGMIN..=SIGMAX).rev() {
                if !inner.alloced_sigs.contains(candidate) {
                    inner.alloced_sigs.add(candidate);
                    return Ok(candidate);
                }
            }
            Err(Error::Busy)
        } else {
            if !SigSet::is_valid_signo(signo) {
                return Err(Error::Inval);
            }
            if inner.alloced_sigs.contains(signo) {
                return Err(Error::Busy);
            }
            inner.alloced_sigs.add(signo);
            Ok(signo)
        }
    }

    /// Release a reserved signal number; the reserved pair stays taken
    pub fn free_signal(&self, signo: i32) {
        let mut inner = self.lock_inner();
        if SigSet::is_valid_signo(signo) && !reserved(signo) {
            inner.alloced_sigs.del(signo);
        }
    }

    /// The vcpu-group id signals for this dispatcher are addressed to
    pub fn signal_target(&self) -> VcpuGroupId {
        self.lock_inner().groupid
    }

    /// Deliver `signo` to the dispatcher's workers
    ///
    /// On a serial dispatcher the lone worker is targeted directly;
    /// otherwise delivery is group-scoped and any worker may consume it.
    pub fn send_signal(&self, signo: i32) -> Result<()> {
        if !SigSet::is_valid_signo(signo) || reserved(signo) {
            return Err(Error::Inval);
        }

        let inner = self.lock_inner();
        let scope = if inner.attr.max_concurrency == 1 {
            match inner
                .worker_order
                .first()
                .and_then(|wid| inner.workers.get(wid.raw()))
            {
                Some(worker) => SigScope::Vcpu(worker.vcpu),
                None => SigScope::Group(inner.groupid),
            }
        } else {
            SigScope::Group(inner.groupid)
        };
        vcpu_rt::sigsend(scope, signo)
    }
}

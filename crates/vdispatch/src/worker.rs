//! Workers
//!
//! A worker owns one vcpu and loops `next_work -> execute -> retire` under
//! the dispatcher mutex, dropping it only to run a closure or to block in
//! the signal-gated wait. A worker that sat idle past its timeout
//! relinquishes itself as long as the pool stays at or above the configured
//! minimum.

use crate::dispatch::{run_deferred, Deferred, Dispatch, DispatchRef, Inner};
use crate::item::{ItemFlags, Runnable};
use crate::tls;
use std::collections::VecDeque;
use std::sync::{Arc, MutexGuard};
use vdispatch_core::kdebug;
use vdispatch_core::{
    clock, DispatchState, Error, ItemId, ItemState, ItemType, SigSet, TimeSpec, TimerId, VcpuId,
    WorkerId, SIGDISP, SIGMIN,
};
use vdispatch_runtime::{self as vcpu_rt, AcquireParams, TIMER_ABSTIME};

/// How long an idle worker waits for work before offering to relinquish
const WORKER_IDLE_TIMEOUT: TimeSpec = TimeSpec::from_secs(2);

/// How a worker came by its vcpu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Adoption {
    /// Spawned a fresh vcpu; relinquishing terminates it
    Acquire,

    /// Wrapped the process main vcpu; relinquishing must leave it alive
    AdoptMain,
}

/// Per-worker record in the dispatcher arena
pub(crate) struct Worker {
    /// FIFO of scheduled items owned by this worker
    pub(crate) queue: VecDeque<ItemId>,
    pub(crate) work_count: usize,

    pub(crate) current_item: Option<ItemId>,
    pub(crate) current_timer: Option<TimerId>,

    pub(crate) vcpu: VcpuId,

    /// Signals this worker wakes for; always contains the dispatch-wake
    /// signal, plus monitored signals while handlers are registered
    pub(crate) hotsigs: SigSet,

    pub(crate) adoption: Adoption,
    pub(crate) allow_relinquish: bool,
    pub(crate) is_suspended: bool,
}

/// Allocate a worker record and bind it to a vcpu. The caller links the
/// returned id into the worker order list.
pub(crate) fn create_worker(
    d: &Arc<Dispatch>,
    inner: &mut Inner,
    adoption: Adoption,
) -> crate::Result<WorkerId> {
    let mut hotsigs = SigSet::new();
    hotsigs.add(SIGDISP);
    // Workers born while monitors are registered start with those signals
    // hot, like their older siblings.
    if let Some(traps) = &inner.sigtraps {
        for (i, trap) in traps.iter().enumerate() {
            if trap.count > 0 {
                hotsigs.add(i as i32 + SIGMIN);
            }
        }
    }

    let worker = Worker {
        queue: VecDeque::new(),
        work_count: 0,
        current_item: None,
        current_timer: None,
        vcpu: VcpuId::NONE,
        hotsigs,
        adoption,
        allow_relinquish: matches!(adoption, Adoption::Acquire),
        is_suspended: false,
    };
    let wid = WorkerId::new(inner.workers.insert(worker));
    let sched = inner.sched_params();

    let vcpu = match adoption {
        Adoption::Acquire => {
            let dd = Arc::clone(d);
            match vcpu_rt::acquire(AcquireParams {
                func: Box::new(move || worker_run(dd, wid)),
                stack_size: 0,
                groupid: inner.groupid,
                sched,
                suspended: false,
            }) {
                Ok(v) => v,
                Err(e) => {
                    inner.workers.remove(wid.raw());
                    return Err(e);
                }
            }
        }
        Adoption::AdoptMain => vcpu_rt::adopt_main(inner.groupid, sched),
    };

    if let Some(w) = inner.workers.get_mut(wid.raw()) {
        w.vcpu = vcpu;
    }
    kdebug!("worker {} up on {} ({:?})", wid, vcpu, adoption);
    Ok(wid)
}

/// Queue `item` on `wid` and optionally wake its vcpu
pub(crate) fn worker_submit(
    d: &Dispatch,
    inner: &mut Inner,
    wid: WorkerId,
    item: ItemId,
    wakeup: bool,
) {
    if let Some(w) = inner.workers.get_mut(wid.raw()) {
        w.queue.push_back(item);
        w.work_count += 1;
        if wakeup {
            d.wakeup_worker(w);
        }
    }
}

/// Unlink `item` from whichever worker queue holds it
pub(crate) fn withdraw_from_any_worker(inner: &mut Inner, item: ItemId) -> bool {
    let order: Vec<WorkerId> = inner.worker_order.clone();
    for wid in order {
        if let Some(w) = inner.workers.get_mut(wid.raw()) {
            if let Some(pos) = w.queue.iter().position(|i| *i == item) {
                w.queue.remove(pos);
                w.work_count -= 1;
                return true;
            }
        }
    }
    false
}

/// Retire everything still queued on `wid`
pub(crate) fn drain_worker(
    d: &Dispatch,
    inner: &mut Inner,
    wid: WorkerId,
    deferred: &mut Deferred,
) {
    loop {
        let popped = inner.workers.get_mut(wid.raw()).and_then(|w| {
            w.queue.pop_front().map(|item| {
                w.work_count -= 1;
                item
            })
        });
        let Some(item) = popped else {
            break;
        };
        match inner.items.get(item.raw()).map(|r| r.ty) {
            Some(ItemType::UserSignalItem) => d.retire_signal_item_locked(inner, item, deferred),
            Some(_) => d.retire_item_locked(inner, item, deferred),
            None => {}
        }
    }
}

/// The worker loop; runs as the vcpu entry function
pub(crate) fn worker_run(d: DispatchRef, wid: WorkerId) {
    tls::set_current(&d, wid);
    let mut deferred = Deferred::new();
    let mut inner = d.lock_inner();

    loop {
        let (guard, work) = next_work(&d, inner, wid, &mut deferred);
        inner = guard;
        let Some((item, timer)) = work else {
            break;
        };

        // Execute: mark the item, pull its closure, run it off-lock.
        let runnable = {
            match inner.items.get_mut(item.raw()) {
                Some(rec) => {
                    rec.state = ItemState::Executing;
                    Runnable::take(rec)
                }
                None => None,
            }
        };
        if let Some(w) = inner.workers.get_mut(wid.raw()) {
            w.current_item = Some(item);
            w.current_timer = timer;
        }

        if let Some(mut runnable) = runnable {
            drop(inner);
            run_deferred(&mut deferred);

            let value = runnable.run();

            inner = d.lock_inner();
            if let Some(rec) = inner.items.get_mut(item.raw()) {
                runnable.restore(rec, value);
            }
        }

        // Retire: repeating signal items and timers re-arm unless
        // cancelled; everything else retires outright.
        let info = inner.items.get(item.raw()).map(|r| (r.ty, r.flags));
        if let Some((ty, flags)) = info {
            let repeat = flags.contains(ItemFlags::REPEATING) && !flags.contains(ItemFlags::CANCELLED);
            match ty {
                ItemType::UserItem | ItemType::ConvItem => {
                    d.retire_item_locked(&mut inner, item, &mut deferred);
                }
                ItemType::UserSignalItem => {
                    if repeat {
                        d.rearm_signal_item_locked(&mut inner, item);
                    } else {
                        d.retire_signal_item_locked(&mut inner, item, &mut deferred);
                    }
                }
                ItemType::UserTimer | ItemType::ConvTimer => {
                    if let Some(tid) = timer {
                        if repeat {
                            let _ = d.rearm_timer_locked(&mut inner, tid);
                        } else {
                            d.retire_timer_locked(&mut inner, tid, &mut deferred);
                        }
                    }
                }
            }
        }

        if let Some(w) = inner.workers.get_mut(wid.raw()) {
            w.current_item = None;
            w.current_timer = None;
        }
    }

    // Relinquish: unlink, wake joiners, release the vcpu.
    let adoption = inner
        .workers
        .get(wid.raw())
        .map(|w| w.adoption)
        .unwrap_or(Adoption::Acquire);
    inner.worker_order.retain(|w| *w != wid);
    inner.workers.remove(wid.raw());
    d.cond.notify_all();
    drop(inner);
    run_deferred(&mut deferred);
    tls::clear_current();
    kdebug!("worker {} relinquished", wid);

    if matches!(adoption, Adoption::Acquire) {
        vcpu_rt::relinquish_self();
    }
}

/// Pick the next piece of work for `wid`, blocking as needed. `None` asks
/// the worker to relinquish.
fn next_work<'a>(
    d: &'a Arc<Dispatch>,
    mut inner: MutexGuard<'a, Inner>,
    wid: WorkerId,
    deferred: &mut Deferred,
) -> (MutexGuard<'a, Inner>, Option<(ItemId, Option<TimerId>)>) {
    let mut may_relinquish = false;

    loop {
        // Timers take precedence: they are tied to a deadline while plain
        // items never promised an execution time.
        if let Some(&tid) = inner.timer_queue.front() {
            match inner.timers.get(tid.raw()) {
                Some(timer) if timer.deadline <= clock::now() => {
                    let item = timer.item;
                    inner.timer_queue.pop_front();
                    return (inner, Some((item, Some(tid))));
                }
                Some(_) => {}
                None => {
                    inner.timer_queue.pop_front();
                    continue;
                }
            }
        }

        // Next a queued work item.
        let popped = inner.workers.get_mut(wid.raw()).and_then(|w| {
            w.queue.pop_front().map(|item| {
                w.work_count -= 1;
                item
            })
        });
        if let Some(item) = popped {
            return (inner, Some((item, None)));
        }

        let (work_count, allow_relinquish) = inner
            .workers
            .get(wid.raw())
            .map(|w| (w.work_count, w.allow_relinquish))
            .unwrap_or((0, false));

        if inner.state >= DispatchState::Terminating && work_count == 0 {
            return (inner, None);
        }
        if may_relinquish {
            return (inner, None);
        }

        // Compute the wait deadline: the soonest timer if one is armed, the
        // idle timeout if this worker may exit, forever otherwise.
        let (deadline, flags) = if let Some(&tid) = inner.timer_queue.front() {
            let dl = inner
                .timers
                .get(tid.raw())
                .map(|t| t.deadline)
                .unwrap_or(TimeSpec::INFINITY);
            (dl, TIMER_ABSTIME)
        } else if allow_relinquish {
            (WORKER_IDLE_TIMEOUT, 0)
        } else {
            (TimeSpec::INFINITY, 0)
        };
        let hotsigs = inner
            .workers
            .get(wid.raw())
            .map(|w| w.hotsigs)
            .unwrap_or(SigSet::EMPTY);

        // Wait for work with the dispatcher mutex released. A timeout is
        // fine: either work arrived in the meantime or the worker is free
        // to go.
        drop(inner);
        run_deferred(deferred);
        let res = vcpu_rt::sigtimedwait(hotsigs, flags, deadline);
        inner = d.lock_inner();

        if matches!(res, Err(Error::TimedOut)) {
            let only_dispatch_hot = {
                let mut disp = SigSet::new();
                disp.add(SIGDISP);
                inner
                    .workers
                    .get(wid.raw())
                    .map(|w| w.hotsigs.without(disp).is_empty())
                    .unwrap_or(true)
            };
            if inner.worker_count() > inner.attr.min_concurrency
                && allow_relinquish
                && only_dispatch_hot
            {
                may_relinquish = true;
            }
        }

        if inner.state.is_suspending_or_suspended() {
            inner = wait_for_resume(d, inner, wid);
        }

        if let Ok(signo) = res {
            if signo != SIGDISP {
                d.submit_items_for_signal_locked(&mut inner, signo, wid);
            }
        }
    }
}

/// Park until the dispatcher leaves the suspended states
fn wait_for_resume<'a>(
    d: &'a Arc<Dispatch>,
    mut inner: MutexGuard<'a, Inner>,
    wid: WorkerId,
) -> MutexGuard<'a, Inner> {
    if let Some(w) = inner.workers.get_mut(wid.raw()) {
        w.is_suspended = true;
    }
    d.cond.notify_all();

    while inner.state.is_suspending_or_suspended() {
        let hotsigs = inner
            .workers
            .get(wid.raw())
            .map(|w| w.hotsigs)
            .unwrap_or(SigSet::EMPTY);
        drop(inner);
        let _ = vcpu_rt::sigtimedwait(hotsigs, 0, TimeSpec::INFINITY);
        inner = d.lock_inner();
    }

    if let Some(w) = inner.workers.get_mut(wid.raw()) {
        w.is_suspended = false;
    }
    inner
}

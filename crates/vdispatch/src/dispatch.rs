//! The dispatcher façade
//!
//! A dispatcher multiplexes submitted work items, timers and signal-monitor
//! handlers across a pool of workers, each bound to one vcpu. Every state
//! mutation happens under the dispatcher mutex; work closures run with the
//! mutex released.

use crate::attr::{ConcurrencyInfo, DispatchAttr};
use crate::item::{
    once_fn, once_val_fn, Item, ItemBody, ItemFlags, RetireFn, SubmitFlags, TerminateFlags,
};
use crate::signal::SigTrap;
use crate::timer::Timer;
use crate::tls;
use crate::worker::{Adoption, Worker};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use vdispatch_core::{
    kdebug, DispatchState, Error, ItemId, ItemState, ItemType, Qos, Result, SchedParams, SigSet,
    Slab, TimerId, VcpuGroupId, WorkerId, SIGDISP, SIGKILL,
};
use vdispatch_runtime::{self as vcpu_rt, SigScope};

/// Shared handle to a dispatcher
pub type DispatchRef = Arc<Dispatch>;

/// Retire hooks collected under the mutex, run after it is released
pub(crate) type Deferred = Vec<RetireFn>;

pub(crate) fn run_deferred(deferred: &mut Deferred) {
    for hook in deferred.drain(..) {
        hook();
    }
}

/// All mutable dispatcher state, guarded by `Dispatch::inner`
pub(crate) struct Inner {
    pub(crate) attr: DispatchAttr,
    pub(crate) groupid: VcpuGroupId,

    pub(crate) workers: Slab<Worker>,
    /// Worker ids in creation order; its length is the worker count
    pub(crate) worker_order: Vec<WorkerId>,

    pub(crate) items: Slab<Item>,
    pub(crate) timers: Slab<Timer>,

    /// Armed timers sorted by ascending deadline, FIFO on ties
    pub(crate) timer_queue: VecDeque<TimerId>,

    /// Retired awaitable items waiting to be joined
    pub(crate) zombie_items: Vec<ItemId>,

    pub(crate) conv_item_cache: Vec<ItemId>,
    pub(crate) conv_timer_cache: Vec<ItemId>,

    /// Per-signal monitor table, allocated on first registration
    pub(crate) sigtraps: Option<Vec<SigTrap>>,
    pub(crate) alloced_sigs: SigSet,

    pub(crate) state: DispatchState,
    pub(crate) suspension_count: usize,

    pub(crate) name: String,
}

impl Inner {
    pub(crate) fn worker_count(&self) -> usize {
        self.worker_order.len()
    }

    pub(crate) fn sched_params(&self) -> SchedParams {
        SchedParams {
            qos: self.attr.qos,
            priority: self.attr.priority,
        }
    }
}

/// A work-queue dispatcher
pub struct Dispatch {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) cond: Condvar,
    pub(crate) is_main: bool,

    /// Back-reference to the owning `Arc`, for handing worker vcpus their
    /// own handle
    self_ref: Weak<Dispatch>,
}

impl Dispatch {
    /// Create a dispatcher from `attr`, acquiring `min_concurrency` workers
    pub fn create(attr: &DispatchAttr) -> Result<DispatchRef> {
        Self::create_with_adoption(attr, Adoption::Acquire, false)
    }

    pub(crate) fn create_with_adoption(
        attr: &DispatchAttr,
        adoption: Adoption,
        is_main: bool,
    ) -> Result<DispatchRef> {
        attr.validate()?;

        let groupid = vcpu_rt::new_groupid();
        let mut alloced_sigs = SigSet::new();
        alloced_sigs.add(SIGDISP);
        alloced_sigs.add(SIGKILL);

        let d = Arc::new_cyclic(|self_ref| Dispatch {
            inner: Mutex::new(Inner {
                attr: attr.clone(),
                groupid,
                workers: Slab::new(),
                worker_order: Vec::new(),
                items: Slab::new(),
                timers: Slab::new(),
                timer_queue: VecDeque::new(),
                zombie_items: Vec::new(),
                conv_item_cache: Vec::new(),
                conv_timer_cache: Vec::new(),
                sigtraps: None,
                alloced_sigs,
                state: DispatchState::Active,
                suspension_count: 0,
                name: attr.bounded_name(),
            }),
            cond: Condvar::new(),
            is_main,
            self_ref: self_ref.clone(),
        });

        {
            let mut inner = d.lock_inner();
            for _ in 0..attr.min_concurrency {
                if let Err(e) = d.acquire_worker_with_adoption(&mut inner, adoption) {
                    // Let any worker that did come up exit cleanly.
                    inner.state = DispatchState::Terminating;
                    d.wakeup_all_workers(&inner);
                    return Err(e);
                }
            }
            kdebug!(
                "dispatcher '{}' up with {} worker(s), group {}",
                inner.name,
                inner.worker_count(),
                inner.groupid
            );
        }

        Ok(d)
    }

    /// Tear down a terminated dispatcher's remaining storage
    ///
    /// Fails with `Busy` unless the dispatcher is terminated and every
    /// awaitable item has been joined.
    pub fn destroy(&self) -> Result<()> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if inner.state < DispatchState::Terminated || !inner.zombie_items.is_empty() {
            return Err(Error::Busy);
        }

        inner.conv_item_cache.clear();
        inner.conv_timer_cache.clear();
        inner.sigtraps = None;
        inner.timer_queue.clear();
        inner.timers.clear();
        inner.items.clear();
        Ok(())
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The owning `Arc`; alive for as long as anyone can call us
    pub(crate) fn self_arc(&self) -> DispatchRef {
        self.self_ref
            .upgrade()
            .expect("dispatcher used after its last reference dropped")
    }

    /// Active check shared by every admitting entry point
    pub(crate) fn ensure_active(inner: &Inner) -> Result<()> {
        if inner.state.is_active() {
            Ok(())
        } else {
            Err(Error::Terminated)
        }
    }

    // ------------------------------------------------------------------
    // Workers

    pub(crate) fn acquire_worker(&self, inner: &mut Inner) -> Result<WorkerId> {
        self.acquire_worker_with_adoption(inner, Adoption::Acquire)
    }

    fn acquire_worker_with_adoption(&self, inner: &mut Inner, adoption: Adoption) -> Result<WorkerId> {
        let wid = crate::worker::create_worker(&self.self_arc(), inner, adoption)?;
        inner.worker_order.push(wid);
        Ok(wid)
    }

    pub(crate) fn wakeup_worker(&self, worker: &Worker) {
        let _ = vcpu_rt::sigsend(SigScope::Vcpu(worker.vcpu), SIGDISP);
    }

    pub(crate) fn wakeup_all_workers(&self, inner: &Inner) {
        for wid in &inner.worker_order {
            if let Some(worker) = inner.workers.get(wid.raw()) {
                self.wakeup_worker(worker);
            }
        }
    }

    // ------------------------------------------------------------------
    // Items

    /// Allocate a user item around `func`
    pub fn item_create<F>(&self, func: F) -> Result<ItemId>
    where
        F: FnMut() + Send + 'static,
    {
        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;
        let raw = inner.items.insert(Item::new_user(Box::new(func), None));
        Ok(ItemId::new(raw))
    }

    /// Allocate a user item with a retire hook that runs after each
    /// retirement (once the dispatcher mutex has been released)
    pub fn item_create_with_retire<F, R>(&self, func: F, retire: R) -> Result<ItemId>
    where
        F: FnMut() + Send + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;
        let raw = inner
            .items
            .insert(Item::new_user(Box::new(func), Some(Arc::new(retire))));
        Ok(ItemId::new(raw))
    }

    /// Release a user item. Fails with `Busy` while the item is scheduled,
    /// executing, or retired-awaitable but not yet joined.
    pub fn item_destroy(&self, item: ItemId) -> Result<()> {
        let mut inner = self.lock_inner();
        let rec = inner.items.get(item.raw()).ok_or(Error::Inval)?;
        if rec.state.is_live() || inner.zombie_items.contains(&item) {
            return Err(Error::Busy);
        }
        inner.items.remove(item.raw());
        Ok(())
    }

    /// Submit a user item for execution
    ///
    /// Flag bits outside the defined set are rejected with `Inval`.
    pub fn submit(&self, flags: SubmitFlags, item: ItemId) -> Result<()> {
        if SubmitFlags::from_bits(flags.bits()).is_none() {
            return Err(Error::Inval);
        }

        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;

        {
            let rec = inner.items.get_mut(item.raw()).ok_or(Error::Inval)?;
            if !rec.is_runnable() && !rec.state.is_live() {
                return Err(Error::Inval);
            }
            rec.ty = ItemType::UserItem;
            rec.subtype = 0;
            // The submit flags replace the whole flag byte; stale state from
            // an earlier run does not survive.
            rec.flags = if flags.contains(SubmitFlags::AWAITABLE) {
                ItemFlags::AWAITABLE
            } else {
                ItemFlags::empty()
            };
        }

        self.submit_locked(&mut inner, item)
    }

    /// The load-balanced admission shared by every submit path
    pub(crate) fn submit_locked(&self, inner: &mut Inner, item: ItemId) -> Result<()> {
        {
            let rec = inner.items.get(item.raw()).ok_or(Error::Inval)?;
            if rec.state.is_live() {
                return Err(Error::Busy);
            }
        }

        // Find the worker with the least amount of queued work
        let mut best: Option<(WorkerId, usize)> = None;
        for wid in &inner.worker_order {
            if let Some(worker) = inner.workers.get(wid.raw()) {
                if best.map_or(true, |(_, count)| worker.work_count < count) {
                    best = Some((*wid, worker.work_count));
                }
            }
        }

        // Need at least one worker; spawn another one when the best worker
        // is already backed up and the pool has headroom.
        let spill = best.map_or(false, |(_, count)| count > inner.attr.spill_threshold);
        if best.is_none() || (spill && inner.worker_count() < inner.attr.max_concurrency) {
            match self.acquire_worker(inner) {
                Ok(wid) => best = Some((wid, 0)),
                Err(e) => {
                    // Growing the pool is best-effort; only a poolless
                    // dispatcher propagates the failure.
                    if inner.worker_count() == 0 {
                        return Err(e);
                    }
                }
            }
        }

        let (wid, _) = best.ok_or(Error::NoMem)?;

        if let Some(rec) = inner.items.get_mut(item.raw()) {
            rec.state = ItemState::Scheduled;
            rec.flags.remove(ItemFlags::CANCELLED);
        }

        crate::worker::worker_submit(self, inner, wid, item, true);
        Ok(())
    }

    /// Retire `item`: pick its terminal state and route it to the zombie
    /// list, the cache, or its retire hook
    pub(crate) fn retire_item_locked(
        &self,
        inner: &mut Inner,
        item: ItemId,
        deferred: &mut Deferred,
    ) {
        let (flags, hook) = {
            let Some(rec) = inner.items.get_mut(item.raw()) else {
                return;
            };
            rec.state = if rec.flags.contains(ItemFlags::CANCELLED) {
                ItemState::Cancelled
            } else {
                ItemState::Finished
            };
            (rec.flags, rec.retire_hook())
        };

        if flags.contains(ItemFlags::AWAITABLE) {
            inner.zombie_items.push(item);
            self.cond.notify_all();
        } else if flags.contains(ItemFlags::CACHEABLE) {
            self.cache_item_locked(inner, item);
        } else if let Some(hook) = hook {
            deferred.push(hook);
        }
    }

    /// Wait for an awaitable item to retire, then unlink it from the zombie
    /// list so the submitter owns it again
    ///
    /// Surfaces `Interrupted` when the wait is broken by a panic inside the
    /// engine (the dispatcher mutex was poisoned); the item is left where
    /// it is in that case.
    pub fn await_item(&self, item: ItemId) -> Result<()> {
        let mut inner = self.lock_inner();
        loop {
            let state = inner.items.get(item.raw()).ok_or(Error::Inval)?.state;
            if state.is_done() {
                break;
            }
            inner = match self.cond.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => {
                    drop(poisoned.into_inner());
                    return Err(Error::Interrupted);
                }
            };
        }
        inner.zombie_items.retain(|z| *z != item);
        Ok(())
    }

    /// Fire-and-forget a closure on the dispatcher
    ///
    /// Returns the internal item handle, usable with [`Dispatch::cancel_item`]
    /// until the closure has retired.
    pub fn spawn<F>(&self, f: F) -> Result<ItemId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;

        let item = self.acquire_cached_conv_locked(&mut inner, ItemType::ConvItem);
        if let Some(rec) = inner.items.get_mut(item.raw()) {
            rec.flags = ItemFlags::CACHEABLE;
            rec.body = ItemBody::Conv {
                func: Some(once_fn(f)),
            };
        }

        match self.submit_locked(&mut inner, item) {
            Ok(()) => Ok(item),
            Err(e) => {
                self.cache_item_locked(&mut inner, item);
                Err(e)
            }
        }
    }

    /// Run a closure on the dispatcher and block for its integer result
    pub fn sync<F>(&self, f: F) -> Result<i32>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;

        let item = self.acquire_cached_conv_locked(&mut inner, ItemType::ConvItem);
        if let Some(rec) = inner.items.get_mut(item.raw()) {
            rec.flags = ItemFlags::CACHEABLE | ItemFlags::AWAITABLE;
            rec.body = ItemBody::ConvSync {
                func: Some(once_val_fn(f)),
                result: 0,
            };
        }

        let submitted = self.submit_locked(&mut inner, item);
        match submitted {
            Ok(()) => {
                loop {
                    let state = inner.items.get(item.raw()).ok_or(Error::Inval)?.state;
                    if state.is_done() {
                        break;
                    }
                    inner = match self.cond.wait(inner) {
                        Ok(guard) => guard,
                        Err(poisoned) => {
                            // The engine panicked while holding dispatcher
                            // state. The item may still be live, so it is
                            // not recycled here; its retirement path keeps
                            // owning it.
                            drop(poisoned.into_inner());
                            return Err(Error::Interrupted);
                        }
                    };
                }
                inner.zombie_items.retain(|z| *z != item);
                let value = match inner.items.get(item.raw()).map(|r| &r.body) {
                    Some(ItemBody::ConvSync { result, .. }) => *result,
                    _ => 0,
                };
                self.cache_item_locked(&mut inner, item);
                Ok(value)
            }
            Err(e) => {
                self.cache_item_locked(&mut inner, item);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation

    pub(crate) fn do_cancel_item(
        &self,
        inner: &mut Inner,
        item: ItemId,
        deferred: &mut Deferred,
    ) {
        let (state, ty) = {
            let Some(rec) = inner.items.get(item.raw()) else {
                return;
            };
            (rec.state, rec.ty)
        };
        let set_cancelled = |inner: &mut Inner| {
            if let Some(rec) = inner.items.get_mut(item.raw()) {
                rec.flags.insert(ItemFlags::CANCELLED);
            }
        };

        match state {
            ItemState::Scheduled => {
                set_cancelled(inner);
                match ty {
                    ItemType::UserItem | ItemType::ConvItem => {
                        self.withdraw_from_workers(inner, item, deferred);
                    }
                    ItemType::UserTimer | ItemType::ConvTimer => {
                        self.withdraw_timer_for_item(inner, item, deferred);
                    }
                    ItemType::UserSignalItem => {
                        // Fanned out onto a worker queue; pull it back.
                        if crate::worker::withdraw_from_any_worker(inner, item) {
                            self.retire_signal_item_locked(inner, item, deferred);
                        }
                    }
                }
            }
            ItemState::Executing => {
                // Cooperative: the closure polls the flag and retires as
                // cancelled.
                set_cancelled(inner);
            }
            ItemState::Idle if ty == ItemType::UserSignalItem => {
                // Armed on its monitor list.
                set_cancelled(inner);
                self.withdraw_signal_item_locked(inner, item, deferred);
            }
            _ => {}
        }
    }

    fn withdraw_from_workers(&self, inner: &mut Inner, item: ItemId, deferred: &mut Deferred) {
        if crate::worker::withdraw_from_any_worker(inner, item) {
            self.retire_item_locked(inner, item, deferred);
        }
    }

    /// Request cancellation of an item
    ///
    /// A scheduled item is withdrawn from whichever queue holds it and
    /// retired as cancelled. An executing item is only flagged; its closure
    /// decides when to give up.
    pub fn cancel_item(&self, item: ItemId) {
        let mut deferred = Deferred::new();
        {
            let mut inner = self.lock_inner();
            self.do_cancel_item(&mut inner, item, &mut deferred);
        }
        run_deferred(&mut deferred);
    }

    /// Did `item` retire as cancelled?
    pub fn item_cancelled(&self, item: ItemId) -> bool {
        let inner = self.lock_inner();
        inner
            .items
            .get(item.raw())
            .map(|r| r.state == ItemState::Cancelled)
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Suspension and termination

    /// Suspend the dispatcher; counted, so matched `resume` calls are
    /// required. Returns once every worker has parked.
    pub fn suspend(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        Self::ensure_active(&inner)?;

        inner.suspension_count += 1;
        if inner.suspension_count == 1 {
            if inner.state == DispatchState::Active {
                inner.state = DispatchState::Suspending;
            }
            // Kick sleeping workers so they observe the state change now
            // rather than at their next natural wakeup.
            self.wakeup_all_workers(&inner);

            loop {
                let all_parked = inner.worker_order.iter().all(|wid| {
                    inner
                        .workers
                        .get(wid.raw())
                        .map(|w| w.is_suspended)
                        .unwrap_or(true)
                });
                if all_parked {
                    inner.state = DispatchState::Suspended;
                    break;
                }
                inner = self
                    .cond
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        Ok(())
    }

    /// Undo one `suspend`; the last resume restarts the workers
    pub fn resume(&self) {
        let mut inner = self.lock_inner();
        if !inner.state.is_active() {
            return;
        }
        if inner.suspension_count > 0 {
            inner.suspension_count -= 1;
            if inner.suspension_count == 0 {
                inner.state = DispatchState::Active;
                self.wakeup_all_workers(&inner);
            }
        }
    }

    /// Move the dispatcher into terminating state
    ///
    /// Queued timers are always drained; queued work items are drained too
    /// when `CANCEL_ALL` is set, otherwise they still run. With `AWAIT_ALL`
    /// the call blocks until the dispatcher is terminated. Idempotent; the
    /// main dispatcher cannot be terminated. Flag bits outside the defined
    /// set are rejected with `Inval`.
    pub fn terminate(&self, flags: TerminateFlags) -> Result<()> {
        if TerminateFlags::from_bits(flags.bits()).is_none() {
            return Err(Error::Inval);
        }

        let mut deferred = Deferred::new();
        let mut transitioned = false;

        {
            let mut inner = self.lock_inner();
            if !self.is_main && inner.state < DispatchState::Terminating {
                inner.state = DispatchState::Terminating;
                transitioned = true;
                kdebug!("dispatcher '{}' terminating", inner.name);

                if flags.contains(TerminateFlags::CANCEL_ALL) {
                    let order: Vec<WorkerId> = inner.worker_order.clone();
                    for wid in order {
                        crate::worker::drain_worker(self, &mut inner, wid, &mut deferred);
                    }
                }
                // Timers are drained no matter what
                self.drain_timers_locked(&mut inner, &mut deferred);

                self.wakeup_all_workers(&inner);
            }
        }
        run_deferred(&mut deferred);

        if transitioned && flags.contains(TerminateFlags::AWAIT_ALL) {
            let _ = self.await_termination();
        }
        Ok(())
    }

    /// Wait for every worker to relinquish, then latch terminated state
    ///
    /// Only meaningful once `terminate` ran: any earlier state reports
    /// `NotFound`. Idempotent from terminated.
    pub fn await_termination(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        match inner.state {
            DispatchState::Active | DispatchState::Suspending | DispatchState::Suspended => {
                Err(Error::NotFound)
            }
            DispatchState::Terminating => {
                while inner.worker_count() > 0 {
                    inner = self
                        .cond
                        .wait(inner)
                        .unwrap_or_else(|e| e.into_inner());
                }
                inner.state = DispatchState::Terminated;
                Ok(())
            }
            DispatchState::Terminated => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Introspection and scheduling parameters

    /// Min/max/current worker counts
    pub fn concurrency_info(&self) -> ConcurrencyInfo {
        let inner = self.lock_inner();
        ConcurrencyInfo {
            minimum: inner.attr.min_concurrency,
            maximum: inner.attr.max_concurrency,
            current: inner.worker_count(),
        }
    }

    /// Copy the dispatcher name into `buf`, returning the copied length.
    /// `Inval` for an empty buffer, `Range` when it cannot hold the name.
    pub fn copy_name(&self, buf: &mut [u8]) -> Result<usize> {
        let inner = self.lock_inner();
        let name = inner.name.as_bytes();
        if buf.is_empty() {
            return Err(Error::Inval);
        }
        if buf.len() < name.len() {
            return Err(Error::Range);
        }
        buf[..name.len()].copy_from_slice(name);
        Ok(name.len())
    }

    pub fn priority(&self) -> i8 {
        self.lock_inner().attr.priority
    }

    pub fn qos(&self) -> Qos {
        self.lock_inner().attr.qos
    }

    fn apply_sched_params(&self, inner: &mut Inner, qos: Qos, priority: i8) {
        inner.attr.qos = qos;
        inner.attr.priority = priority;
        let params = inner.sched_params();
        for wid in &inner.worker_order {
            if let Some(worker) = inner.workers.get(wid.raw()) {
                vcpu_rt::set_sched_params(worker.vcpu, params);
            }
        }
    }

    /// Update the priority of every worker vcpu
    pub fn set_priority(&self, priority: i8) -> Result<()> {
        if !(vdispatch_core::PRI_LOWEST..=vdispatch_core::PRI_HIGHEST).contains(&priority) {
            return Err(Error::Inval);
        }
        let mut inner = self.lock_inner();
        let qos = inner.attr.qos;
        self.apply_sched_params(&mut inner, qos, priority);
        Ok(())
    }

    /// Update the QoS class of every worker vcpu
    pub fn set_qos(&self, qos: Qos) -> Result<()> {
        let mut inner = self.lock_inner();
        let priority = inner.attr.priority;
        self.apply_sched_params(&mut inner, qos, priority);
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Current-worker context

/// The dispatcher the calling closure runs on, or `None` outside a worker
pub fn current_queue() -> Option<DispatchRef> {
    tls::current().map(|(d, _)| d)
}

/// The item the calling closure runs as, or `None` outside a worker
pub fn current_item() -> Option<ItemId> {
    let (d, wid) = tls::current()?;
    let inner = d.lock_inner();
    inner.workers.get(wid.raw()).and_then(|w| w.current_item)
}

/// Cancel the item the calling closure runs as
pub fn cancel_current_item() {
    if let Some((d, wid)) = tls::current() {
        let item = {
            let inner = d.lock_inner();
            inner.workers.get(wid.raw()).and_then(|w| w.current_item)
        };
        if let Some(item) = item {
            d.cancel_item(item);
        }
    }
}

/// Cancellation poll for running closures: has the current item been asked
/// to stop?
pub fn current_item_cancelled() -> bool {
    let Some((d, wid)) = tls::current() else {
        return false;
    };
    let inner = d.lock_inner();
    let Some(item) = inner.workers.get(wid.raw()).and_then(|w| w.current_item) else {
        return false;
    };
    inner
        .items
        .get(item.raw())
        .map(|r| r.flags.contains(ItemFlags::CANCELLED))
        .unwrap_or(false)
}

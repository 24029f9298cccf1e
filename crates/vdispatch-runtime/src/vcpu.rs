//! Virtual processors
//!
//! A vcpu is the execution context a worker runs on: here, an OS thread plus
//! a registry record carrying its group membership, its pending-signal state
//! and its scheduling parameters. Acquired vcpus own their thread; adopted
//! vcpus wrap a thread the caller already owns (the process main thread for
//! the main dispatcher).
//!
//! All registry state lives under one process-wide mutex; per-vcpu condvars
//! wait on that mutex. This keeps vcpu-scoped and group-scoped signal
//! delivery race-free without any lock ordering concerns.

use crate::platform;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use vdispatch_core::{Error, Result, SchedParams, SigSet, VcpuGroupId, VcpuId};

/// Parameters for [`acquire`]
pub struct AcquireParams {
    /// Entry function of the new vcpu
    pub func: Box<dyn FnOnce() + Send + 'static>,

    /// Stack size in bytes; 0 means the platform default
    pub stack_size: usize,

    /// Group the vcpu joins; allocate with [`new_groupid`]
    pub groupid: VcpuGroupId,

    /// Initial scheduling parameters
    pub sched: SchedParams,

    /// Start suspended; released by [`resume`]
    pub suspended: bool,
}

pub(crate) struct VcpuRec {
    pub(crate) groupid: VcpuGroupId,
    pub(crate) pending: SigSet,
    /// Non-empty exactly while the vcpu is blocked in `sigtimedwait`
    pub(crate) wait_mask: SigSet,
    pub(crate) cond: Arc<Condvar>,
    pub(crate) started: bool,
    pub(crate) sched: SchedParams,
    pub(crate) native: Option<platform::NativeThreadId>,
}

pub(crate) struct GroupRec {
    pub(crate) members: Vec<VcpuId>,
    /// Group-scoped signals no member was ready to consume at send time
    pub(crate) pending: SigSet,
}

pub(crate) struct Registry {
    pub(crate) vcpus: HashMap<u32, VcpuRec>,
    pub(crate) groups: HashMap<u32, GroupRec>,
    pub(crate) main: Option<VcpuId>,
    next_vcpu: u32,
    next_group: u32,
}

impl Registry {
    fn new() -> Self {
        Registry {
            vcpus: HashMap::new(),
            groups: HashMap::new(),
            main: None,
            next_vcpu: 1,
            next_group: 1,
        }
    }
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

/// Lock the global registry, tolerating poisoning: registry state is always
/// left consistent between mutations, so a panicking vcpu does not corrupt
/// it.
pub(crate) fn lock_registry() -> MutexGuard<'static, Registry> {
    REGISTRY
        .get_or_init(|| Mutex::new(Registry::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

thread_local! {
    static SELF_ID: Cell<u32> = const { Cell::new(u32::MAX) };
}

/// Allocate a fresh vcpu group id
pub fn new_groupid() -> VcpuGroupId {
    let mut reg = lock_registry();
    let id = reg.next_group;
    reg.next_group += 1;
    reg.groups.insert(
        id,
        GroupRec {
            members: Vec::new(),
            pending: SigSet::EMPTY,
        },
    );
    VcpuGroupId::new(id)
}

fn register_locked(reg: &mut Registry, groupid: VcpuGroupId, sched: SchedParams, started: bool) -> VcpuId {
    let raw = reg.next_vcpu;
    reg.next_vcpu += 1;
    reg.vcpus.insert(
        raw,
        VcpuRec {
            groupid,
            pending: SigSet::EMPTY,
            wait_mask: SigSet::EMPTY,
            cond: Arc::new(Condvar::new()),
            started,
            sched,
            native: None,
        },
    );
    reg.groups
        .entry(groupid.raw())
        .or_insert_with(|| GroupRec {
            members: Vec::new(),
            pending: SigSet::EMPTY,
        })
        .members
        .push(VcpuId::new(raw));
    VcpuId::new(raw)
}

fn unregister(id: VcpuId) {
    let mut reg = lock_registry();
    if let Some(rec) = reg.vcpus.remove(&id.raw()) {
        if let Some(group) = reg.groups.get_mut(&rec.groupid.raw()) {
            group.members.retain(|m| *m != id);
        }
    }
}

/// Spawn a new vcpu
///
/// The entry function runs once the vcpu has been resumed (immediately when
/// `suspended` is false). Returns `NoMem` when the underlying thread cannot
/// be created.
pub fn acquire(params: AcquireParams) -> Result<VcpuId> {
    let AcquireParams {
        func,
        stack_size,
        groupid,
        sched,
        suspended,
    } = params;

    let id = {
        let mut reg = lock_registry();
        register_locked(&mut reg, groupid, sched, !suspended)
    };

    let mut builder = std::thread::Builder::new().name(format!("vcpu-{}", id.raw()));
    if stack_size > 0 {
        builder = builder.stack_size(stack_size);
    }

    let spawned = builder.spawn(move || {
        SELF_ID.with(|c| c.set(id.raw()));
        let tid = platform::current_thread_id();
        {
            let mut reg = lock_registry();
            if let Some(rec) = reg.vcpus.get_mut(&id.raw()) {
                rec.native = Some(tid);
                platform::apply_priority(tid, rec.sched.effective_priority());
            }
        }
        wait_until_started(id);
        func();
        unregister(id);
    });

    if spawned.is_err() {
        unregister(id);
        return Err(Error::NoMem);
    }

    Ok(id)
}

fn wait_until_started(id: VcpuId) {
    let mut reg = lock_registry();
    loop {
        let Some(rec) = reg.vcpus.get(&id.raw()) else {
            return;
        };
        if rec.started {
            return;
        }
        let cond = rec.cond.clone();
        reg = cond.wait(reg).unwrap_or_else(|e| e.into_inner());
    }
}

/// Start a vcpu that was acquired suspended
pub fn resume(id: VcpuId) {
    let mut reg = lock_registry();
    if let Some(rec) = reg.vcpus.get_mut(&id.raw()) {
        if !rec.started {
            rec.started = true;
            rec.cond.notify_all();
        }
    }
}

/// Retire the calling vcpu's registration. An acquired vcpu calls this as
/// the last thing before its entry function returns and the thread exits;
/// adopted vcpus are not unregistered by the dispatcher.
pub fn relinquish_self() {
    if let Some(id) = current() {
        unregister(id);
        SELF_ID.with(|c| c.set(u32::MAX));
    }
}

/// The calling thread's vcpu id, if it is one
pub fn current() -> Option<VcpuId> {
    let raw = SELF_ID.with(|c| c.get());
    if raw == u32::MAX {
        None
    } else {
        Some(VcpuId::new(raw))
    }
}

/// Register the calling thread as a vcpu in `groupid` without spawning.
/// Idempotent for a thread that is already a vcpu.
pub fn adopt_current(groupid: VcpuGroupId, sched: SchedParams) -> VcpuId {
    if let Some(id) = current() {
        return id;
    }
    let id = {
        let mut reg = lock_registry();
        register_locked(&mut reg, groupid, sched, true)
    };
    SELF_ID.with(|c| c.set(id.raw()));
    let tid = platform::current_thread_id();
    let mut reg = lock_registry();
    if let Some(rec) = reg.vcpus.get_mut(&id.raw()) {
        rec.native = Some(tid);
    }
    id
}

/// Adopt the calling thread and record it as the process main vcpu. The
/// first caller wins; later calls return the recorded main vcpu.
pub fn adopt_main(groupid: VcpuGroupId, sched: SchedParams) -> VcpuId {
    {
        let reg = lock_registry();
        if let Some(main) = reg.main {
            return main;
        }
    }
    let id = adopt_current(groupid, sched);
    lock_registry().main = Some(id);
    id
}

/// The process main vcpu, once adopted
pub fn main_vcpu() -> Option<VcpuId> {
    lock_registry().main
}

/// The group a vcpu belongs to
pub fn groupid_of(id: VcpuId) -> Option<VcpuGroupId> {
    lock_registry().vcpus.get(&id.raw()).map(|r| r.groupid)
}

/// Push new scheduling parameters to a vcpu
pub fn set_sched_params(id: VcpuId, sched: SchedParams) {
    let mut reg = lock_registry();
    if let Some(rec) = reg.vcpus.get_mut(&id.raw()) {
        rec.sched = sched;
        if let Some(tid) = rec.native {
            platform::apply_priority(tid, sched.effective_priority());
        }
    }
}

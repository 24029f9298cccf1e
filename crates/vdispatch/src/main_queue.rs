//! The main dispatcher singleton
//!
//! `main_queue` lazily builds a serial interactive dispatcher that adopts
//! the calling thread's vcpu instead of spawning one; the first caller's
//! thread becomes the process main vcpu. `run_main_queue` then turns that
//! thread into the dispatcher's worker and never returns.
//!
//! The singleton is guarded by a spinlock, not the dispatcher mutex:
//! contention is essentially nil once the dispatcher exists, and the
//! dispatcher's own lock cannot guard its own allocation.

use crate::attr::DispatchAttr;
use crate::dispatch::{Dispatch, DispatchRef};
use crate::worker::{worker_run, Adoption};
use vdispatch_core::SpinLock;
use vdispatch_runtime as vcpu_rt;

static MAIN_QUEUE: SpinLock<Option<DispatchRef>> = SpinLock::new(None);

/// The process main dispatcher: serial, interactive, bound to the main vcpu
pub fn main_queue() -> DispatchRef {
    let mut slot = MAIN_QUEUE.lock();
    if let Some(d) = &*slot {
        return d.clone();
    }

    let attr = DispatchAttr::serial_interactive().name("main");
    let d = Dispatch::create_with_adoption(&attr, Adoption::AdoptMain, true)
        .expect("failed to set up the main dispatcher");
    *slot = Some(d.clone());
    d
}

/// Enter the main dispatcher's worker loop on the main vcpu
///
/// The main dispatcher cannot terminate, so this call never returns.
pub fn run_main_queue() -> ! {
    let d = main_queue();

    let current = vcpu_rt::current();
    assert!(
        current.is_some() && current == vcpu_rt::main_vcpu(),
        "run_main_queue must be called on the main vcpu"
    );

    let wid = {
        let inner = d.lock_inner();
        inner
            .worker_order
            .first()
            .copied()
            .expect("main dispatcher lost its worker")
    };

    worker_run(d, wid);
    unreachable!("the main dispatcher's worker relinquished");
}

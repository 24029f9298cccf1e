//! Current-worker thread-local
//!
//! The vcpu-specific slot: each worker thread records which dispatcher and
//! worker it is running as, so `current_queue`, `current_item` and the
//! cancellation polls can find their context without any argument.

use crate::dispatch::{Dispatch, DispatchRef};
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use vdispatch_core::WorkerId;

struct CurrentWorker {
    dispatch: Weak<Dispatch>,
    worker: WorkerId,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentWorker>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(dispatch: &DispatchRef, worker: WorkerId) {
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(CurrentWorker {
            dispatch: Arc::downgrade(dispatch),
            worker,
        });
    });
}

pub(crate) fn clear_current() {
    CURRENT.with(|c| {
        *c.borrow_mut() = None;
    });
}

/// The dispatcher and worker the calling thread runs for, if any
pub(crate) fn current() -> Option<(DispatchRef, WorkerId)> {
    CURRENT.with(|c| {
        let borrow = c.borrow();
        let cw = borrow.as_ref()?;
        Some((cw.dispatch.upgrade()?, cw.worker))
    })
}

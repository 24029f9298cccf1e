//! # vdispatch-core
//!
//! Platform-agnostic types shared by the vdispatch work-queue engine:
//! monotonic time values, the error taxonomy, signal sets, state machines,
//! id newtypes, slab storage, an internal spinlock, and log/env utilities.
//!
//! All platform-touching code (threads, timed waits, scheduling parameters)
//! lives in `vdispatch-runtime`.

pub mod clock;
pub mod env;
pub mod error;
pub mod id;
pub mod klog;
pub mod sig;
pub mod slab;
pub mod spinlock;
pub mod state;

// Re-exports for convenience
pub use clock::{now, TimeSpec};
pub use error::{Error, Result};
pub use id::{ItemId, TimerId, VcpuGroupId, VcpuId, WorkerId};
pub use sig::{SigSet, SIGDISP, SIGKILL, SIGMAX, SIGMIN};
pub use slab::Slab;
pub use spinlock::SpinLock;
pub use state::{DispatchState, ItemState, ItemType, Qos, SchedParams};
pub use state::{PRI_COUNT, PRI_HIGHEST, PRI_LOWEST};

//! # vdispatch-runtime
//!
//! The virtual-processor primitive underneath the vdispatch engine:
//!
//! - vcpu acquire/resume/relinquish on top of OS threads, with adoption
//!   modes for threads the caller already owns
//! - vcpu groups and group-scoped signal delivery
//! - the signal-gated timed wait workers block in
//! - scheduling-parameter bookkeeping with best-effort platform application

pub mod platform;
pub mod vcpu;
pub mod waitq;

pub use vcpu::{AcquireParams, adopt_current, adopt_main, current, main_vcpu};
pub use vcpu::{acquire, groupid_of, new_groupid, relinquish_self, resume, set_sched_params};
pub use waitq::{sigsend, sigtimedwait, SigScope, TIMER_ABSTIME};

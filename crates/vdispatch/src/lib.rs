//! # vdispatch
//!
//! A cooperative multi-worker dispatcher: user- and kernel-submitted work
//! items, deadline timers and signal-triggered handlers multiplexed across
//! a pool of virtual processors.
//!
//! ## Quick start
//!
//! ```ignore
//! use vdispatch::{Dispatch, DispatchAttr, Qos, TimeSpec, TimerFlags};
//!
//! let q = Dispatch::create(&DispatchAttr::concurrent(1, 4).qos(Qos::Utility))?;
//!
//! // Fire and forget
//! q.spawn(|| println!("hello from a worker"))?;
//!
//! // Synchronous call with a result
//! let n = q.sync(|| 6 * 7)?;
//! assert_eq!(n, 42);
//!
//! // Run in 50ms
//! q.after(TimerFlags::empty(), TimeSpec::from_millis(50), || {
//!     println!("later");
//! })?;
//!
//! q.terminate(vdispatch::TerminateFlags::AWAIT_ALL)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! submit / spawn / sync          timer / after / repeating     signal_monitor
//!         │                                │                         │
//!         ▼                                ▼                         ▼
//!   worker queues  ◄─────────────   timer queue              sigtrap table
//!   (per worker, FIFO)              (deadline-sorted)        (per signal)
//!         │                                │                         │
//!         └───────────────┬────────────────┴─────────────────────────┘
//!                         ▼
//!                  worker loop (one vcpu each)
//!          next_work → execute (mutex dropped) → retire
//! ```
//!
//! Every dispatcher-state mutation happens under one mutex per dispatcher;
//! closures run with it released. Cancellation is cooperative: a scheduled
//! item is withdrawn, an executing one is only flagged and polls
//! [`current_item_cancelled`].

mod attr;
mod cache;
mod dispatch;
mod item;
mod main_queue;
mod signal;
mod timer;
mod tls;
mod worker;

pub use attr::{ConcurrencyInfo, DispatchAttr, MAX_CONCURRENCY_LIMIT, MAX_NAME_LENGTH};
pub use dispatch::{
    cancel_current_item, current_item, current_item_cancelled, current_queue, Dispatch,
    DispatchRef,
};
pub use item::{SubmitFlags, TerminateFlags, TimerFlags};
pub use main_queue::{main_queue, run_main_queue};

// Core types callers need alongside the API
pub use vdispatch_core::{
    now, Error, ItemId, ItemState, Qos, Result, TimeSpec, PRI_HIGHEST, PRI_LOWEST, SIGMAX, SIGMIN,
};

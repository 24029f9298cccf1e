//! Signal delivery and the signal-gated timed wait
//!
//! Signals are delivered either to one vcpu or to a vcpu group. A group
//! delivery goes to a member that is currently blocked waiting for that
//! signal; with no such member it parks on the group's pending set and the
//! next matching waiter consumes it. Either way a single delivery is
//! consumed exactly once.
//!
//! `sigsend` never blocks and takes no dispatcher locks, so it is safe to
//! call from anywhere, including wakeup paths that interrupt a worker.

use crate::vcpu::{self, lock_registry};
use std::time::Instant;
use vdispatch_core::{clock, Error, Result, SigSet, TimeSpec, VcpuGroupId, VcpuId};

/// `sigtimedwait` flag: the deadline is an absolute monotonic time
pub const TIMER_ABSTIME: u32 = 0x1;

/// Delivery scope for [`sigsend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigScope {
    Vcpu(VcpuId),
    Group(VcpuGroupId),
}

/// Deliver `signo` to a vcpu or a vcpu group
pub fn sigsend(scope: SigScope, signo: i32) -> Result<()> {
    if !SigSet::is_valid_signo(signo) {
        return Err(Error::Inval);
    }

    let mut reg = lock_registry();
    match scope {
        SigScope::Vcpu(id) => {
            let rec = reg.vcpus.get_mut(&id.raw()).ok_or(Error::NotFound)?;
            rec.pending.add(signo);
            if rec.wait_mask.contains(signo) {
                rec.cond.notify_all();
            }
            Ok(())
        }
        SigScope::Group(gid) => {
            let members = {
                let group = reg.groups.get(&gid.raw()).ok_or(Error::NotFound)?;
                group.members.clone()
            };

            for m in members {
                if let Some(rec) = reg.vcpus.get_mut(&m.raw()) {
                    if rec.wait_mask.contains(signo) {
                        rec.pending.add(signo);
                        rec.cond.notify_all();
                        return Ok(());
                    }
                }
            }

            // Nobody is ready for it right now; the next waiter whose mask
            // matches will pick it up from the group's pending set.
            if let Some(group) = reg.groups.get_mut(&gid.raw()) {
                group.pending.add(signo);
            }
            Ok(())
        }
    }
}

/// Block the calling vcpu until a signal in `mask` arrives or `deadline`
/// passes
///
/// The deadline is absolute monotonic time when `flags` carries
/// [`TIMER_ABSTIME`], otherwise relative to now; `TimeSpec::INFINITY` waits
/// forever. Returns the consumed signal number, or `TimedOut`.
///
/// The caller must not hold any dispatcher lock across this call.
pub fn sigtimedwait(mask: SigSet, flags: u32, deadline: TimeSpec) -> Result<i32> {
    let id = vcpu::current().ok_or(Error::Inval)?;

    let wakeup: Option<Instant> = if deadline == TimeSpec::INFINITY {
        None
    } else if flags & TIMER_ABSTIME != 0 {
        deadline
            .to_duration()
            .map(|d| clock::clock_epoch() + d)
    } else {
        deadline.to_duration().map(|d| Instant::now() + d)
    };

    let mut reg = lock_registry();
    loop {
        // Consume from the vcpu's own pending set first, then from its
        // group's.
        let (gid, cond) = {
            let rec = reg.vcpus.get_mut(&id.raw()).ok_or(Error::NotFound)?;
            if let Some(signo) = rec.pending.and(mask).first() {
                rec.pending.del(signo);
                return Ok(signo);
            }
            (rec.groupid, rec.cond.clone())
        };
        if let Some(group) = reg.groups.get_mut(&gid.raw()) {
            if let Some(signo) = group.pending.and(mask).first() {
                group.pending.del(signo);
                return Ok(signo);
            }
        }

        let remaining = match wakeup {
            None => None,
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    return Err(Error::TimedOut);
                }
                Some(at - now)
            }
        };

        if let Some(rec) = reg.vcpus.get_mut(&id.raw()) {
            rec.wait_mask = mask;
        }
        reg = match remaining {
            None => cond.wait(reg).unwrap_or_else(|e| e.into_inner()),
            Some(d) => {
                cond.wait_timeout(reg, d)
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
        };
        if let Some(rec) = reg.vcpus.get_mut(&id.raw()) {
            rec.wait_mask = SigSet::EMPTY;
        }
    }
}

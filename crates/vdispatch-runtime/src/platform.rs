//! Platform-specific scraps
//!
//! Native thread ids and best-effort application of scheduling parameters.
//! Everything here degrades to bookkeeping-only on platforms we don't know.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Kernel task id of a thread
        pub type NativeThreadId = i64;

        /// Task id of the calling thread
        pub fn current_thread_id() -> NativeThreadId {
            // Safety: gettid has no failure modes
            unsafe { libc::syscall(libc::SYS_gettid) as NativeThreadId }
        }

        /// Map the flattened vcpu priority onto a nice value and apply it.
        /// Raising priority needs privileges; failures are expected and
        /// ignored.
        pub fn apply_priority(tid: NativeThreadId, effective_priority: i32) {
            let nice = (19 - effective_priority / 2).clamp(-20, 19);
            // Safety: plain syscall on a thread id we own
            let rc = unsafe {
                libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice)
            };
            if rc != 0 {
                vdispatch_core::ktrace!(
                    "setpriority(tid={}, nice={}) failed; keeping inherited priority",
                    tid,
                    nice
                );
            }
        }
    } else if #[cfg(unix)] {
        pub type NativeThreadId = u64;

        pub fn current_thread_id() -> NativeThreadId {
            // Safety: pthread_self has no failure modes
            unsafe { libc::pthread_self() as NativeThreadId }
        }

        pub fn apply_priority(_tid: NativeThreadId, _effective_priority: i32) {}
    } else {
        pub type NativeThreadId = u64;

        pub fn current_thread_id() -> NativeThreadId {
            0
        }

        pub fn apply_priority(_tid: NativeThreadId, _effective_priority: i32) {}
    }
}

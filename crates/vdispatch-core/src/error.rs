//! Error taxonomy for dispatcher operations

use core::fmt;

/// Result type for dispatcher operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that dispatcher operations can return
///
/// These mirror the classic errno-style codes the dispatcher hands across
/// the kernel/user boundary. Operations never abort on contract violations
/// that a caller can trigger; they return one of these instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Memory or resource allocation failed
    NoMem,

    /// Invalid argument (bad attribute, unknown flag bit, bad signal number)
    Inval,

    /// Object is busy (item already scheduled/executing, dispatcher not
    /// yet terminated, signal already allocated)
    Busy,

    /// A blocking wait was interrupted
    Interrupted,

    /// A timed wait reached its deadline
    TimedOut,

    /// The dispatcher is terminating or terminated and admits no new work
    Terminated,

    /// No such thing: the dispatcher is not in a state where the request
    /// makes sense (eg awaiting termination of a live dispatcher)
    NotFound,

    /// A caller-provided buffer is too small
    Range,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMem => write!(f, "out of memory"),
            Error::Inval => write!(f, "invalid argument"),
            Error::Busy => write!(f, "resource busy"),
            Error::Interrupted => write!(f, "interrupted"),
            Error::TimedOut => write!(f, "timed out"),
            Error::Terminated => write!(f, "dispatcher terminated"),
            Error::NotFound => write!(f, "no such object"),
            Error::Range => write!(f, "result out of range"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::Busy), "resource busy");
        assert_eq!(format!("{}", Error::Terminated), "dispatcher terminated");
    }

    #[test]
    fn test_error_eq() {
        let r: Result<()> = Err(Error::TimedOut);
        assert!(matches!(r, Err(Error::TimedOut)));
    }
}

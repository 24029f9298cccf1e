//! Identifier newtypes
//!
//! Items, timers, workers and vcpus are addressed by small-integer ids into
//! slab storage instead of pointers. `u32::MAX` is the shared "none"
//! sentinel.

use core::fmt;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Sentinel for "no id"
            pub const NONE: $name = $name(u32::MAX);

            #[inline]
            pub const fn new(raw: u32) -> Self {
                $name(raw)
            }

            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }

            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub const fn is_none(self) -> bool {
                self.0 == u32::MAX
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, concat!(stringify!($name), "(NONE)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

define_id!(
    /// Handle to a work item in a dispatcher's item arena
    ItemId
);

define_id!(
    /// Handle to an armed timer in a dispatcher's timer arena
    TimerId
);

define_id!(
    /// Handle to a worker in a dispatcher's worker arena
    WorkerId
);

define_id!(
    /// Process-wide id of a virtual processor
    VcpuId
);

define_id!(
    /// Process-wide id of a vcpu group
    VcpuGroupId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_sentinel() {
        assert!(ItemId::NONE.is_none());
        assert!(!ItemId::new(0).is_none());
        assert_eq!(WorkerId::new(7).raw(), 7);
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", TimerId::new(3)), "TimerId(3)");
        assert_eq!(format!("{:?}", TimerId::NONE), "TimerId(NONE)");
    }
}

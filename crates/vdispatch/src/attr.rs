//! Dispatcher attributes

use vdispatch_core::{Error, Qos, Result, PRI_HIGHEST, PRI_LOWEST};

/// Longest dispatcher name kept verbatim; longer names are truncated
pub const MAX_NAME_LENGTH: usize = 31;

/// Widest worker pool a dispatcher may be configured with
pub const MAX_CONCURRENCY_LIMIT: usize = i8::MAX as usize;

/// Creation attributes for a dispatcher
///
/// Built with the defaults and adjusted through the builder methods:
///
/// ```ignore
/// let attr = DispatchAttr::concurrent(1, 4)
///     .qos(Qos::Utility)
///     .name("io");
/// let queue = Dispatch::create(&attr)?;
/// ```
#[derive(Debug, Clone)]
pub struct DispatchAttr {
    /// Workers kept alive even when idle; at least 1
    pub min_concurrency: usize,

    /// Upper bound on the worker pool
    pub max_concurrency: usize,

    /// Quality-of-service class applied to every worker vcpu
    pub qos: Qos,

    /// Priority within the QoS class
    pub priority: i8,

    /// Dispatcher name, truncated to [`MAX_NAME_LENGTH`]
    pub name: String,

    /// Queue depth on the least-loaded worker beyond which submission
    /// spawns another worker (when below `max_concurrency`)
    pub spill_threshold: usize,
}

impl Default for DispatchAttr {
    fn default() -> Self {
        DispatchAttr {
            min_concurrency: 1,
            max_concurrency: 1,
            qos: Qos::default(),
            priority: 0,
            name: String::new(),
            spill_threshold: 4,
        }
    }
}

impl DispatchAttr {
    /// A serial dispatcher (one worker)
    pub fn serial(qos: Qos, priority: i8) -> Self {
        DispatchAttr {
            qos,
            priority,
            ..Default::default()
        }
    }

    /// A serial interactive dispatcher; what the main queue uses
    pub fn serial_interactive() -> Self {
        DispatchAttr::serial(Qos::Interactive, 0)
    }

    /// A concurrent dispatcher with the given worker bounds
    pub fn concurrent(min_concurrency: usize, max_concurrency: usize) -> Self {
        DispatchAttr {
            min_concurrency,
            max_concurrency,
            ..Default::default()
        }
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn spill_threshold(mut self, threshold: usize) -> Self {
        self.spill_threshold = threshold;
        self
    }

    /// Check the attribute ranges; called by `Dispatch::create` before any
    /// state is touched
    pub fn validate(&self) -> Result<()> {
        if self.min_concurrency < 1
            || self.max_concurrency < 1
            || self.max_concurrency > MAX_CONCURRENCY_LIMIT
            || self.min_concurrency > self.max_concurrency
        {
            return Err(Error::Inval);
        }
        if self.priority < PRI_LOWEST || self.priority > PRI_HIGHEST {
            return Err(Error::Inval);
        }
        if self.spill_threshold == 0 {
            return Err(Error::Inval);
        }
        Ok(())
    }

    /// The name as stored: truncated to the length bound, kept on a char
    /// boundary
    pub(crate) fn bounded_name(&self) -> String {
        let mut name = self.name.clone();
        if name.len() > MAX_NAME_LENGTH {
            let mut end = MAX_NAME_LENGTH;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name.truncate(end);
        }
        name
    }
}

/// Snapshot of a dispatcher's worker-pool bounds and current size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyInfo {
    pub minimum: usize,
    pub maximum: usize,
    pub current: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(DispatchAttr::default().validate().is_ok());
    }

    #[test]
    fn test_zero_min_rejected() {
        let mut attr = DispatchAttr::default();
        attr.min_concurrency = 0;
        assert_eq!(attr.validate(), Err(Error::Inval));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let attr = DispatchAttr::concurrent(4, 2);
        assert_eq!(attr.validate(), Err(Error::Inval));
    }

    #[test]
    fn test_priority_range() {
        let attr = DispatchAttr::default().priority(PRI_HIGHEST);
        assert!(attr.validate().is_ok());
        let mut attr = DispatchAttr::default();
        attr.priority = PRI_LOWEST - 1;
        assert_eq!(attr.validate(), Err(Error::Inval));
    }

    #[test]
    fn test_name_truncation() {
        let long = "x".repeat(64);
        let attr = DispatchAttr::default().name(&long);
        assert_eq!(attr.bounded_name().len(), MAX_NAME_LENGTH);
    }
}

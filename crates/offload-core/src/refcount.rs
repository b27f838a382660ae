//! Tagged reference counts for mapping records
//!
//! Records are either held by a finite number of synchronous consumers or
//! are permanent (offload image exports, explicit associations) and never
//! subject to refcount-driven release. The tagged representation replaces
//! the magic "infinity" constant: arithmetic is only defined on `Finite`.

use std::fmt;

/// Synchronous reference count of a mapping record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCount {
    /// Held by `n` live synchronous consumers
    Finite(u32),
    /// Never released by refcounting
    Permanent,
}

impl RefCount {
    /// A single holder
    pub const ONE: RefCount = RefCount::Finite(1);

    /// Whether this record is permanent
    pub fn is_permanent(self) -> bool {
        matches!(self, RefCount::Permanent)
    }

    /// Current count, `None` for permanent records
    pub fn count(self) -> Option<u32> {
        match self {
            RefCount::Finite(n) => Some(n),
            RefCount::Permanent => None,
        }
    }

    /// Add one holder. No-op on permanent records.
    pub fn increment(&mut self) {
        if let RefCount::Finite(n) = self {
            *n += 1;
        }
    }

    /// Drop one holder. No-op on permanent records; finite counts saturate
    /// at zero (a zero count means the record is kept alive only by
    /// asynchronous holders).
    pub fn decrement(&mut self) {
        if let RefCount::Finite(n) = self {
            *n = n.saturating_sub(1);
        }
    }

    /// Whether exactly one synchronous holder remains
    pub fn is_last(self) -> bool {
        matches!(self, RefCount::Finite(1))
    }

    /// Whether no synchronous holder remains (never true for permanent)
    pub fn is_drained(self) -> bool {
        matches!(self, RefCount::Finite(0))
    }
}

impl fmt::Display for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefCount::Finite(n) => write!(f, "{n}"),
            RefCount::Permanent => write!(f, "inf"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_arithmetic() {
        let mut rc = RefCount::ONE;
        assert!(rc.is_last());
        rc.increment();
        assert_eq!(rc.count(), Some(2));
        rc.decrement();
        assert!(rc.is_last());
        rc.decrement();
        assert!(rc.is_drained());
        rc.decrement();
        assert!(rc.is_drained(), "saturates at zero");
    }

    #[test]
    fn test_permanent_ignores_arithmetic() {
        let mut rc = RefCount::Permanent;
        rc.increment();
        rc.decrement();
        assert!(rc.is_permanent());
        assert!(!rc.is_last());
        assert!(!rc.is_drained());
        assert_eq!(rc.count(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(RefCount::Finite(3).to_string(), "3");
        assert_eq!(RefCount::Permanent.to_string(), "inf");
    }
}

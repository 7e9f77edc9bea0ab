//! Versioned records and optimistic concurrency expectations.

/// A record whose stored revision is tracked for optimistic concurrency.
pub trait Versioned {
    /// Monotonically increasing revision, bumped by the store on every save.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a save.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stored record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

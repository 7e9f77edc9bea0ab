use std::sync::Arc;

use thiserror::Error;

use saksflyt_core::{CaseId, CaseRecord};

/// Case-record store operation error.
///
/// These are **infrastructure errors** (lookup, concurrency) as opposed to
/// lifecycle errors, which surface as [`saksflyt_core::TransitionError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaseStoreError {
    #[error("case {0} not found")]
    NotFound(CaseId),

    #[error("case {0} already exists")]
    AlreadyExists(CaseId),

    /// Optimistic concurrency check failed: someone saved the case in between.
    #[error("case {case_id}: expected version {expected}, found {actual}")]
    Conflict {
        case_id: CaseId,
        expected: u64,
        actual: u64,
    },

    #[error("case store unavailable: {0}")]
    Unavailable(String),
}

/// Durable store of case records.
///
/// The store is the source of truth for case status; envelopes only carry snapshots.
///
/// ## Save Semantics
///
/// `save()`:
/// - requires the record's version to equal the stored version (optimistic locking)
/// - increments the stored version and returns the saved record
/// - fails with `NotFound` for cases that were never created
///
/// Implementations must serialize saves of one case so that two concurrent writers
/// can never both succeed from the same version.
pub trait CaseStore: Send + Sync {
    fn get(&self, case_id: CaseId) -> Result<CaseRecord, CaseStoreError>;

    /// Insert a new record; its version must be 0.
    fn create(&self, record: CaseRecord) -> Result<CaseRecord, CaseStoreError>;

    fn save(&self, record: CaseRecord) -> Result<CaseRecord, CaseStoreError>;

    /// All records, ordered by case id.
    fn list(&self) -> Result<Vec<CaseRecord>, CaseStoreError>;
}

impl<S> CaseStore for Arc<S>
where
    S: CaseStore + ?Sized,
{
    fn get(&self, case_id: CaseId) -> Result<CaseRecord, CaseStoreError> {
        (**self).get(case_id)
    }

    fn create(&self, record: CaseRecord) -> Result<CaseRecord, CaseStoreError> {
        (**self).create(record)
    }

    fn save(&self, record: CaseRecord) -> Result<CaseRecord, CaseStoreError> {
        (**self).save(record)
    }

    fn list(&self) -> Result<Vec<CaseRecord>, CaseStoreError> {
        (**self).list()
    }
}

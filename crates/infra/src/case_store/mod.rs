//! Case-record store boundary and the single status writer.
//!
//! Case status only changes through [`advance_status`], which routes every
//! requested change through the lifecycle state machine.

pub mod in_memory;
pub mod r#trait;

use thiserror::Error;
use tracing::{debug, instrument};

use saksflyt_core::{CaseId, CaseRecord, CaseStatus, TransitionError, Versioned};

pub use in_memory::InMemoryCaseStore;
pub use r#trait::{CaseStore, CaseStoreError};

/// Optimistic-concurrency conflicts are re-read and re-applied this many times.
const MAX_CONFLICT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatusUpdateError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] CaseStoreError),
}

/// Move a case to `requested`, persisting the change.
///
/// Re-entering the current status is accepted without a write, so a redelivered
/// step can call this again safely. A concurrent save is retried against the fresh
/// record, which re-runs the legality check.
#[instrument(skip(store), fields(case_id = %case_id, requested = %requested), err)]
pub fn advance_status<S>(
    store: &S,
    case_id: CaseId,
    requested: CaseStatus,
) -> Result<CaseRecord, StatusUpdateError>
where
    S: CaseStore + ?Sized,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut record = store.get(case_id)?;
        let from = record.status();

        if !record.transition_to(requested)? {
            debug!(status = %from, "status unchanged");
            return Ok(record);
        }

        match store.save(record) {
            Ok(saved) => {
                debug!(from = %from, to = %saved.status(), version = saved.version(), "status advanced");
                return Ok(saved);
            }
            Err(CaseStoreError::Conflict { .. }) if attempt < MAX_CONFLICT_ATTEMPTS => {
                debug!(attempt, "status update conflicted, re-reading case");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use saksflyt_core::{CaseType, ProcessingMode, Versioned};

    use super::*;

    fn store_with(mode: ProcessingMode) -> (InMemoryCaseStore, CaseId) {
        let store = InMemoryCaseStore::new();
        let case = CaseRecord::new(CaseId::new(), CaseType::Omstillingsstoenad, mode);
        let id = case.id();
        store.create(case).unwrap();
        (store, id)
    }

    #[test]
    fn advances_and_persists() {
        let (store, id) = store_with(ProcessingMode::Automatic);
        let saved = advance_status(&store, id, CaseStatus::Beregnet).unwrap();
        assert_eq!(saved.status(), CaseStatus::Beregnet);
        assert_eq!(store.get(id).unwrap().version(), 1);
    }

    #[test]
    fn re_entry_does_not_write() {
        let (store, id) = store_with(ProcessingMode::Manual);
        advance_status(&store, id, CaseStatus::Vilkaarsvurdert).unwrap();
        let again = advance_status(&store, id, CaseStatus::Vilkaarsvurdert).unwrap();
        assert_eq!(again.version(), 1);
    }

    #[test]
    fn illegal_transition_leaves_the_record_alone() {
        let (store, id) = store_with(ProcessingMode::Manual);
        let err = advance_status(&store, id, CaseStatus::Iverksatt).unwrap_err();
        assert!(matches!(
            err,
            StatusUpdateError::Transition(TransitionError::IllegalState { .. })
        ));
        let record = store.get(id).unwrap();
        assert_eq!(record.status(), CaseStatus::Opprettet);
        assert_eq!(record.version(), 0);
    }

    #[test]
    fn unknown_case_is_a_store_error() {
        let store = InMemoryCaseStore::new();
        let id = CaseId::new();
        assert_eq!(
            advance_status(&store, id, CaseStatus::Vilkaarsvurdert),
            Err(StatusUpdateError::Store(CaseStoreError::NotFound(id)))
        );
    }

    /// Store whose first save always conflicts, as if another writer got there first.
    struct RacingStore {
        inner: InMemoryCaseStore,
        saves: AtomicU32,
    }

    impl CaseStore for RacingStore {
        fn get(&self, case_id: CaseId) -> Result<CaseRecord, CaseStoreError> {
            self.inner.get(case_id)
        }

        fn create(&self, record: CaseRecord) -> Result<CaseRecord, CaseStoreError> {
            self.inner.create(record)
        }

        fn save(&self, record: CaseRecord) -> Result<CaseRecord, CaseStoreError> {
            if self.saves.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut other = self.inner.get(record.id())?;
                other
                    .transition_to(CaseStatus::Vilkaarsvurdert)
                    .map_err(|e| CaseStoreError::Unavailable(e.to_string()))?;
                self.inner.save(other)?;
            }
            self.inner.save(record)
        }

        fn list(&self) -> Result<Vec<CaseRecord>, CaseStoreError> {
            self.inner.list()
        }
    }

    #[test]
    fn conflicts_are_retried_against_the_fresh_record() {
        let (inner, id) = store_with(ProcessingMode::Automatic);
        let store = RacingStore {
            inner,
            saves: AtomicU32::new(0),
        };

        let saved = advance_status(&store, id, CaseStatus::TrygdetidOppdatert).unwrap();
        assert_eq!(saved.status(), CaseStatus::TrygdetidOppdatert);
        assert_eq!(saved.version(), 2);
    }
}

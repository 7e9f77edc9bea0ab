use std::collections::BTreeMap;
use std::sync::RwLock;

use saksflyt_core::{CaseId, CaseRecord, ExpectedVersion, Versioned};

use super::r#trait::{CaseStore, CaseStoreError};

/// In-memory case-record store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryCaseStore {
    cases: RwLock<BTreeMap<CaseId, CaseRecord>>,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> CaseStoreError {
    CaseStoreError::Unavailable("lock poisoned".to_string())
}

impl CaseStore for InMemoryCaseStore {
    fn get(&self, case_id: CaseId) -> Result<CaseRecord, CaseStoreError> {
        let cases = self.cases.read().map_err(|_| poisoned())?;
        cases.get(&case_id).cloned().ok_or(CaseStoreError::NotFound(case_id))
    }

    fn create(&self, record: CaseRecord) -> Result<CaseRecord, CaseStoreError> {
        let mut cases = self.cases.write().map_err(|_| poisoned())?;
        if cases.contains_key(&record.id()) {
            return Err(CaseStoreError::AlreadyExists(record.id()));
        }
        if record.version() != 0 {
            return Err(CaseStoreError::Conflict {
                case_id: record.id(),
                expected: 0,
                actual: record.version(),
            });
        }

        cases.insert(record.id(), record.clone());
        Ok(record)
    }

    fn save(&self, mut record: CaseRecord) -> Result<CaseRecord, CaseStoreError> {
        let mut cases = self.cases.write().map_err(|_| poisoned())?;
        let stored = cases
            .get_mut(&record.id())
            .ok_or(CaseStoreError::NotFound(record.id()))?;

        if !ExpectedVersion::Exact(record.version()).matches(stored.version()) {
            return Err(CaseStoreError::Conflict {
                case_id: record.id(),
                expected: record.version(),
                actual: stored.version(),
            });
        }

        record.bump_version();
        *stored = record.clone();
        Ok(record)
    }

    fn list(&self) -> Result<Vec<CaseRecord>, CaseStoreError> {
        let cases = self.cases.read().map_err(|_| poisoned())?;
        Ok(cases.values().cloned().collect())
    }
}

//! Last known failure per case, for operators.
//!
//! A case whose saga stalls is never silently lost: it stays in the ledger with
//! the reason until the failing step later succeeds for that case.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use saksflyt_core::{CaseId, CorrelationId};
use saksflyt_events::StepId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Handed to the retry channel.
    Retrying,
    /// Will not be retried (illegal or terminal transition).
    Fatal,
    /// Dropped by the hop-count guard.
    Runaway,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub case_id: CaseId,
    pub correlation_id: CorrelationId,
    /// `None` when the envelope was dropped before reaching a step.
    pub step: Option<StepId>,
    pub kind: FailureKind,
    pub detail: String,
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct FailureLedger {
    entries: RwLock<BTreeMap<CaseId, FailureRecord>>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the case's last failure.
    pub fn record(&self, record: FailureRecord) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(record.case_id, record);
        }
    }

    /// Clear the case's failure if it was recorded against `step`.
    pub fn resolve(&self, case_id: CaseId, step: &StepId) {
        if let Ok(mut entries) = self.entries.write() {
            if entries.get(&case_id).and_then(|r| r.step.as_ref()) == Some(step) {
                entries.remove(&case_id);
            }
        }
    }

    pub fn last_failure(&self, case_id: CaseId) -> Option<FailureRecord> {
        self.entries.read().ok()?.get(&case_id).cloned()
    }

    /// All cases with an unresolved failure, ordered by case id.
    pub fn pending(&self) -> Vec<FailureRecord> {
        self.entries
            .read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

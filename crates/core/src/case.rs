//! The case record (behandling).

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::id::CaseId;
use crate::state_machine;
use crate::status::{CaseStatus, CaseType, ProcessingMode};
use crate::version::Versioned;

/// Durable case entity.
///
/// The record is owned by the case-record store; envelopes only carry snapshots of
/// the fields a step needs. `status` can only change through [`CaseRecord::transition_to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseRecord {
    id: CaseId,
    case_type: CaseType,
    processing_mode: ProcessingMode,
    status: CaseStatus,
    /// Weak back-reference, e.g. a revision derived from a closed case.
    related_case_id: Option<CaseId>,
    version: u64,
}

impl CaseRecord {
    /// A freshly created case in `Opprettet`.
    pub fn new(id: CaseId, case_type: CaseType, processing_mode: ProcessingMode) -> Self {
        Self {
            id,
            case_type,
            processing_mode,
            status: CaseStatus::Opprettet,
            related_case_id: None,
            version: 0,
        }
    }

    pub fn derived_from(mut self, related: CaseId) -> Self {
        self.related_case_id = Some(related);
        self
    }

    pub fn id(&self) -> CaseId {
        self.id
    }

    pub fn case_type(&self) -> CaseType {
        self.case_type
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.processing_mode
    }

    pub fn status(&self) -> CaseStatus {
        self.status
    }

    pub fn related_case_id(&self) -> Option<CaseId> {
        self.related_case_id
    }

    /// Move to `requested` if the state machine allows it.
    ///
    /// Returns whether the status actually changed; re-entering the current status
    /// is accepted and reports `false`. On rejection the record is left untouched.
    pub fn transition_to(&mut self, requested: CaseStatus) -> Result<bool, TransitionError> {
        let next = state_machine::transition(self.status, requested, self.processing_mode)?;
        let changed = next != self.status;
        self.status = next;
        Ok(changed)
    }

    /// Used by stores when a save is accepted.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}

impl Versioned for CaseRecord {
    fn version(&self) -> u64 {
        self.version
    }
}

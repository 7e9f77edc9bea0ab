//! Domain error model.

use thiserror::Error;

use crate::status::{CaseStatus, ProcessingMode};

/// Domain-level error for malformed values.
///
/// Lifecycle violations have their own type, [`TransitionError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. an unknown status name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Rejection from the case state machine.
///
/// Neither variant is ever retried automatically: the case is left unchanged and
/// the rejection is surfaced to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The requested status is not reachable from the current one under this mode.
    #[error("illegal transition {from} -> {to} in {mode} mode")]
    IllegalState {
        from: CaseStatus,
        to: CaseStatus,
        mode: ProcessingMode,
    },

    /// The case is already in a terminal status.
    #[error("case is terminal ({status}); cannot move to {requested}")]
    Terminal {
        status: CaseStatus,
        requested: CaseStatus,
    },
}

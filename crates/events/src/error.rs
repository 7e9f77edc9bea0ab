//! Envelope validation errors.

use thiserror::Error;

use crate::event_name::EventName;
use crate::fields::FieldKey;

/// Structural defect of an envelope, detected before any step logic runs.
///
/// Never retried: a structurally invalid message cannot succeed on redelivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{event}: required key `{key}` is missing")]
    MissingKey { event: EventName, key: FieldKey },

    /// The envelope already carries the step's output, i.e. the step already ran.
    #[error("{event}: forbidden key `{key}` is present")]
    ForbiddenKeyPresent { event: EventName, key: FieldKey },

    #[error("malformed failure envelope: {0}")]
    MalformedFailure(String),
}

/// Failure to read a field from a validated envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("key `{0}` is not declared by the step contract")]
    Undeclared(FieldKey),

    #[error("key `{0}` is missing")]
    Missing(FieldKey),

    #[error("key `{key}` is malformed: {reason}")]
    Malformed { key: FieldKey, reason: String },
}

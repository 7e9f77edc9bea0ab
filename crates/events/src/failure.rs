//! Failure envelopes: what the failure & retry channel carries.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::contract::Contract;
use crate::envelope::EventEnvelope;
use crate::error::ValidationError;
use crate::event_name::EventName;
use crate::fields::{Fields, keys};
use crate::identity::{ServiceIdentity, StepId};

/// A step failure, with everything needed to re-run the step without re-deriving
/// its inputs.
///
/// On the wire this is an envelope named [`EventName::StepFailed`] with the fields
/// `failingStep`, `errorDetail`, `originalContext` and `attempt`.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureEnvelope {
    failing_step: StepId,
    error_detail: String,
    original_event: EventName,
    original_context: Fields,
    attempt: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OriginalContext {
    event_name: EventName,
    fields: Fields,
}

impl FailureEnvelope {
    /// Capture the failure of `step` while handling `original`.
    ///
    /// `attempt` is 1 for a first failure and grows on every repeated failure.
    pub fn capture(
        step: StepId,
        error_detail: impl Into<String>,
        original: &EventEnvelope,
        attempt: u32,
    ) -> Self {
        Self {
            failing_step: step,
            error_detail: error_detail.into(),
            original_event: original.event_name().clone(),
            original_context: original.fields().clone(),
            attempt,
        }
    }

    pub fn failing_step(&self) -> &StepId {
        &self.failing_step
    }

    pub fn error_detail(&self) -> &str {
        &self.error_detail
    }

    pub fn original_event(&self) -> &EventName {
        &self.original_event
    }

    pub fn original_context(&self) -> &Fields {
        &self.original_context
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Publishable form: a follow-on of `source` named `step.failed`.
    pub fn into_envelope(self, source: &EventEnvelope, identity: &ServiceIdentity) -> EventEnvelope {
        let mut fields = Fields::new();
        fields.insert(
            keys::FAILING_STEP.as_str().to_string(),
            JsonValue::String(self.failing_step.to_string()),
        );
        fields.insert(
            keys::ERROR_DETAIL.as_str().to_string(),
            JsonValue::String(self.error_detail),
        );
        fields.insert(
            keys::ORIGINAL_CONTEXT.as_str().to_string(),
            serde_json::json!({
                "eventName": self.original_event,
                "fields": self.original_context,
            }),
        );
        fields.insert(keys::ATTEMPT.as_str().to_string(), JsonValue::from(self.attempt));

        source
            .follow_on(EventName::StepFailed, identity)
            .reshaped(EventName::StepFailed, fields)
    }

    /// Read a failure back from a `step.failed` envelope.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, ValidationError> {
        if envelope.event_name() != &EventName::StepFailed {
            return Err(ValidationError::MalformedFailure(format!(
                "expected {}, got {}",
                EventName::StepFailed,
                envelope.event_name()
            )));
        }

        let contract = Contract::new()
            .require(keys::FAILING_STEP)
            .require(keys::ERROR_DETAIL)
            .require(keys::ORIGINAL_CONTEXT)
            .observe(keys::ATTEMPT);
        let validated = contract.validate(envelope)?;
        let malformed = |e: crate::error::FieldError| ValidationError::MalformedFailure(e.to_string());

        let failing_step: String = validated.required(keys::FAILING_STEP).map_err(malformed)?;
        let error_detail: String = validated.required(keys::ERROR_DETAIL).map_err(malformed)?;
        let context: OriginalContext = validated.required(keys::ORIGINAL_CONTEXT).map_err(malformed)?;
        let attempt: u32 = validated
            .optional(keys::ATTEMPT)
            .map_err(malformed)?
            .unwrap_or(1);

        Ok(Self {
            failing_step: StepId::from(failing_step),
            error_detail,
            original_event: context.event_name,
            original_context: context.fields,
            attempt,
        })
    }

    /// Rebuild the envelope the failing step originally received.
    ///
    /// Correlation id, hop count and provenance come from `failure_envelope`, so the
    /// retried step's follow-on continues the same trail.
    pub fn redelivery(&self, failure_envelope: &EventEnvelope) -> EventEnvelope {
        failure_envelope
            .clone()
            .reshaped(self.original_event.clone(), self.original_context.clone())
    }
}

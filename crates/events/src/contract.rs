//! Step contracts: which fields a step requires, observes or forbids.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::envelope::EventEnvelope;
use crate::error::{FieldError, ValidationError};
use crate::fields::FieldKey;

/// Field declaration of a step handler, fixed at registration time.
///
/// - **required**: absence rejects the envelope
/// - **observed**: copied through if present, ignored if absent
/// - **forbidden**: presence rejects the envelope; a step forbids its own output
///   key so that it can never fire twice on the same data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contract {
    required: Vec<FieldKey>,
    observed: Vec<FieldKey>,
    forbidden: Vec<FieldKey>,
}

impl Contract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, key: FieldKey) -> Self {
        self.required.push(key);
        self
    }

    pub fn observe(mut self, key: FieldKey) -> Self {
        self.observed.push(key);
        self
    }

    pub fn forbid(mut self, key: FieldKey) -> Self {
        self.forbidden.push(key);
        self
    }

    pub fn required_keys(&self) -> &[FieldKey] {
        &self.required
    }

    pub fn observed_keys(&self) -> &[FieldKey] {
        &self.observed
    }

    pub fn forbidden_keys(&self) -> &[FieldKey] {
        &self.forbidden
    }

    fn declares(&self, key: FieldKey) -> bool {
        self.required.contains(&key) || self.observed.contains(&key)
    }

    /// Check an envelope against this contract.
    ///
    /// Required keys are checked first (in declaration order), then forbidden keys.
    pub fn validate<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Result<ValidatedEnvelope<'a>, ValidationError> {
        if let Some(key) = self.required.iter().find(|k| !envelope.contains(**k)) {
            return Err(ValidationError::MissingKey {
                event: envelope.event_name().clone(),
                key: *key,
            });
        }
        if let Some(key) = self.forbidden.iter().find(|k| envelope.contains(**k)) {
            return Err(ValidationError::ForbiddenKeyPresent {
                event: envelope.event_name().clone(),
                key: *key,
            });
        }

        Ok(ValidatedEnvelope {
            envelope,
            contract: self,
        })
    }
}

/// An envelope that passed its step's contract.
///
/// Only declared keys can be read through it.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedEnvelope<'a> {
    envelope: &'a EventEnvelope,
    contract: &'a Contract,
}

impl<'a> ValidatedEnvelope<'a> {
    pub fn envelope(&self) -> &'a EventEnvelope {
        self.envelope
    }

    pub fn required<T: DeserializeOwned>(&self, key: FieldKey) -> Result<T, FieldError> {
        if !self.contract.required.contains(&key) {
            return Err(FieldError::Undeclared(key));
        }
        let value = self.envelope.field(key).ok_or(FieldError::Missing(key))?;
        decode(key, value)
    }

    /// Read a declared key; absent and `null` both read as `None`.
    pub fn optional<T: DeserializeOwned>(&self, key: FieldKey) -> Result<Option<T>, FieldError> {
        if !self.contract.declares(key) {
            return Err(FieldError::Undeclared(key));
        }
        match self.envelope.field(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => decode(key, value).map(Some),
        }
    }
}

fn decode<T: DeserializeOwned>(key: FieldKey, value: &JsonValue) -> Result<T, FieldError> {
    serde_json::from_value(value.clone()).map_err(|e| FieldError::Malformed {
        key,
        reason: e.to_string(),
    })
}

//! Envelope field keys.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

/// Ordered mapping of field keys to values carried by an envelope.
pub type Fields = BTreeMap<String, JsonValue>;

/// Name of an envelope field as declared in step contracts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey(&'static str);

impl FieldKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }
}

impl core::fmt::Display for FieldKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.0)
    }
}

/// Well-known keys.
pub mod keys {
    use super::FieldKey;

    pub const CASE_TYPE: FieldKey = FieldKey::new("caseType");
    pub const PROCESSING_MODE: FieldKey = FieldKey::new("processingMode");
    pub const RELATED_CASE_ID: FieldKey = FieldKey::new("relatedCaseId");

    pub const ELIGIBILITY: FieldKey = FieldKey::new("eligibility");
    pub const INSURANCE_PERIOD: FieldKey = FieldKey::new("insurancePeriod");
    pub const CALCULATION: FieldKey = FieldKey::new("calculation");
    pub const OFFSET: FieldKey = FieldKey::new("offset");
    pub const LETTER_ID: FieldKey = FieldKey::new("letterId");
    pub const DECISION: FieldKey = FieldKey::new("decision");
    pub const APPROVAL: FieldKey = FieldKey::new("approval");
    pub const COORDINATION: FieldKey = FieldKey::new("coordination");
    pub const PAYMENT_ID: FieldKey = FieldKey::new("paymentId");

    pub const FAILING_STEP: FieldKey = FieldKey::new("failingStep");
    pub const ERROR_DETAIL: FieldKey = FieldKey::new("errorDetail");
    pub const ORIGINAL_CONTEXT: FieldKey = FieldKey::new("originalContext");
    pub const ATTEMPT: FieldKey = FieldKey::new("attempt");
}

//! Clients for the collaborating services a case visits.
//!
//! Every call is synchronous and answers with a [`Reply`] (result-or-error) or a
//! [`TransportError`]. Steps never call a client directly; they go through
//! [`call_with_retry`] so transient failures are absorbed within the step.

pub mod in_memory;
pub mod retry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use saksflyt_core::{CaseId, CaseType, CorrelationId};

pub use in_memory::{InMemoryCollaborators, Scripted};
pub use retry::{BackoffStrategy, CallContext, CollaboratorError, RetryPolicy, call_with_retry};

/// Operation names, used for retry logging, call counting and failure injection.
pub mod ops {
    pub const ASSESS_ELIGIBILITY: &str = "eligibility.assess";
    pub const UPDATE_INSURANCE_PERIOD: &str = "insurance_period.update";
    pub const CALCULATE: &str = "calculation.calculate";
    pub const APPLY_OFFSET: &str = "offset.apply";
    pub const SEND_LETTER: &str = "letter.send";
    pub const MAKE_DECISION: &str = "decision.make";
    pub const APPROVE_DECISION: &str = "decision.approve";
    pub const COORDINATE: &str = "coordination.coordinate";
    pub const EFFECT_PAYMENT: &str = "payment.effect";

    pub const ALL: [&str; 9] = [
        ASSESS_ELIGIBILITY,
        UPDATE_INSURANCE_PERIOD,
        CALCULATE,
        APPLY_OFFSET,
        SEND_LETTER,
        MAKE_DECISION,
        APPROVE_DECISION,
        COORDINATE,
        EFFECT_PAYMENT,
    ];
}

/// Result-or-error answer of a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reply<T> {
    Ok(T),
    Err(RemoteError),
}

/// Error reported by the collaborator itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    /// Whether the same request may succeed later.
    pub retryable: bool,
}

impl RemoteError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// The request never got an answer (connection refused, timeout, ...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport error: {0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type CallResult<T> = Result<Reply<T>, TransportError>;

// -------------------------------------------------------------------------------------------------
// Collaborator results
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityOutcome {
    pub reference: String,
    pub fulfilled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsurancePeriod {
    pub reference: String,
    /// Counted insurance years, capped at 40.
    pub years: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calculation {
    pub reference: String,
    /// Gross monthly benefit in NOK.
    pub monthly_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offset {
    pub reference: String,
    /// Monthly benefit in NOK after income offsetting.
    pub monthly_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Letter {
    pub letter_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub decision_id: String,
    pub granted: bool,
    pub monthly_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub approval_id: String,
    pub approved_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordination {
    pub reference: String,
    /// Whether other benefits had to be coordinated against this decision.
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub payment_id: String,
    pub monthly_amount: u64,
}

/// Key under which a side effect (a letter, a payment) happens at most once per saga.
pub fn idempotency_key(correlation_id: CorrelationId, case_id: CaseId) -> String {
    format!("{correlation_id}:{case_id}")
}

// -------------------------------------------------------------------------------------------------
// Client traits
// -------------------------------------------------------------------------------------------------

pub trait EligibilityService: Send + Sync {
    fn assess(
        &self,
        ctx: &CallContext,
        case_id: CaseId,
        case_type: CaseType,
    ) -> CallResult<EligibilityOutcome>;
}

pub trait InsurancePeriodService: Send + Sync {
    fn update(&self, ctx: &CallContext, case_id: CaseId) -> CallResult<InsurancePeriod>;
}

pub trait CalculationService: Send + Sync {
    fn calculate(
        &self,
        ctx: &CallContext,
        case_id: CaseId,
        case_type: CaseType,
        insurance_period: &InsurancePeriod,
    ) -> CallResult<Calculation>;
}

pub trait OffsetService: Send + Sync {
    fn apply(
        &self,
        ctx: &CallContext,
        case_id: CaseId,
        calculation: &Calculation,
    ) -> CallResult<Offset>;
}

pub trait LetterService: Send + Sync {
    /// Send the decision letter. A repeated `idempotency_key` returns the letter
    /// already sent.
    fn send(
        &self,
        ctx: &CallContext,
        idempotency_key: &str,
        case_id: CaseId,
        monthly_amount: u64,
    ) -> CallResult<Letter>;
}

pub trait DecisionService: Send + Sync {
    fn make(
        &self,
        ctx: &CallContext,
        case_id: CaseId,
        granted: bool,
        monthly_amount: u64,
    ) -> CallResult<Decision>;

    fn approve(&self, ctx: &CallContext, case_id: CaseId, decision: &Decision) -> CallResult<Approval>;
}

pub trait CoordinationService: Send + Sync {
    fn coordinate(
        &self,
        ctx: &CallContext,
        case_id: CaseId,
        decision: &Decision,
    ) -> CallResult<Coordination>;
}

pub trait PaymentService: Send + Sync {
    /// Effect the decided payment.
    ///
    /// Implementations must treat `idempotency_key` as the payment's identity: a
    /// second call with the same key returns the first payment instead of paying
    /// again.
    fn effect(
        &self,
        ctx: &CallContext,
        idempotency_key: &str,
        case_id: CaseId,
        decision: &Decision,
    ) -> CallResult<Payment>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_uses_result_or_error_shape_on_the_wire() {
        let ok: Reply<Letter> = Reply::Ok(Letter {
            letter_id: "l-1".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"ok": {"letterId": "l-1"}})
        );

        let err: Reply<Letter> = Reply::Err(RemoteError::fatal("INVALID", "no address"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["err"]["retryable"], false);
        assert_eq!(serde_json::from_value::<Reply<Letter>>(json).unwrap(), err);
    }

    #[test]
    fn idempotency_key_is_stable_per_saga_and_case() {
        let correlation = CorrelationId::new();
        let case_id = CaseId::new();
        assert_eq!(
            idempotency_key(correlation, case_id),
            idempotency_key(correlation, case_id)
        );
        assert_ne!(
            idempotency_key(correlation, case_id),
            idempotency_key(CorrelationId::new(), case_id)
        );
    }
}

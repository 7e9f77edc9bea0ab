//! Step handlers: the units of work a saga is made of.
//!
//! A step consumes one event name, declares a [`Contract`] over the envelope's
//! fields, calls collaborators, advances the case status and returns the
//! follow-on events to publish. Steps never publish themselves; the dispatcher
//! does, after the step returned successfully.

pub mod pipeline;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use saksflyt_core::{CaseId, CorrelationId, TransitionError};
use saksflyt_events::{Contract, EventName, FieldError, FieldKey, ServiceIdentity, StepId, ValidatedEnvelope};

use crate::case_store::{CaseStore, StatusUpdateError};
use crate::collaborators::{
    CalculationService, CollaboratorError, CoordinationService, DecisionService,
    EligibilityService, InsurancePeriodService, LetterService, OffsetService, PaymentService,
    RetryPolicy,
};

pub use pipeline::{
    ApplyOffset, ApproveDecision, AssessEligibility, Calculate, Coordinate, EffectPayment,
    MakeDecision, SendLetter, UpdateInsurancePeriod, case_pipeline, manual_attestation,
};

/// Explicit per-invocation context handed to a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub identity: ServiceIdentity,
    pub case_id: CaseId,
    pub correlation_id: CorrelationId,
    /// Hop count of the input envelope.
    pub hop: u32,
    /// 1 on first delivery; grows on every retry through the failure channel.
    pub attempt: u32,
}

/// A follow-on event requested by a step.
///
/// The dispatcher turns it into an envelope with [`saksflyt_events::EventEnvelope::follow_on`],
/// so the input's fields are carried over and `fields` are added on top.
#[derive(Debug, Clone, PartialEq)]
pub struct Emit {
    pub event_name: EventName,
    pub fields: Vec<(FieldKey, JsonValue)>,
}

impl Emit {
    pub fn new(event_name: EventName) -> Self {
        Self {
            event_name,
            fields: Vec::new(),
        }
    }

    pub fn with_field<T: Serialize + ?Sized>(mut self, key: FieldKey, value: &T) -> Result<Self, FieldError> {
        let value = serde_json::to_value(value).map_err(|e| FieldError::Malformed {
            key,
            reason: e.to_string(),
        })?;
        self.fields.push((key, value));
        Ok(self)
    }

    pub fn with_value(mut self, key: FieldKey, value: JsonValue) -> Self {
        self.fields.push((key, value));
        self
    }
}

#[derive(Debug, Error)]
pub enum StepExecutionError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Status(#[from] StatusUpdateError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error("step panicked: {0}")]
    Panicked(String),
}

impl StepExecutionError {
    /// Whether re-running the step may succeed.
    ///
    /// Illegal or terminal transitions never become legal by retrying.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StepExecutionError::Status(StatusUpdateError::Transition(_)))
    }

    pub fn transition(&self) -> Option<&TransitionError> {
        match self {
            StepExecutionError::Status(StatusUpdateError::Transition(e)) => Some(e),
            _ => None,
        }
    }
}

/// One saga step.
///
/// Implementations must be idempotent per case: the same input may be delivered
/// more than once (redelivery after a crash, retries through the failure channel).
pub trait StepHandler: Send + Sync {
    fn step_id(&self) -> StepId;

    /// The event this step consumes.
    fn event_name(&self) -> EventName;

    /// Fields this step requires, observes and forbids; fixed at registration.
    fn contract(&self) -> &Contract;

    fn handle(
        &self,
        ctx: &StepContext,
        input: &ValidatedEnvelope<'_>,
    ) -> Result<Vec<Emit>, StepExecutionError>;
}

/// Everything the case-processing steps talk to.
#[derive(Clone)]
pub struct SagaServices {
    pub cases: Arc<dyn CaseStore>,
    pub eligibility: Arc<dyn EligibilityService>,
    pub insurance_period: Arc<dyn InsurancePeriodService>,
    pub calculation: Arc<dyn CalculationService>,
    pub offset: Arc<dyn OffsetService>,
    pub letters: Arc<dyn LetterService>,
    pub decisions: Arc<dyn DecisionService>,
    pub coordination: Arc<dyn CoordinationService>,
    pub payments: Arc<dyn PaymentService>,
    pub retry: RetryPolicy,
}

impl SagaServices {
    /// Wire every client to one implementation of all collaborator traits.
    pub fn with_collaborators<C>(cases: Arc<dyn CaseStore>, collaborators: Arc<C>, retry: RetryPolicy) -> Self
    where
        C: EligibilityService
            + InsurancePeriodService
            + CalculationService
            + OffsetService
            + LetterService
            + DecisionService
            + CoordinationService
            + PaymentService
            + 'static,
    {
        Self {
            cases,
            eligibility: collaborators.clone(),
            insurance_period: collaborators.clone(),
            calculation: collaborators.clone(),
            offset: collaborators.clone(),
            letters: collaborators.clone(),
            decisions: collaborators.clone(),
            coordination: collaborators.clone(),
            payments: collaborators,
            retry,
        }
    }
}

impl std::fmt::Debug for SagaServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaServices")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

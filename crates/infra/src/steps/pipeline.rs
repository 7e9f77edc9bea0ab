//! The case-processing saga.
//!
//! ```text
//! case.created ─► assess_eligibility ─► eligibility.assessed ─► update_insurance_period
//!   ─► insurance_period.updated ─► calculate ─► calculation.done ─► apply_offset
//!   ─► offset.applied ─► send_letter ─► letter.sent ─► make_decision ─► decision.made
//!   ─► approve_decision (automatic only) ─► decision.approved ─► coordinate
//!   ─► coordination.done ─► effect_payment ─► case.implemented
//! ```
//!
//! Every step forbids its own output key, so it can never fire on data it has
//! already produced. A delivery for a case that has already moved past a step
//! is skipped without side effects; one that arrives while the case still sits
//! at the step's target repeats the step, so every side effect must be safe to
//! repeat.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;

use saksflyt_core::{CaseStatus, CaseType, ProcessingMode, transition};
use saksflyt_events::{
    Contract, EventEnvelope, EventName, FieldError, ServiceIdentity, StepId, ValidatedEnvelope,
    keys,
};

use super::{Emit, SagaServices, StepContext, StepExecutionError, StepHandler};
use crate::case_store::{CaseStore, StatusUpdateError, advance_status};
use crate::collaborators::{
    Approval, CallContext, CallResult, Calculation, CollaboratorError, Coordination, Decision,
    EligibilityOutcome, InsurancePeriod, Offset, call_with_retry, idempotency_key, ops,
};

/// All case-processing steps, in saga order.
pub fn case_pipeline(services: Arc<SagaServices>) -> Vec<Arc<dyn StepHandler>> {
    vec![
        Arc::new(AssessEligibility::new(services.clone())),
        Arc::new(UpdateInsurancePeriod::new(services.clone())),
        Arc::new(Calculate::new(services.clone())),
        Arc::new(ApplyOffset::new(services.clone())),
        Arc::new(SendLetter::new(services.clone())),
        Arc::new(MakeDecision::new(services.clone())),
        Arc::new(ApproveDecision::new(services.clone())),
        Arc::new(Coordinate::new(services.clone())),
        Arc::new(EffectPayment::new(services)),
    ]
}

/// `decision.approved` for a manually processed case, on behalf of the attesting
/// case worker. Publishing it resumes the saga at coordination.
pub fn manual_attestation(
    decision_made: &EventEnvelope,
    approved_by: &str,
    identity: &ServiceIdentity,
) -> Result<EventEnvelope, FieldError> {
    let approval = Approval {
        approval_id: Uuid::now_v7().to_string(),
        approved_by: approved_by.to_string(),
    };
    decision_made
        .follow_on(EventName::DecisionApproved, identity)
        .with_field(keys::APPROVAL, &approval)
}

fn call<T, F>(services: &SagaServices, operation: &'static str, f: F) -> Result<T, CollaboratorError>
where
    T: Send + 'static,
    F: FnMut(&CallContext) -> CallResult<T> + Send + 'static,
{
    call_with_retry(&services.retry, operation, f)
}

/// Where a case stands relative to the statuses a step moves it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// The step has work to do; carries the current status.
    Due(CaseStatus),
    /// The case is already further along the main line than the step reaches.
    Passed,
}

impl Progress {
    fn is_passed(self) -> bool {
        self == Progress::Passed
    }
}

fn guard(services: &SagaServices, ctx: &StepContext, target: CaseStatus) -> Result<Progress, StepExecutionError> {
    guard_span(services, ctx, target, target)
}

/// Check, before any side effect, that the step may move the case through
/// `first..=last`.
///
/// A case already past `last` reports [`Progress::Passed`]: the input is stale or
/// duplicated and the step is skipped. A case inside the span is a re-entry. Any
/// other status must allow the move to `first`, else the step fails with the
/// transition error.
fn guard_span(
    services: &SagaServices,
    ctx: &StepContext,
    first: CaseStatus,
    last: CaseStatus,
) -> Result<Progress, StepExecutionError> {
    let record = services
        .cases
        .get(ctx.case_id)
        .map_err(StatusUpdateError::from)?;
    let status = record.status();

    match (status.rank(), first.rank(), last.rank()) {
        (Some(at), _, Some(end)) if at > end => {
            debug!(case_id = %ctx.case_id, status = %status, target = %last, "case already past step, skipping");
            return Ok(Progress::Passed);
        }
        (Some(at), Some(start), _) if at >= start => return Ok(Progress::Due(status)),
        _ => {}
    }

    transition(status, first, record.processing_mode()).map_err(StatusUpdateError::from)?;
    Ok(Progress::Due(status))
}

fn advance(
    services: &SagaServices,
    ctx: &StepContext,
    requested: CaseStatus,
) -> Result<(), StepExecutionError> {
    advance_status(services.cases.as_ref(), ctx.case_id, requested)?;
    Ok(())
}

macro_rules! step {
    ($name:ident, $id:literal, $event:expr, $contract:expr) => {
        pub struct $name {
            services: Arc<SagaServices>,
            contract: Contract,
        }

        impl $name {
            pub const ID: StepId = StepId::from_static($id);

            pub fn new(services: Arc<SagaServices>) -> Self {
                Self {
                    services,
                    contract: $contract,
                }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("contract", &self.contract)
                    .finish_non_exhaustive()
            }
        }

        impl StepHandler for $name {
            fn step_id(&self) -> StepId {
                Self::ID
            }

            fn event_name(&self) -> EventName {
                $event
            }

            fn contract(&self) -> &Contract {
                &self.contract
            }

            fn handle(
                &self,
                ctx: &StepContext,
                input: &ValidatedEnvelope<'_>,
            ) -> Result<Vec<Emit>, StepExecutionError> {
                self.run(ctx, input)
            }
        }
    };
}

step!(
    AssessEligibility,
    "assess_eligibility",
    EventName::CaseCreated,
    Contract::new()
        .require(keys::CASE_TYPE)
        .require(keys::PROCESSING_MODE)
        .observe(keys::RELATED_CASE_ID)
        .forbid(keys::ELIGIBILITY)
);

impl AssessEligibility {
    fn run(&self, ctx: &StepContext, input: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        let case_type: CaseType = input.required(keys::CASE_TYPE)?;
        if guard(&self.services, ctx, CaseStatus::Vilkaarsvurdert)?.is_passed() {
            return Ok(Vec::new());
        }

        let (eligibility, case_id) = (self.services.eligibility.clone(), ctx.case_id);
        let outcome = call(&self.services, ops::ASSESS_ELIGIBILITY, move |c| {
            eligibility.assess(c, case_id, case_type)
        })?;
        advance(&self.services, ctx, CaseStatus::Vilkaarsvurdert)?;

        Ok(vec![
            Emit::new(EventName::EligibilityAssessed).with_field(keys::ELIGIBILITY, &outcome)?,
        ])
    }
}

step!(
    UpdateInsurancePeriod,
    "update_insurance_period",
    EventName::EligibilityAssessed,
    Contract::new()
        .require(keys::ELIGIBILITY)
        .forbid(keys::INSURANCE_PERIOD)
);

impl UpdateInsurancePeriod {
    fn run(&self, ctx: &StepContext, _: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        if guard(&self.services, ctx, CaseStatus::TrygdetidOppdatert)?.is_passed() {
            return Ok(Vec::new());
        }

        let (insurance_period, case_id) = (self.services.insurance_period.clone(), ctx.case_id);
        let period = call(&self.services, ops::UPDATE_INSURANCE_PERIOD, move |c| {
            insurance_period.update(c, case_id)
        })?;
        advance(&self.services, ctx, CaseStatus::TrygdetidOppdatert)?;

        Ok(vec![
            Emit::new(EventName::InsurancePeriodUpdated).with_field(keys::INSURANCE_PERIOD, &period)?,
        ])
    }
}

step!(
    Calculate,
    "calculate",
    EventName::InsurancePeriodUpdated,
    Contract::new()
        .require(keys::CASE_TYPE)
        .require(keys::INSURANCE_PERIOD)
        .forbid(keys::CALCULATION)
);

impl Calculate {
    fn run(&self, ctx: &StepContext, input: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        let case_type: CaseType = input.required(keys::CASE_TYPE)?;
        let period: InsurancePeriod = input.required(keys::INSURANCE_PERIOD)?;
        if guard(&self.services, ctx, CaseStatus::Beregnet)?.is_passed() {
            return Ok(Vec::new());
        }

        let (calculator, case_id) = (self.services.calculation.clone(), ctx.case_id);
        let calculation = call(&self.services, ops::CALCULATE, move |c| {
            calculator.calculate(c, case_id, case_type, &period)
        })?;
        advance(&self.services, ctx, CaseStatus::Beregnet)?;

        Ok(vec![
            Emit::new(EventName::CalculationDone).with_field(keys::CALCULATION, &calculation)?,
        ])
    }
}

step!(
    ApplyOffset,
    "apply_offset",
    EventName::CalculationDone,
    Contract::new()
        .require(keys::CASE_TYPE)
        .require(keys::CALCULATION)
        .forbid(keys::OFFSET)
);

impl ApplyOffset {
    fn run(&self, ctx: &StepContext, input: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        let case_type: CaseType = input.required(keys::CASE_TYPE)?;
        let emit = Emit::new(EventName::OffsetApplied);
        if guard(&self.services, ctx, CaseStatus::Avkortet)?.is_passed() {
            return Ok(Vec::new());
        }

        if !case_type.requires_offset() {
            debug!(case_type = %case_type, "no income offsetting for case type");
            // An explicit null still counts as present for the forbid check.
            return Ok(vec![emit.with_value(keys::OFFSET, JsonValue::Null)]);
        }

        let calculation: Calculation = input.required(keys::CALCULATION)?;
        let (offsetting, case_id) = (self.services.offset.clone(), ctx.case_id);
        let offset = call(&self.services, ops::APPLY_OFFSET, move |c| {
            offsetting.apply(c, case_id, &calculation)
        })?;
        advance(&self.services, ctx, CaseStatus::Avkortet)?;

        Ok(vec![emit.with_field(keys::OFFSET, &offset)?])
    }
}

step!(
    SendLetter,
    "send_letter",
    EventName::OffsetApplied,
    Contract::new()
        .require(keys::CALCULATION)
        .observe(keys::OFFSET)
        .forbid(keys::LETTER_ID)
);

impl SendLetter {
    fn run(&self, ctx: &StepContext, input: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        let amount = monthly_amount(input)?;
        // The letter precedes the decision.
        if guard(&self.services, ctx, CaseStatus::FattetVedtak)?.is_passed() {
            return Ok(Vec::new());
        }

        let key = idempotency_key(ctx.correlation_id, ctx.case_id);
        let (letters, case_id) = (self.services.letters.clone(), ctx.case_id);
        let letter = call(&self.services, ops::SEND_LETTER, move |c| {
            letters.send(c, &key, case_id, amount)
        })?;

        Ok(vec![
            Emit::new(EventName::LetterSent).with_field(keys::LETTER_ID, &letter.letter_id)?,
        ])
    }
}

step!(
    MakeDecision,
    "make_decision",
    EventName::LetterSent,
    Contract::new()
        .require(keys::ELIGIBILITY)
        .require(keys::CALCULATION)
        .require(keys::LETTER_ID)
        .observe(keys::OFFSET)
        .forbid(keys::DECISION)
);

impl MakeDecision {
    fn run(&self, ctx: &StepContext, input: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        let eligibility: EligibilityOutcome = input.required(keys::ELIGIBILITY)?;
        let amount = monthly_amount(input)?;
        if guard(&self.services, ctx, CaseStatus::FattetVedtak)?.is_passed() {
            return Ok(Vec::new());
        }

        let (decisions, case_id) = (self.services.decisions.clone(), ctx.case_id);
        let decision = call(&self.services, ops::MAKE_DECISION, move |c| {
            decisions.make(c, case_id, eligibility.fulfilled, amount)
        })?;
        advance(&self.services, ctx, CaseStatus::FattetVedtak)?;

        Ok(vec![
            Emit::new(EventName::DecisionMade).with_field(keys::DECISION, &decision)?,
        ])
    }
}

step!(
    ApproveDecision,
    "approve_decision",
    EventName::DecisionMade,
    Contract::new()
        .require(keys::PROCESSING_MODE)
        .require(keys::DECISION)
        .forbid(keys::APPROVAL)
);

impl ApproveDecision {
    fn run(&self, ctx: &StepContext, input: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        let mode: ProcessingMode = input.required(keys::PROCESSING_MODE)?;
        if mode == ProcessingMode::Manual {
            info!(case_id = %ctx.case_id, "decision awaits manual attestation");
            return Ok(Vec::new());
        }

        let decision: Decision = input.required(keys::DECISION)?;
        if guard(&self.services, ctx, CaseStatus::Attestert)?.is_passed() {
            return Ok(Vec::new());
        }

        let (decisions, case_id) = (self.services.decisions.clone(), ctx.case_id);
        let approval = call(&self.services, ops::APPROVE_DECISION, move |c| {
            decisions.approve(c, case_id, &decision)
        })?;
        advance(&self.services, ctx, CaseStatus::Attestert)?;

        Ok(vec![
            Emit::new(EventName::DecisionApproved).with_field(keys::APPROVAL, &approval)?,
        ])
    }
}

step!(
    Coordinate,
    "coordinate",
    EventName::DecisionApproved,
    Contract::new()
        .require(keys::DECISION)
        .require(keys::APPROVAL)
        .forbid(keys::COORDINATION)
);

impl Coordinate {
    fn run(&self, ctx: &StepContext, input: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        let decision: Decision = input.required(keys::DECISION)?;
        let _: Approval = input.required(keys::APPROVAL)?;

        // Manually attested cases arrive here still in FATTET_VEDTAK; a repeated
        // delivery may find the case anywhere up to SAMORDNET.
        let Progress::Due(current) =
            guard_span(&self.services, ctx, CaseStatus::Attestert, CaseStatus::Samordnet)?
        else {
            return Ok(Vec::new());
        };

        let (coordinator, case_id) = (self.services.coordination.clone(), ctx.case_id);
        let coordination: Coordination = call(&self.services, ops::COORDINATE, move |c| {
            coordinator.coordinate(c, case_id, &decision)
        })?;

        let mut path = vec![CaseStatus::Attestert];
        if coordination.required {
            path.extend([CaseStatus::TilSamordning, CaseStatus::Samordnet]);
        }
        for status in path.into_iter().filter(|s| s.rank() > current.rank()) {
            advance(&self.services, ctx, status)?;
        }

        Ok(vec![
            Emit::new(EventName::Coordinated).with_field(keys::COORDINATION, &coordination)?,
        ])
    }
}

step!(
    EffectPayment,
    "effect_payment",
    EventName::Coordinated,
    Contract::new()
        .require(keys::DECISION)
        .require(keys::COORDINATION)
        .forbid(keys::PAYMENT_ID)
);

impl EffectPayment {
    fn run(&self, ctx: &StepContext, input: &ValidatedEnvelope<'_>) -> Result<Vec<Emit>, StepExecutionError> {
        let decision: Decision = input.required(keys::DECISION)?;
        if guard(&self.services, ctx, CaseStatus::Iverksatt)?.is_passed() {
            return Ok(Vec::new());
        }

        let key = idempotency_key(ctx.correlation_id, ctx.case_id);
        let (payments, case_id) = (self.services.payments.clone(), ctx.case_id);
        let payment = call(&self.services, ops::EFFECT_PAYMENT, move |c| {
            payments.effect(c, &key, case_id, &decision)
        })?;
        advance(&self.services, ctx, CaseStatus::Iverksatt)?;
        info!(case_id = %ctx.case_id, payment_id = %payment.payment_id, "case implemented");

        Ok(vec![
            Emit::new(EventName::CaseImplemented).with_field(keys::PAYMENT_ID, &payment.payment_id)?,
        ])
    }
}

/// Amount after offsetting if it was applied, else the calculated amount.
fn monthly_amount(input: &ValidatedEnvelope<'_>) -> Result<u64, FieldError> {
    if let Some(offset) = input.optional::<Offset>(keys::OFFSET)? {
        return Ok(offset.monthly_amount);
    }
    let calculation: Calculation = input.required(keys::CALCULATION)?;
    Ok(calculation.monthly_amount)
}

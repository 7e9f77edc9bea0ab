//! Deterministic in-memory collaborators for tests/dev.
//!
//! - Same case in, same references and amounts out (uuid v5), so a retried saga
//!   converges to the result of an uninterrupted one
//! - Call counters per operation
//! - Scripted failures per operation, consumed one per call
//! - Letters and payments keyed by idempotency key

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use saksflyt_core::{CaseId, CaseType};

use super::retry::CallContext;
use super::{
    Approval, CallResult, Calculation, CalculationService, Coordination, CoordinationService,
    Decision, DecisionService, EligibilityOutcome, EligibilityService, InsurancePeriod,
    InsurancePeriodService, Letter, LetterService, Offset, OffsetService, Payment, PaymentService,
    RemoteError, Reply, TransportError, ops,
};

const REFERENCE_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_52c4_3a8e_4b7f_9c21_d0e5_a7b3_f418);

/// A failure to inject into the next call of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    Transport(String),
    Remote(RemoteError),
    /// The collaborator client panics mid-call.
    Panic(String),
    /// The collaborator answers normally, but only after this long.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct State {
    calls: HashMap<&'static str, u32>,
    scripts: HashMap<&'static str, VecDeque<Scripted>>,
    payments: HashMap<String, Payment>,
    letters: HashMap<String, (CaseId, Letter)>,
}

/// One fake implementing every collaborator trait.
#[derive(Debug)]
pub struct InMemoryCollaborators {
    state: Mutex<State>,
    coordination_required: bool,
    approver: String,
}

impl Default for InMemoryCollaborators {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            coordination_required: false,
            approver: "automatisk".to_string(),
        }
    }
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make coordination report that other benefits were affected.
    pub fn with_coordination_required(mut self, required: bool) -> Self {
        self.coordination_required = required;
        self
    }

    /// Fail the next `times` calls of `operation` with `failure`.
    pub fn fail_next(&self, operation: &'static str, failure: Scripted, times: usize) {
        if let Ok(mut state) = self.state.lock() {
            let queue = state.scripts.entry(operation).or_default();
            queue.extend(std::iter::repeat_n(failure, times));
        }
    }

    /// Calls made to `operation`, failed ones included.
    pub fn calls(&self, operation: &str) -> u32 {
        self.state
            .lock()
            .map(|s| s.calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Distinct payments effected.
    pub fn payments(&self) -> Vec<Payment> {
        self.state
            .lock()
            .map(|s| s.payments.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Letters sent for `case_id`.
    pub fn letters_for(&self, case_id: CaseId) -> Vec<Letter> {
        self.state
            .lock()
            .map(|s| {
                s.letters
                    .values()
                    .filter(|(id, _)| *id == case_id)
                    .map(|(_, letter)| letter.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count the call and apply a scripted failure, if one is queued.
    fn begin(&self, operation: &'static str) -> Result<Option<RemoteError>, TransportError> {
        let scripted = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| TransportError::new("collaborator state poisoned"))?;
            *state.calls.entry(operation).or_insert(0) += 1;
            state.scripts.get_mut(operation).and_then(VecDeque::pop_front)
        };

        match scripted {
            None => Ok(None),
            Some(Scripted::Transport(msg)) => Err(TransportError::new(msg)),
            Some(Scripted::Remote(err)) => Ok(Some(err)),
            Some(Scripted::Panic(msg)) => panic!("{operation}: {msg}"),
            Some(Scripted::Stall(delay)) => {
                thread::sleep(delay);
                Ok(None)
            }
        }
    }

    fn answer<T>(
        &self,
        operation: &'static str,
        ok: impl FnOnce() -> T,
    ) -> CallResult<T> {
        match self.begin(operation)? {
            Some(remote) => Ok(Reply::Err(remote)),
            None => Ok(Reply::Ok(ok())),
        }
    }
}

fn reference(operation: &str, case_id: CaseId) -> String {
    Uuid::new_v5(&REFERENCE_NAMESPACE, format!("{operation}/{case_id}").as_bytes()).to_string()
}

impl EligibilityService for InMemoryCollaborators {
    fn assess(&self, _: &CallContext, case_id: CaseId, _: CaseType) -> CallResult<EligibilityOutcome> {
        self.answer(ops::ASSESS_ELIGIBILITY, || EligibilityOutcome {
            reference: reference(ops::ASSESS_ELIGIBILITY, case_id),
            fulfilled: true,
        })
    }
}

impl InsurancePeriodService for InMemoryCollaborators {
    fn update(&self, _: &CallContext, case_id: CaseId) -> CallResult<InsurancePeriod> {
        self.answer(ops::UPDATE_INSURANCE_PERIOD, || InsurancePeriod {
            reference: reference(ops::UPDATE_INSURANCE_PERIOD, case_id),
            years: 20 + u32::from(case_id.as_uuid().as_bytes()[15] % 21),
        })
    }
}

impl CalculationService for InMemoryCollaborators {
    fn calculate(
        &self,
        _: &CallContext,
        case_id: CaseId,
        case_type: CaseType,
        insurance_period: &InsurancePeriod,
    ) -> CallResult<Calculation> {
        let full = match case_type {
            CaseType::Barnepensjon => 12_000,
            CaseType::Omstillingsstoenad => 20_000,
        };
        self.answer(ops::CALCULATE, || Calculation {
            reference: reference(ops::CALCULATE, case_id),
            monthly_amount: full * u64::from(insurance_period.years.min(40)) / 40,
        })
    }
}

impl OffsetService for InMemoryCollaborators {
    fn apply(&self, _: &CallContext, case_id: CaseId, calculation: &Calculation) -> CallResult<Offset> {
        self.answer(ops::APPLY_OFFSET, || Offset {
            reference: reference(ops::APPLY_OFFSET, case_id),
            monthly_amount: calculation.monthly_amount * 9 / 10,
        })
    }
}

impl LetterService for InMemoryCollaborators {
    fn send(
        &self,
        _: &CallContext,
        idempotency_key: &str,
        case_id: CaseId,
        _: u64,
    ) -> CallResult<Letter> {
        if let Some(remote) = self.begin(ops::SEND_LETTER)? {
            return Ok(Reply::Err(remote));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::new("collaborator state poisoned"))?;
        let (_, letter) = state
            .letters
            .entry(idempotency_key.to_string())
            .or_insert_with(|| {
                (
                    case_id,
                    Letter {
                        letter_id: reference(ops::SEND_LETTER, case_id),
                    },
                )
            });
        Ok(Reply::Ok(letter.clone()))
    }
}

impl DecisionService for InMemoryCollaborators {
    fn make(
        &self,
        _: &CallContext,
        case_id: CaseId,
        granted: bool,
        monthly_amount: u64,
    ) -> CallResult<Decision> {
        self.answer(ops::MAKE_DECISION, || Decision {
            decision_id: reference(ops::MAKE_DECISION, case_id),
            granted,
            monthly_amount: if granted { monthly_amount } else { 0 },
        })
    }

    fn approve(&self, _: &CallContext, case_id: CaseId, _: &Decision) -> CallResult<Approval> {
        self.answer(ops::APPROVE_DECISION, || Approval {
            approval_id: reference(ops::APPROVE_DECISION, case_id),
            approved_by: self.approver.clone(),
        })
    }
}

impl CoordinationService for InMemoryCollaborators {
    fn coordinate(&self, _: &CallContext, case_id: CaseId, _: &Decision) -> CallResult<Coordination> {
        self.answer(ops::COORDINATE, || Coordination {
            reference: reference(ops::COORDINATE, case_id),
            required: self.coordination_required,
        })
    }
}

impl PaymentService for InMemoryCollaborators {
    fn effect(
        &self,
        _: &CallContext,
        idempotency_key: &str,
        case_id: CaseId,
        decision: &Decision,
    ) -> CallResult<Payment> {
        if let Some(remote) = self.begin(ops::EFFECT_PAYMENT)? {
            return Ok(Reply::Err(remote));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::new("collaborator state poisoned"))?;
        let payment = state
            .payments
            .entry(idempotency_key.to_string())
            .or_insert_with(|| Payment {
                payment_id: reference(ops::EFFECT_PAYMENT, case_id),
                monthly_amount: decision.monthly_amount,
            })
            .clone();
        Ok(Reply::Ok(payment))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::collaborators::{CollaboratorError, RetryPolicy, call_with_retry};

    fn call<T: Send + 'static>(
        fakes: &Arc<InMemoryCollaborators>,
        f: impl Fn(&InMemoryCollaborators, &CallContext) -> CallResult<T> + Send + 'static,
    ) -> Result<T, CollaboratorError> {
        let fakes = Arc::clone(fakes);
        call_with_retry(&RetryPolicy::fixed(1, Duration::ZERO), "test", move |ctx| f(&fakes, ctx))
    }

    #[test]
    fn references_are_deterministic_per_case() {
        let fakes = Arc::new(InMemoryCollaborators::new());
        let case_id = CaseId::new();

        let first = call(&fakes, move |f, ctx| f.update(ctx, case_id)).unwrap();
        let second = call(&fakes, move |f, ctx| f.update(ctx, case_id)).unwrap();
        assert_eq!(first, second);
        assert!((20..=40).contains(&first.years));
        assert_eq!(fakes.calls(ops::UPDATE_INSURANCE_PERIOD), 2);
    }

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let fakes = Arc::new(InMemoryCollaborators::new());
        let case_id = CaseId::new();
        fakes.fail_next(ops::SEND_LETTER, Scripted::Transport("down".into()), 1);
        fakes.fail_next(
            ops::SEND_LETTER,
            Scripted::Remote(RemoteError::fatal("BAD_ADDRESS", "unknown recipient")),
            1,
        );

        let send = move |f: &InMemoryCollaborators, ctx: &CallContext| f.send(ctx, "k", case_id, 100);
        assert!(call(&fakes, send).is_err());
        assert!(call(&fakes, send).is_err());
        assert!(call(&fakes, send).is_ok());
        assert_eq!(fakes.calls(ops::SEND_LETTER), 3);
        assert_eq!(fakes.letters_for(case_id).len(), 1);
    }

    #[test]
    fn letters_are_sent_once_per_key() {
        let fakes = Arc::new(InMemoryCollaborators::new());
        let case_id = CaseId::new();

        let a = call(&fakes, move |f, ctx| f.send(ctx, "saga-1", case_id, 5_400)).unwrap();
        let b = call(&fakes, move |f, ctx| f.send(ctx, "saga-1", case_id, 5_400)).unwrap();
        assert_eq!(a, b);
        assert_eq!(fakes.letters_for(case_id).len(), 1);

        call(&fakes, move |f, ctx| f.send(ctx, "saga-2", case_id, 5_400)).unwrap();
        assert_eq!(fakes.letters_for(case_id).len(), 2);
        assert_eq!(fakes.calls(ops::SEND_LETTER), 3);
    }

    #[test]
    fn payments_are_idempotent_per_key() {
        let fakes = Arc::new(InMemoryCollaborators::new());
        let case_id = CaseId::new();
        let decision = Decision {
            decision_id: "d".to_string(),
            granted: true,
            monthly_amount: 9_000,
        };

        let first = decision.clone();
        let a = call(&fakes, move |f, ctx| f.effect(ctx, "key-1", case_id, &first)).unwrap();
        let b = call(&fakes, move |f, ctx| f.effect(ctx, "key-1", case_id, &decision)).unwrap();
        assert_eq!(a, b);
        assert_eq!(fakes.payments().len(), 1);
        assert_eq!(fakes.calls(ops::EFFECT_PAYMENT), 2);
    }

    #[test]
    fn stalled_calls_answer_late() {
        let fakes = Arc::new(InMemoryCollaborators::new());
        fakes.fail_next(ops::COORDINATE, Scripted::Stall(Duration::from_millis(20)), 1);
        let decision = Decision {
            decision_id: "d".to_string(),
            granted: true,
            monthly_amount: 1,
        };

        let coordination = call(&fakes, move |f, ctx| f.coordinate(ctx, CaseId::new(), &decision)).unwrap();
        assert!(!coordination.required);
    }

    #[test]
    fn child_pension_is_calculated_from_insurance_years() {
        let fakes = Arc::new(InMemoryCollaborators::new());
        let period = InsurancePeriod {
            reference: "t".to_string(),
            years: 20,
        };
        let calc = call(&fakes, move |f, ctx| {
            f.calculate(ctx, CaseId::new(), CaseType::Barnepensjon, &period)
        })
        .unwrap();
        assert_eq!(calc.monthly_amount, 6_000);
    }
}

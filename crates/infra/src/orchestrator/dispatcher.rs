//! Envelope dispatch: route, validate, run, publish.
//!
//! ```text
//! envelope
//!   ↓
//! 1. hop-count guard (runaway loops are dropped)
//!   ↓
//! 2. route by event name (unknown → dropped, step.failed → retry channel)
//!   ↓
//! 3. validate against each handler's contract (violations → rejected)
//!   ↓
//! 4. run the handler (panics are caught)
//!   ↓
//! 5. publish follow-ons, or a failure envelope, or drop a fatal error
//! ```
//!
//! `dispatch` returns `Ok` only once every publication it needed has succeeded;
//! the caller commits the input's offset only then.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info_span, warn};

use saksflyt_core::CaseRecord;
use saksflyt_events::{
    EventEnvelope, EventName, EventStream, FailureEnvelope, FieldError, ServiceIdentity, StepId,
    keys,
};

use super::ledger::{FailureKind, FailureLedger, FailureRecord};
use super::registry::StepRegistry;
use crate::case_store::{CaseStore, CaseStoreError};
use crate::steps::{Emit, StepContext, StepExecutionError, StepHandler};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Publication failed; the input must be redelivered.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Polling or committing failed.
    #[error("stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Store(#[from] CaseStoreError),

    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Why an envelope was dropped without running a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    UnknownEvent(String),
    Runaway { hop_count: u32, max_hops: u32 },
    /// The step failed in a way retrying cannot fix.
    Fatal { step: StepId, error: String },
    MalformedFailure(String),
    /// A failure envelope naming a step that consumes a different event.
    StepMismatch { step: StepId, event: EventName },
}

/// What happened to one envelope (for one handler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed { step: StepId, published: usize },
    /// A failure envelope was published for the retry channel.
    Failed { step: StepId, attempt: u32 },
    /// The envelope violated the step's contract.
    Rejected { step: StepId, reason: String },
    /// No handler here for this event (or failing step owned elsewhere).
    Ignored,
    Dropped { reason: DropReason },
}

/// Dispatches envelopes to registered steps and publishes their results.
pub struct Dispatcher<S: EventStream> {
    pub(super) stream: S,
    pub(super) registry: Arc<StepRegistry>,
    pub(super) identity: ServiceIdentity,
    pub(super) ledger: Arc<FailureLedger>,
    max_hops: u32,
}

impl<S: EventStream> Dispatcher<S> {
    pub fn new(
        stream: S,
        registry: Arc<StepRegistry>,
        identity: ServiceIdentity,
        ledger: Arc<FailureLedger>,
        max_hops: u32,
    ) -> Self {
        Self {
            stream,
            registry,
            identity,
            ledger,
            max_hops,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    /// Create the case record and publish its `case.created` envelope.
    ///
    /// The case's type, processing mode and related case travel with every
    /// follow-on from here.
    pub fn open_case<C>(&self, cases: &C, record: CaseRecord) -> Result<EventEnvelope, DispatchError>
    where
        C: CaseStore + ?Sized,
    {
        let record = cases.create(record)?;
        let mut envelope = EventEnvelope::originate(
            EventName::CaseCreated,
            record.id(),
            saksflyt_core::CorrelationId::new(),
            &self.identity,
        )
        .with_field(keys::CASE_TYPE, &record.case_type())?
        .with_field(keys::PROCESSING_MODE, &record.processing_mode())?;
        if let Some(related) = record.related_case_id() {
            envelope = envelope.with_field(keys::RELATED_CASE_ID, &related)?;
        }

        self.publish(envelope.clone())?;
        Ok(envelope)
    }

    /// Dispatch one envelope.
    pub fn dispatch(&self, envelope: &EventEnvelope) -> Result<Vec<DispatchOutcome>, DispatchError> {
        let _span = info_span!(
            "dispatch",
            event = %envelope.event_name(),
            case_id = %envelope.case_id(),
            correlation_id = %envelope.correlation_id(),
            hop = envelope.hop_count(),
        )
        .entered();

        if envelope.hop_count() > self.max_hops {
            error!(
                max_hops = self.max_hops,
                provenance = %provenance_trail(envelope),
                "runaway envelope dropped"
            );
            self.ledger.record(FailureRecord {
                case_id: envelope.case_id(),
                correlation_id: envelope.correlation_id(),
                step: None,
                kind: FailureKind::Runaway,
                detail: format!("hop count {} exceeds {}", envelope.hop_count(), self.max_hops),
                attempt: 0,
                recorded_at: Utc::now(),
            });
            return Ok(vec![DispatchOutcome::Dropped {
                reason: DropReason::Runaway {
                    hop_count: envelope.hop_count(),
                    max_hops: self.max_hops,
                },
            }]);
        }

        match envelope.event_name() {
            EventName::Unknown(name) => {
                warn!(provenance = %provenance_trail(envelope), "unknown event dropped");
                Ok(vec![DispatchOutcome::Dropped {
                    reason: DropReason::UnknownEvent(name.clone()),
                }])
            }
            EventName::StepFailed => self.retry_failed(envelope).map(|outcome| vec![outcome]),
            name => {
                let handlers = self.registry.handlers_for(name);
                if handlers.is_empty() {
                    debug!("no step consumes this event");
                    return Ok(vec![DispatchOutcome::Ignored]);
                }
                handlers
                    .iter()
                    .map(|handler| self.run_step(handler.as_ref(), envelope, 1))
                    .collect()
            }
        }
    }

    /// Validate, run one step and publish what it produced.
    pub(super) fn run_step(
        &self,
        handler: &dyn StepHandler,
        input: &EventEnvelope,
        attempt: u32,
    ) -> Result<DispatchOutcome, DispatchError> {
        let step = handler.step_id();

        let validated = match handler.contract().validate(input) {
            Ok(validated) => validated,
            Err(err) => {
                warn!(
                    step = %step,
                    error = %err,
                    provenance = %provenance_trail(input),
                    "envelope rejected by step contract"
                );
                return Ok(DispatchOutcome::Rejected {
                    step,
                    reason: err.to_string(),
                });
            }
        };

        let ctx = StepContext {
            identity: self.identity.clone(),
            case_id: input.case_id(),
            correlation_id: input.correlation_id(),
            hop: input.hop_count(),
            attempt,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&ctx, &validated)))
            .unwrap_or_else(|payload| Err(StepExecutionError::Panicked(panic_message(payload.as_ref()))));

        match result {
            Ok(emits) => {
                let published = emits.len();
                for emit in emits {
                    self.publish(follow_on(input, emit, &self.identity))?;
                }
                self.ledger.resolve(input.case_id(), &step);
                debug!(step = %step, attempt, published, "step completed");
                Ok(DispatchOutcome::Completed { step, published })
            }
            Err(err) if err.is_recoverable() => {
                warn!(
                    step = %step,
                    attempt,
                    error = %err,
                    provenance = %provenance_trail(input),
                    "step failed, handing to retry channel"
                );
                let detail = err.to_string();
                let failure = FailureEnvelope::capture(step.clone(), detail.clone(), input, attempt);
                self.publish(failure.into_envelope(input, &self.identity))?;
                self.ledger.record(FailureRecord {
                    case_id: input.case_id(),
                    correlation_id: input.correlation_id(),
                    step: Some(step.clone()),
                    kind: FailureKind::Retrying,
                    detail,
                    attempt,
                    recorded_at: Utc::now(),
                });
                Ok(DispatchOutcome::Failed { step, attempt })
            }
            Err(err) => {
                error!(
                    step = %step,
                    attempt,
                    error = %err,
                    provenance = %provenance_trail(input),
                    "step failed permanently"
                );
                self.ledger.record(FailureRecord {
                    case_id: input.case_id(),
                    correlation_id: input.correlation_id(),
                    step: Some(step.clone()),
                    kind: FailureKind::Fatal,
                    detail: err.to_string(),
                    attempt,
                    recorded_at: Utc::now(),
                });
                Ok(DispatchOutcome::Dropped {
                    reason: DropReason::Fatal {
                        step,
                        error: err.to_string(),
                    },
                })
            }
        }
    }

    fn publish(&self, envelope: EventEnvelope) -> Result<(), DispatchError> {
        let event = envelope.event_name().clone();
        let position = self
            .stream
            .publish(envelope)
            .map_err(|e| DispatchError::Publish(e.to_string()))?;
        debug!(event = %event, partition = position.partition, offset = position.offset, "published");
        Ok(())
    }
}

impl<S: EventStream> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("identity", &self.identity)
            .field("registry", &self.registry)
            .field("max_hops", &self.max_hops)
            .finish_non_exhaustive()
    }
}

fn follow_on(input: &EventEnvelope, emit: Emit, identity: &ServiceIdentity) -> EventEnvelope {
    emit.fields
        .into_iter()
        .fold(input.follow_on(emit.event_name, identity), |env, (key, value)| {
            env.with_value(key, value)
        })
}

/// `service/instance > service/instance > ...`
pub(super) fn provenance_trail(envelope: &EventEnvelope) -> String {
    envelope
        .provenance()
        .iter()
        .map(|p| format!("{}/{}", p.service, p.instance))
        .collect::<Vec<_>>()
        .join(" > ")
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

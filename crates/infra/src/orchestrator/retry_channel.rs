//! Failure & retry channel.
//!
//! A `step.failed` envelope is picked up by the service that owns the failing
//! step. The original input is rebuilt from the failure's captured context and
//! run through the same path as a first delivery, so a successful retry continues
//! the saga exactly where it stopped. Retries are unbounded; the hop-count guard
//! stops a step that never recovers.

use tracing::{debug, info, warn};

use saksflyt_events::{EventEnvelope, EventStream, FailureEnvelope};

use super::dispatcher::{DispatchError, DispatchOutcome, Dispatcher, DropReason, provenance_trail};

impl<S: EventStream> Dispatcher<S> {
    pub(super) fn retry_failed(&self, envelope: &EventEnvelope) -> Result<DispatchOutcome, DispatchError> {
        let failure = match FailureEnvelope::from_envelope(envelope) {
            Ok(failure) => failure,
            Err(err) => {
                warn!(
                    error = %err,
                    provenance = %provenance_trail(envelope),
                    "malformed failure envelope dropped"
                );
                return Ok(DispatchOutcome::Dropped {
                    reason: DropReason::MalformedFailure(err.to_string()),
                });
            }
        };

        let Some(handler) = self.registry.step(failure.failing_step()) else {
            debug!(step = %failure.failing_step(), "failing step is owned by another service");
            return Ok(DispatchOutcome::Ignored);
        };

        if &handler.event_name() != failure.original_event() {
            warn!(
                step = %failure.failing_step(),
                original_event = %failure.original_event(),
                provenance = %provenance_trail(envelope),
                "failure does not match the step's input event"
            );
            return Ok(DispatchOutcome::Dropped {
                reason: DropReason::StepMismatch {
                    step: failure.failing_step().clone(),
                    event: failure.original_event().clone(),
                },
            });
        }

        let attempt = failure.attempt().saturating_add(1);
        info!(
            step = %failure.failing_step(),
            attempt,
            previous_error = %failure.error_detail(),
            "retrying failed step"
        );

        let redelivered = failure.redelivery(envelope);
        self.run_step(handler.as_ref(), &redelivered, attempt)
    }
}

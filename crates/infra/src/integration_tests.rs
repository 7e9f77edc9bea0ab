//! End-to-end saga tests on the in-memory stream, store and collaborators.
//!
//! Flow: open case → stream → orchestrator → steps → collaborators + case store → stream
//!
//! Verifies:
//! - Cases run to IVERKSATT through every step in order
//! - Failed steps are retried through the failure channel and the saga resumes
//! - Contract violations never reach collaborators
//! - Replays, lost publications and runaway loops cannot repeat side effects

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use saksflyt_core::{CaseId, CaseRecord, CaseStatus, CaseType, CorrelationId, ProcessingMode};
    use saksflyt_events::{
        EventEnvelope, EventName, EventStream, FailureEnvelope, InMemoryEventStream,
        ServiceIdentity, StreamPosition, StreamRecord, keys,
    };
    use serde_json::Value as JsonValue;

    use crate::case_store::{CaseStore, InMemoryCaseStore, advance_status};
    use crate::collaborators::{InMemoryCollaborators, RetryPolicy, Scripted, ops};
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::{DispatchError, FailureKind, Orchestrator, case_orchestrator};
    use crate::steps::SagaServices;
    use crate::steps::pipeline::manual_attestation;

    const GROUP: &str = "saksflyt";

    struct World {
        stream: Arc<InMemoryEventStream>,
        store: Arc<InMemoryCaseStore>,
        collaborators: Arc<InMemoryCollaborators>,
        orchestrator: Arc<Orchestrator<Arc<InMemoryEventStream>>>,
    }

    impl World {
        fn new(collaborators: InMemoryCollaborators) -> Self {
            Self::with_config(collaborators, test_config(), RetryPolicy::fixed(1, Duration::ZERO))
        }

        fn with_config(collaborators: InMemoryCollaborators, config: OrchestratorConfig, retry: RetryPolicy) -> Self {
            let stream = Arc::new(InMemoryEventStream::new(config.partitions));
            let store = Arc::new(InMemoryCaseStore::new());
            let collaborators = Arc::new(collaborators);
            let services = Arc::new(SagaServices::with_collaborators(
                store.clone(),
                collaborators.clone(),
                retry,
            ));
            let orchestrator = Arc::new(case_orchestrator(&config, stream.clone(), services).unwrap());

            Self {
                stream,
                store,
                collaborators,
                orchestrator,
            }
        }

        fn open(&self, case_type: CaseType, mode: ProcessingMode) -> EventEnvelope {
            let record = CaseRecord::new(CaseId::new(), case_type, mode);
            self.orchestrator
                .dispatcher()
                .open_case(self.store.as_ref(), record)
                .unwrap()
        }

        fn settle(&self) {
            let report = self.orchestrator.run_until_idle(500).unwrap();
            assert!(report.settled, "stream did not settle: {report:?}");
        }

        fn status(&self, case_id: CaseId) -> CaseStatus {
            self.store.get(case_id).unwrap().status()
        }

        fn events(&self, case_id: CaseId) -> Vec<EventName> {
            self.stream
                .history(case_id)
                .unwrap()
                .iter()
                .map(|env| env.event_name().clone())
                .collect()
        }

        fn last(&self, case_id: CaseId, name: EventName) -> EventEnvelope {
            self.stream
                .history(case_id)
                .unwrap()
                .into_iter()
                .rev()
                .find(|env| env.event_name() == &name)
                .unwrap()
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_instance("test-0")
            .with_consumer_group(GROUP)
            .with_partitions(4)
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(5))
    }

    const FULL_SAGA: [EventName; 10] = [
        EventName::CaseCreated,
        EventName::EligibilityAssessed,
        EventName::InsurancePeriodUpdated,
        EventName::CalculationDone,
        EventName::OffsetApplied,
        EventName::LetterSent,
        EventName::DecisionMade,
        EventName::DecisionApproved,
        EventName::Coordinated,
        EventName::CaseImplemented,
    ];

    #[test]
    fn automatic_survivor_pension_runs_to_iverksatt() {
        let world = World::new(InMemoryCollaborators::new().with_coordination_required(true));
        let created = world.open(CaseType::Omstillingsstoenad, ProcessingMode::Automatic);
        let case_id = created.case_id();

        world.settle();

        assert_eq!(world.status(case_id), CaseStatus::Iverksatt);
        assert_eq!(world.events(case_id), FULL_SAGA.to_vec());
        assert_eq!(world.collaborators.payments().len(), 1);
        assert_eq!(world.collaborators.letters_for(case_id).len(), 1);
        assert!(world.orchestrator.dispatcher().ledger().is_empty());

        let history = world.stream.history(case_id).unwrap();
        for (hop, env) in history.iter().enumerate() {
            assert_eq!(env.hop_count() as usize, hop);
            assert_eq!(env.provenance().len(), hop + 1);
            assert_eq!(env.correlation_id(), created.correlation_id());
        }
        let done = history.last().unwrap();
        assert!(done.contains(keys::PAYMENT_ID));
        assert!(done.contains(keys::OFFSET));
        assert_eq!(done.field(keys::CASE_TYPE), Some(&JsonValue::from("OMSTILLINGSSTOENAD")));
    }

    #[test]
    fn calculate_failure_is_retried_and_the_saga_continues_to_offset() {
        let collaborators = InMemoryCollaborators::new();
        collaborators.fail_next(ops::CALCULATE, Scripted::Transport("beregning unavailable".into()), 1);
        let world = World::new(collaborators);
        let case_id = world
            .open(CaseType::Omstillingsstoenad, ProcessingMode::Automatic)
            .case_id();

        world.settle();

        let failure_env = world.last(case_id, EventName::StepFailed);
        let failure = FailureEnvelope::from_envelope(&failure_env).unwrap();
        assert_eq!(failure.failing_step().as_str(), "calculate");
        assert_eq!(failure.attempt(), 1);
        assert_eq!(failure.original_event(), &EventName::InsurancePeriodUpdated);
        assert!(failure.original_context().contains_key(keys::INSURANCE_PERIOD.as_str()));

        let events = world.events(case_id);
        let failed_at = events.iter().position(|e| e == &EventName::StepFailed).unwrap();
        assert_eq!(events[failed_at + 1], EventName::CalculationDone);
        assert_eq!(events[failed_at + 2], EventName::OffsetApplied);

        assert_eq!(world.collaborators.calls(ops::CALCULATE), 2);
        assert_eq!(world.collaborators.calls(ops::APPLY_OFFSET), 1);
        assert_eq!(world.status(case_id), CaseStatus::Iverksatt);
        assert!(world.orchestrator.dispatcher().ledger().is_empty());
    }

    #[test]
    fn transient_errors_are_absorbed_within_the_step() {
        let collaborators = InMemoryCollaborators::new();
        collaborators.fail_next(ops::UPDATE_INSURANCE_PERIOD, Scripted::Transport("reset".into()), 2);
        let world = World::with_config(collaborators, test_config(), RetryPolicy::fixed(3, Duration::ZERO));
        let case_id = world.open(CaseType::Barnepensjon, ProcessingMode::Automatic).case_id();

        world.settle();

        assert!(!world.events(case_id).contains(&EventName::StepFailed));
        assert_eq!(world.collaborators.calls(ops::UPDATE_INSURANCE_PERIOD), 3);
        assert_eq!(world.status(case_id), CaseStatus::Iverksatt);
    }

    #[test]
    fn collaborator_panic_is_retried_like_any_failure() {
        let collaborators = InMemoryCollaborators::new();
        collaborators.fail_next(ops::SEND_LETTER, Scripted::Panic("template missing".into()), 1);
        let world = World::new(collaborators);
        let case_id = world.open(CaseType::Barnepensjon, ProcessingMode::Automatic).case_id();

        world.settle();

        let failure = FailureEnvelope::from_envelope(&world.last(case_id, EventName::StepFailed)).unwrap();
        assert_eq!(failure.failing_step().as_str(), "send_letter");
        assert!(failure.error_detail().contains("template missing"));
        assert_eq!(world.collaborators.letters_for(case_id).len(), 1);
        assert_eq!(world.status(case_id), CaseStatus::Iverksatt);
    }

    #[test]
    fn letter_envelope_that_already_carries_a_letter_id_is_rejected() {
        let world = World::new(InMemoryCollaborators::new());
        let case_id = CaseId::new();
        let mut record = CaseRecord::new(case_id, CaseType::Barnepensjon, ProcessingMode::Automatic);
        record.transition_to(CaseStatus::Beregnet).unwrap();
        world.store.create(record).unwrap();

        let envelope = EventEnvelope::originate(
            EventName::OffsetApplied,
            case_id,
            CorrelationId::new(),
            &ServiceIdentity::new("avkorting", "0"),
        )
        .with_field(keys::CALCULATION, &serde_json::json!({"reference": "c", "monthlyAmount": 9000}))
        .unwrap()
        .with_field(keys::LETTER_ID, "sent-earlier")
        .unwrap();
        world.stream.publish(envelope).unwrap();

        world.settle();

        assert_eq!(world.collaborators.calls(ops::SEND_LETTER), 0);
        assert!(world.collaborators.letters_for(case_id).is_empty());
        assert_eq!(world.events(case_id), vec![EventName::OffsetApplied]);
        assert_eq!(world.orchestrator.stats().envelopes_rejected, 1);
        assert!(world.stream.is_drained(GROUP).unwrap());
    }

    #[test]
    fn retried_step_produces_the_same_follow_on_as_a_clean_run() {
        let case_id = CaseId::new();
        let correlation_id = CorrelationId::new();

        let run = |failures: usize| {
            let collaborators = InMemoryCollaborators::new();
            collaborators.fail_next(ops::CALCULATE, Scripted::Transport("down".into()), failures);
            let world = World::new(collaborators);
            let mut record = CaseRecord::new(case_id, CaseType::Omstillingsstoenad, ProcessingMode::Automatic);
            record.transition_to(CaseStatus::TrygdetidOppdatert).unwrap();
            world.store.create(record).unwrap();

            let input = EventEnvelope::originate(
                EventName::InsurancePeriodUpdated,
                case_id,
                correlation_id,
                &ServiceIdentity::new("trygdetid", "0"),
            )
            .with_field(keys::CASE_TYPE, &CaseType::Omstillingsstoenad)
            .unwrap()
            .with_field(keys::PROCESSING_MODE, &ProcessingMode::Automatic)
            .unwrap()
            .with_field(keys::INSURANCE_PERIOD, &serde_json::json!({"reference": "t", "years": 33}))
            .unwrap();
            world.stream.publish(input).unwrap();
            world.settle();
            world.last(case_id, EventName::CalculationDone)
        };

        let clean = run(0);
        let retried = run(3);

        assert_eq!(retried.event_name(), clean.event_name());
        assert_eq!(retried.fields(), clean.fields());
        assert_eq!(retried.correlation_id(), clean.correlation_id());
    }

    #[test]
    fn cases_sharing_partitions_progress_independently() {
        let collaborators = InMemoryCollaborators::new();
        let config = test_config().with_partitions(2);
        let world = World::with_config(collaborators, config, RetryPolicy::fixed(1, Duration::ZERO));

        let cases: Vec<CaseId> = (0..12)
            .map(|i| {
                let case_type = if i % 2 == 0 {
                    CaseType::Barnepensjon
                } else {
                    CaseType::Omstillingsstoenad
                };
                world.open(case_type, ProcessingMode::Automatic).case_id()
            })
            .collect();
        // Two decisions fail once each before the service recovers.
        world
            .collaborators
            .fail_next(ops::MAKE_DECISION, Scripted::Transport("vedtak down".into()), 2);

        world.settle();

        for case_id in &cases {
            assert_eq!(world.status(*case_id), CaseStatus::Iverksatt);
            let history = world.stream.history(*case_id).unwrap();
            assert!(history.windows(2).all(|w| w[0].hop_count() < w[1].hop_count()));
            assert!(history.iter().all(|env| env.case_id() == *case_id));
        }
        assert_eq!(world.collaborators.payments().len(), cases.len());
        assert_eq!(world.orchestrator.stats().steps_failed, 2);
    }

    #[test]
    fn step_that_never_recovers_is_stopped_by_the_hop_guard() {
        let collaborators = InMemoryCollaborators::new();
        collaborators.fail_next(ops::CALCULATE, Scripted::Transport("permanently down".into()), 1_000);
        let world = World::with_config(
            collaborators,
            test_config().with_max_hops(12),
            RetryPolicy::fixed(1, Duration::ZERO),
        );
        let case_id = world.open(CaseType::Barnepensjon, ProcessingMode::Automatic).case_id();

        world.settle();

        assert_eq!(world.status(case_id), CaseStatus::TrygdetidOppdatert);
        let ledger = world.orchestrator.dispatcher().ledger();
        assert_eq!(ledger.last_failure(case_id).unwrap().kind, FailureKind::Runaway);
        assert!(world.stream.history(case_id).unwrap().iter().all(|env| env.hop_count() <= 13));
        assert!(world.stream.is_drained(GROUP).unwrap());
    }

    #[test]
    fn replaying_the_stream_does_not_repeat_side_effects() {
        let world = World::new(InMemoryCollaborators::new());
        let case_id = world.open(CaseType::Omstillingsstoenad, ProcessingMode::Automatic).case_id();
        world.settle();
        let published = world.stream.history(case_id).unwrap().len();

        for partition in 0..world.stream.partitions() {
            world.stream.seek(GROUP, partition, 0).unwrap();
        }
        world.settle();

        assert_eq!(world.status(case_id), CaseStatus::Iverksatt);
        assert_eq!(world.collaborators.payments().len(), 1);
        assert_eq!(world.collaborators.letters_for(case_id).len(), 1);
        assert_eq!(world.collaborators.calls(ops::SEND_LETTER), 1);
        assert_eq!(world.collaborators.calls(ops::CALCULATE), 1);
        // Only the idempotent payment step re-runs; its duplicate announcement is inert.
        assert_eq!(world.stream.history(case_id).unwrap().len(), published + 1);
        assert!(world.orchestrator.dispatcher().ledger().pending().is_empty());
    }

    /// Fails the first publication of one event, as a broker outage between a
    /// step's side effect and its announcement would.
    struct LosesFirstPublish {
        inner: Arc<InMemoryEventStream>,
        event: EventName,
        lost: AtomicBool,
    }

    impl EventStream for LosesFirstPublish {
        type Error = String;

        fn partitions(&self) -> u32 {
            self.inner.partitions()
        }

        fn publish(&self, envelope: EventEnvelope) -> Result<StreamPosition, Self::Error> {
            if envelope.event_name() == &self.event && !self.lost.swap(true, Ordering::SeqCst) {
                return Err(format!("broker unavailable while publishing {}", self.event));
            }
            self.inner.publish(envelope).map_err(|e| e.to_string())
        }

        fn poll(&self, group: &str, partition: u32, max: usize) -> Result<Vec<StreamRecord>, Self::Error> {
            self.inner.poll(group, partition, max).map_err(|e| e.to_string())
        }

        fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), Self::Error> {
            self.inner.commit(group, partition, next_offset).map_err(|e| e.to_string())
        }

        fn committed(&self, group: &str, partition: u32) -> Result<u64, Self::Error> {
            self.inner.committed(group, partition).map_err(|e| e.to_string())
        }

        fn seek(&self, group: &str, partition: u32, offset: u64) -> Result<(), Self::Error> {
            self.inner.seek(group, partition, offset).map_err(|e| e.to_string())
        }
    }

    /// Run one automatic case while the first publication of `lost` fails, and
    /// return it once the redelivered input has been processed.
    fn run_with_lost_publish(collaborators: InMemoryCollaborators, lost: EventName) -> (CaseId, World) {
        let world = World::new(collaborators);
        let stream = Arc::new(LosesFirstPublish {
            inner: world.stream.clone(),
            event: lost,
            lost: AtomicBool::new(false),
        });
        let services = Arc::new(SagaServices::with_collaborators(
            world.store.clone(),
            world.collaborators.clone(),
            RetryPolicy::fixed(1, Duration::ZERO),
        ));
        let orchestrator = case_orchestrator(&test_config(), stream.clone(), services).unwrap();

        let record = CaseRecord::new(CaseId::new(), CaseType::Omstillingsstoenad, ProcessingMode::Automatic);
        let case_id = orchestrator
            .dispatcher()
            .open_case(world.store.as_ref(), record)
            .unwrap()
            .case_id();

        let mut publish_failures = 0;
        loop {
            match orchestrator.run_until_idle(500) {
                Ok(report) => {
                    assert!(report.settled, "stream did not settle: {report:?}");
                    break;
                }
                Err(DispatchError::Publish(_)) if publish_failures == 0 => publish_failures += 1,
                Err(e) => panic!("unexpected dispatch error: {e}"),
            }
        }
        assert_eq!(publish_failures, 1);
        assert!(stream.lost.load(Ordering::SeqCst));
        assert!(orchestrator.dispatcher().ledger().pending().is_empty());

        (case_id, world)
    }

    #[test]
    fn coordination_is_resumed_after_its_announcement_was_lost() {
        let (case_id, world) = run_with_lost_publish(
            InMemoryCollaborators::new().with_coordination_required(true),
            EventName::Coordinated,
        );

        assert_eq!(world.status(case_id), CaseStatus::Iverksatt);
        assert_eq!(world.collaborators.calls(ops::COORDINATE), 2);
        assert_eq!(world.collaborators.payments().len(), 1);
        assert_eq!(world.events(case_id), FULL_SAGA.to_vec());
    }

    #[test]
    fn a_lost_letter_announcement_does_not_send_a_second_letter() {
        let (case_id, world) = run_with_lost_publish(InMemoryCollaborators::new(), EventName::LetterSent);

        assert_eq!(world.status(case_id), CaseStatus::Iverksatt);
        assert_eq!(world.collaborators.calls(ops::SEND_LETTER), 2);
        assert_eq!(world.collaborators.letters_for(case_id).len(), 1);
        assert_eq!(world.collaborators.payments().len(), 1);
    }

    #[test]
    fn manual_case_waits_for_attestation() {
        let world = World::new(InMemoryCollaborators::new().with_coordination_required(true));
        let case_id = world.open(CaseType::Barnepensjon, ProcessingMode::Manual).case_id();

        world.settle();

        assert_eq!(world.status(case_id), CaseStatus::FattetVedtak);
        assert_eq!(world.collaborators.calls(ops::APPROVE_DECISION), 0);
        assert_eq!(world.events(case_id).last(), Some(&EventName::DecisionMade));

        let decision_made = world.last(case_id, EventName::DecisionMade);
        let attested = manual_attestation(&decision_made, "saksbehandler-1", &ServiceIdentity::new("attestering", "0"))
            .unwrap();
        world.stream.publish(attested).unwrap();
        world.settle();

        assert_eq!(world.status(case_id), CaseStatus::Iverksatt);
        assert_eq!(world.collaborators.payments().len(), 1);
    }

    #[test]
    fn aborted_case_stops_before_any_collaborator_call() {
        let world = World::new(InMemoryCollaborators::new());
        let case_id = world.open(CaseType::Barnepensjon, ProcessingMode::Manual).case_id();
        advance_status(world.store.as_ref(), case_id, CaseStatus::Avbrutt).unwrap();

        world.settle();

        assert_eq!(world.status(case_id), CaseStatus::Avbrutt);
        assert_eq!(world.collaborators.calls(ops::ASSESS_ELIGIBILITY), 0);
        let failure = world
            .orchestrator
            .dispatcher()
            .ledger()
            .last_failure(case_id)
            .unwrap();
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert_eq!(failure.step.unwrap().as_str(), "assess_eligibility");
    }

    #[test]
    fn unknown_events_are_dropped_and_committed() {
        let world = World::new(InMemoryCollaborators::new());
        let envelope = EventEnvelope::originate(
            EventName::parse("klage.registrert"),
            CaseId::new(),
            CorrelationId::new(),
            &ServiceIdentity::new("klage", "0"),
        );
        world.stream.publish(envelope).unwrap();

        world.settle();

        assert_eq!(world.orchestrator.stats().envelopes_dropped, 1);
        assert!(world.stream.is_drained(GROUP).unwrap());
    }

    #[test]
    fn spawned_workers_complete_many_cases() {
        let world = World::new(InMemoryCollaborators::new().with_coordination_required(true));
        let cases: Vec<CaseId> = (0..20)
            .map(|_| world.open(CaseType::Omstillingsstoenad, ProcessingMode::Automatic).case_id())
            .collect();

        let handle = world.orchestrator.clone().spawn();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline
            && !cases.iter().all(|id| world.status(*id) == CaseStatus::Iverksatt)
        {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        for case_id in &cases {
            assert_eq!(world.status(*case_id), CaseStatus::Iverksatt);
        }
        assert_eq!(world.collaborators.payments().len(), cases.len());
    }
}

//! Runs the case-processing saga against the in-memory stream and collaborators.
//!
//! Opens `SAKSFLYT_DEMO_CASES` cases (default 4) in `SAKSFLYT_DEMO_MODE`
//! (`automatic` or `manual`), drives the stream until it settles and logs the
//! resulting statuses, counters and unresolved failures.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{info, warn};

use saksflyt_core::{CaseId, CaseRecord, CaseStatus, CaseType, ProcessingMode};
use saksflyt_events::InMemoryEventStream;
use saksflyt_infra::collaborators::InMemoryCollaborators;
use saksflyt_infra::{CaseStore, InMemoryCaseStore, OrchestratorConfig, SagaServices, case_orchestrator};

const ENV_DEMO_CASES: &str = "SAKSFLYT_DEMO_CASES";
const ENV_DEMO_MODE: &str = "SAKSFLYT_DEMO_MODE";
const MAX_ROUNDS: usize = 10_000;

fn main() -> anyhow::Result<()> {
    saksflyt_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;
    let cases = demo_cases()?;
    let mode = demo_mode()?;
    info!(
        service = %config.service,
        instance = %config.instance,
        partitions = config.partitions,
        workers = config.workers,
        cases,
        mode = %mode,
        "starting saksflyt worker"
    );

    let stream = Arc::new(InMemoryEventStream::new(config.partitions));
    let store = Arc::new(InMemoryCaseStore::new());
    let collaborators = Arc::new(InMemoryCollaborators::new().with_coordination_required(true));
    let services = Arc::new(SagaServices::with_collaborators(
        store.clone(),
        collaborators.clone(),
        config.collaborator_retry.clone(),
    ));
    let orchestrator = case_orchestrator(&config, stream.clone(), services)
        .context("failed to register saga steps")?;

    let mut opened = Vec::with_capacity(cases);
    for i in 0..cases {
        let case_type = if i % 2 == 0 {
            CaseType::Omstillingsstoenad
        } else {
            CaseType::Barnepensjon
        };
        let record = CaseRecord::new(CaseId::new(), case_type, mode);
        let created = orchestrator
            .dispatcher()
            .open_case(store.as_ref(), record)
            .context("failed to open case")?;
        opened.push(created.case_id());
    }

    let report = orchestrator
        .run_until_idle(MAX_ROUNDS)
        .context("orchestrator stopped")?;
    if !report.settled {
        warn!(rounds = report.rounds, "stream did not settle");
    }

    for case_id in &opened {
        let record = store.get(*case_id).context("case disappeared from the store")?;
        info!(
            case_id = %case_id,
            case_type = %record.case_type(),
            status = %record.status(),
            "case finished"
        );
        if record.status() == CaseStatus::FattetVedtak {
            info!(case_id = %case_id, "decision awaits manual attestation");
        }
    }

    let stats = orchestrator.stats();
    info!(
        processed = report.processed,
        rounds = report.rounds,
        stats = %serde_json::to_string(&stats).unwrap_or_default(),
        payments = collaborators.payments().len(),
        "saga run complete"
    );

    for failure in orchestrator.dispatcher().ledger().pending() {
        warn!(
            case_id = %failure.case_id,
            correlation_id = %failure.correlation_id,
            step = ?failure.step.as_ref().map(|s| s.as_str()),
            kind = ?failure.kind,
            attempt = failure.attempt,
            detail = %failure.detail,
            "unresolved failure"
        );
    }

    Ok(())
}

fn demo_cases() -> anyhow::Result<usize> {
    match std::env::var(ENV_DEMO_CASES) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{ENV_DEMO_CASES} must be a number, got {raw:?}")),
        Err(_) => Ok(4),
    }
}

fn demo_mode() -> anyhow::Result<ProcessingMode> {
    match std::env::var(ENV_DEMO_MODE).as_deref().map(str::trim) {
        Err(_) | Ok("automatic") => Ok(ProcessingMode::Automatic),
        Ok("manual") => Ok(ProcessingMode::Manual),
        Ok(other) => bail!("{ENV_DEMO_MODE} must be 'automatic' or 'manual', got {other:?}"),
    }
}

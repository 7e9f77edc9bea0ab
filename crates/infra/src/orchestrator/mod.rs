//! Saga orchestration: step registry, dispatcher, failure & retry channel,
//! failure ledger and partition workers.

pub mod dispatcher;
pub mod ledger;
pub mod registry;
pub mod retry_channel;
pub mod worker;

use std::sync::Arc;

use saksflyt_events::EventStream;

use crate::config::OrchestratorConfig;
use crate::steps::{SagaServices, case_pipeline};

pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, DropReason};
pub use ledger::{FailureKind, FailureLedger, FailureRecord};
pub use registry::{RegistryError, StepRegistry};
pub use worker::{IdleReport, Orchestrator, OrchestratorHandle, OrchestratorStats, WorkerHandle};

/// Wire the case-processing saga onto `stream` as configured.
pub fn case_orchestrator<S>(
    config: &OrchestratorConfig,
    stream: S,
    services: Arc<SagaServices>,
) -> Result<Orchestrator<S>, RegistryError>
where
    S: EventStream + 'static,
{
    let mut registry = StepRegistry::new();
    registry.register_all(case_pipeline(services))?;

    let dispatcher = Dispatcher::new(
        stream,
        Arc::new(registry),
        config.identity(),
        Arc::new(FailureLedger::new()),
        config.max_hops,
    );

    Ok(Orchestrator::new(
        Arc::new(dispatcher),
        config.consumer_group.clone(),
        config.workers,
        config.batch_size,
        config.poll_interval,
    ))
}

//! Runtime for the case-processing saga: configuration, case store, collaborator
//! clients, saga steps and the orchestrator that drives them from the stream.

pub mod case_store;
pub mod collaborators;
pub mod config;
pub mod orchestrator;
pub mod steps;

#[cfg(test)]
mod integration_tests;

pub use case_store::{CaseStore, CaseStoreError, InMemoryCaseStore, StatusUpdateError, advance_status};
pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::{
    DispatchError, DispatchOutcome, Dispatcher, FailureLedger, Orchestrator, OrchestratorHandle,
    StepRegistry, case_orchestrator,
};
pub use steps::{SagaServices, StepHandler};

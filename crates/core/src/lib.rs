//! `saksflyt-core`: case lifecycle domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the case record and the lifecycle state machine.

pub mod case;
pub mod error;
pub mod id;
pub mod state_machine;
pub mod status;
pub mod version;

pub use case::CaseRecord;
pub use error::{DomainError, TransitionError};
pub use id::{CaseId, CorrelationId};
pub use state_machine::{reachable, transition};
pub use status::{CaseStatus, CaseType, ProcessingMode};
pub use version::{ExpectedVersion, Versioned};

//! Saga wire protocol: envelopes, contracts, failure envelopes and the event stream.

pub mod contract;
pub mod envelope;
pub mod error;
pub mod event_name;
pub mod failure;
pub mod fields;
pub mod identity;
pub mod in_memory_stream;
pub mod stream;

pub use contract::{Contract, ValidatedEnvelope};
pub use envelope::EventEnvelope;
pub use error::{FieldError, ValidationError};
pub use event_name::EventName;
pub use failure::FailureEnvelope;
pub use fields::{FieldKey, Fields, keys};
pub use identity::{ProvenanceEntry, ServiceIdentity, StepId};
pub use in_memory_stream::{InMemoryEventStream, InMemoryStreamError};
pub use stream::{EventStream, StreamPosition, StreamRecord, partition_of};

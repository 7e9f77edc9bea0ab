//! Partitioned event stream abstraction (mechanics only).
//!
//! The stream is the single source of ordering truth:
//!
//! - **Append-only**: envelopes are appended to one partition chosen from the case id
//! - **Per-case ordering**: envelopes of one case land in one partition and are read
//!   back in publication order; there is no ordering across partitions
//! - **At-least-once**: consumers commit their own offsets per consumer group; anything
//!   after the committed offset is delivered again on the next poll
//! - **Replayable**: a group can [`EventStream::seek`] back to any offset
//!
//! Consumers must be idempotent, since processing the same envelope more than once
//! is expected after a crash between processing and commit.

use std::sync::Arc;

use saksflyt_core::CaseId;

use crate::envelope::EventEnvelope;

/// Where an envelope sits in the stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamPosition {
    pub partition: u32,
    pub offset: u64,
}

/// An envelope read back from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub position: StreamPosition,
    pub envelope: EventEnvelope,
}

/// Stable partition assignment for a case.
pub fn partition_of(case_id: CaseId, partitions: u32) -> u32 {
    let partitions = u128::from(partitions.max(1));
    (case_id.as_uuid().as_u128() % partitions) as u32
}

/// Partitioned, replayable event stream.
///
/// Implementations must keep per-partition append order and must only hand out
/// records at or after the group's committed offset.
pub trait EventStream: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn partitions(&self) -> u32;

    fn partition_for(&self, case_id: CaseId) -> u32 {
        partition_of(case_id, self.partitions())
    }

    /// Append an envelope to its case's partition.
    fn publish(&self, envelope: EventEnvelope) -> Result<StreamPosition, Self::Error>;

    /// Read up to `max` records starting at the group's committed offset.
    fn poll(
        &self,
        group: &str,
        partition: u32,
        max: usize,
    ) -> Result<Vec<StreamRecord>, Self::Error>;

    /// Record that everything before `next_offset` has been fully processed.
    ///
    /// Commits never move the position backwards; use `seek` for replay.
    fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), Self::Error>;

    fn committed(&self, group: &str, partition: u32) -> Result<u64, Self::Error>;

    /// Move the group's position to `offset` (replay or skip).
    fn seek(&self, group: &str, partition: u32, offset: u64) -> Result<(), Self::Error>;
}

impl<S> EventStream for Arc<S>
where
    S: EventStream + ?Sized,
{
    type Error = S::Error;

    fn partitions(&self) -> u32 {
        (**self).partitions()
    }

    fn publish(&self, envelope: EventEnvelope) -> Result<StreamPosition, Self::Error> {
        (**self).publish(envelope)
    }

    fn poll(
        &self,
        group: &str,
        partition: u32,
        max: usize,
    ) -> Result<Vec<StreamRecord>, Self::Error> {
        (**self).poll(group, partition, max)
    }

    fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), Self::Error> {
        (**self).commit(group, partition, next_offset)
    }

    fn committed(&self, group: &str, partition: u32) -> Result<u64, Self::Error> {
        (**self).committed(group, partition)
    }

    fn seek(&self, group: &str, partition: u32, offset: u64) -> Result<(), Self::Error> {
        (**self).seek(group, partition, offset)
    }
}

//! In-memory event stream for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use thiserror::Error;
use tracing::trace;

use saksflyt_core::CaseId;

use crate::envelope::EventEnvelope;
use crate::stream::{EventStream, StreamPosition, StreamRecord, partition_of};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryStreamError {
    /// Internal lock poisoning.
    #[error("stream lock poisoned")]
    Poisoned,

    #[error("partition {partition} does not exist (partitions: {partitions})")]
    UnknownPartition { partition: u32, partitions: u32 },

    #[error("offset {offset} is past the end of partition {partition} (length {len})")]
    OffsetOutOfRange { partition: u32, offset: u64, len: u64 },
}

/// In-memory partitioned log.
///
/// - No IO / no async
/// - One append-only `Vec` per partition
/// - Committed offsets per `(group, partition)`
#[derive(Debug)]
pub struct InMemoryEventStream {
    partitions: Vec<RwLock<Vec<EventEnvelope>>>,
    offsets: Mutex<HashMap<(String, u32), u64>>,
}

impl InMemoryEventStream {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| RwLock::new(Vec::new())).collect(),
            offsets: Mutex::new(HashMap::new()),
        }
    }

    fn log(&self, partition: u32) -> Result<&RwLock<Vec<EventEnvelope>>, InMemoryStreamError> {
        self.partitions
            .get(partition as usize)
            .ok_or(InMemoryStreamError::UnknownPartition {
                partition,
                partitions: self.partitions.len() as u32,
            })
    }

    /// Number of envelopes in a partition.
    pub fn len(&self, partition: u32) -> Result<u64, InMemoryStreamError> {
        let log = self.log(partition)?.read().map_err(|_| InMemoryStreamError::Poisoned)?;
        Ok(log.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        (0..self.partitions()).all(|p| self.len(p).map(|n| n == 0).unwrap_or(true))
    }

    /// Every envelope ever published for a case, in publication order.
    pub fn history(&self, case_id: CaseId) -> Result<Vec<EventEnvelope>, InMemoryStreamError> {
        let log = self
            .log(self.partition_for(case_id))?
            .read()
            .map_err(|_| InMemoryStreamError::Poisoned)?;
        Ok(log.iter().filter(|env| env.case_id() == case_id).cloned().collect())
    }

    /// Whether `group` has committed everything in every partition.
    pub fn is_drained(&self, group: &str) -> Result<bool, InMemoryStreamError> {
        for partition in 0..self.partitions() {
            if self.committed(group, partition)? < self.len(partition)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl EventStream for InMemoryEventStream {
    type Error = InMemoryStreamError;

    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn publish(&self, envelope: EventEnvelope) -> Result<StreamPosition, Self::Error> {
        let partition = partition_of(envelope.case_id(), self.partitions());
        let mut log = self.log(partition)?.write().map_err(|_| InMemoryStreamError::Poisoned)?;

        let position = StreamPosition {
            partition,
            offset: log.len() as u64,
        };
        trace!(
            partition,
            offset = position.offset,
            event = %envelope.event_name(),
            case_id = %envelope.case_id(),
            "envelope appended"
        );
        log.push(envelope);
        Ok(position)
    }

    fn poll(
        &self,
        group: &str,
        partition: u32,
        max: usize,
    ) -> Result<Vec<StreamRecord>, Self::Error> {
        let start = self.committed(group, partition)?;
        let log = self.log(partition)?.read().map_err(|_| InMemoryStreamError::Poisoned)?;

        Ok(log
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(max)
            .map(|(offset, envelope)| StreamRecord {
                position: StreamPosition {
                    partition,
                    offset: offset as u64,
                },
                envelope: envelope.clone(),
            })
            .collect())
    }

    fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), Self::Error> {
        let len = self.len(partition)?;
        if next_offset > len {
            return Err(InMemoryStreamError::OffsetOutOfRange {
                partition,
                offset: next_offset,
                len,
            });
        }

        let mut offsets = self.offsets.lock().map_err(|_| InMemoryStreamError::Poisoned)?;
        let current = offsets.entry((group.to_string(), partition)).or_insert(0);
        *current = (*current).max(next_offset);
        Ok(())
    }

    fn committed(&self, group: &str, partition: u32) -> Result<u64, Self::Error> {
        self.log(partition)?;
        let offsets = self.offsets.lock().map_err(|_| InMemoryStreamError::Poisoned)?;
        Ok(offsets
            .get(&(group.to_string(), partition))
            .copied()
            .unwrap_or(0))
    }

    fn seek(&self, group: &str, partition: u32, offset: u64) -> Result<(), Self::Error> {
        let len = self.len(partition)?;
        if offset > len {
            return Err(InMemoryStreamError::OffsetOutOfRange {
                partition,
                offset,
                len,
            });
        }

        let mut offsets = self.offsets.lock().map_err(|_| InMemoryStreamError::Poisoned)?;
        offsets.insert((group.to_string(), partition), offset);
        Ok(())
    }
}

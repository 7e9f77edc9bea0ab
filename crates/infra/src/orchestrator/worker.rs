//! Partition workers: poll, dispatch, commit.
//!
//! - Worker `i` of `n` owns every partition `p` with `p % n == i`, so each case is
//!   handled by exactly one thread and its envelopes stay in order
//! - An offset is committed only after `dispatch` returned `Ok`; a failed dispatch
//!   stops the batch and the same record is polled again
//! - Graceful shutdown through [`OrchestratorHandle::shutdown`]

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use saksflyt_events::EventStream;

use super::dispatcher::{DispatchError, DispatchOutcome, Dispatcher};

/// Runtime counters, summed over all workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub envelopes_processed: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub envelopes_rejected: u64,
    pub envelopes_dropped: u64,
    pub envelopes_ignored: u64,
    pub dispatch_errors: u64,
}

impl OrchestratorStats {
    fn count(&mut self, outcomes: &[DispatchOutcome]) {
        self.envelopes_processed += 1;
        for outcome in outcomes {
            match outcome {
                DispatchOutcome::Completed { .. } => self.steps_completed += 1,
                DispatchOutcome::Failed { .. } => self.steps_failed += 1,
                DispatchOutcome::Rejected { .. } => self.envelopes_rejected += 1,
                DispatchOutcome::Dropped { .. } => self.envelopes_dropped += 1,
                DispatchOutcome::Ignored => self.envelopes_ignored += 1,
            }
        }
    }
}

/// Result of [`Orchestrator::run_until_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleReport {
    pub processed: usize,
    pub rounds: usize,
    /// Whether a full round found nothing left to process.
    pub settled: bool,
}

/// Drives a dispatcher from the stream on behalf of one consumer group.
pub struct Orchestrator<S: EventStream> {
    dispatcher: Arc<Dispatcher<S>>,
    group: String,
    workers: u32,
    batch_size: usize,
    poll_interval: Duration,
    stats: Mutex<OrchestratorStats>,
}

impl<S: EventStream + 'static> Orchestrator<S> {
    pub fn new(
        dispatcher: Arc<Dispatcher<S>>,
        group: impl Into<String>,
        workers: u32,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            dispatcher,
            group: group.into(),
            workers: workers.max(1),
            batch_size: batch_size.max(1),
            poll_interval,
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Partitions owned by worker `worker`.
    pub fn partitions_of(&self, worker: u32) -> Vec<u32> {
        (0..self.dispatcher.stream().partitions())
            .filter(|p| p % self.workers == worker)
            .collect()
    }

    /// Process one batch from `partition`; returns how many records were committed.
    pub fn pump_partition(&self, partition: u32) -> Result<usize, DispatchError> {
        let stream = self.dispatcher.stream();
        let records = stream
            .poll(&self.group, partition, self.batch_size)
            .map_err(|e| DispatchError::Stream(e.to_string()))?;

        let mut committed = 0;
        for record in records {
            let outcomes = match self.dispatcher.dispatch(&record.envelope) {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.dispatch_errors += 1;
                    }
                    return Err(err);
                }
            };

            stream
                .commit(&self.group, partition, record.position.offset + 1)
                .map_err(|e| DispatchError::Stream(e.to_string()))?;
            committed += 1;

            if let Ok(mut stats) = self.stats.lock() {
                stats.count(&outcomes);
            }
        }
        Ok(committed)
    }

    /// Pump every partition on the calling thread until nothing is left or
    /// `max_rounds` rounds have run.
    pub fn run_until_idle(&self, max_rounds: usize) -> Result<IdleReport, DispatchError> {
        let mut processed = 0;
        for round in 1..=max_rounds {
            let mut this_round = 0;
            for partition in 0..self.dispatcher.stream().partitions() {
                this_round += self.pump_partition(partition)?;
            }
            processed += this_round;
            if this_round == 0 {
                return Ok(IdleReport {
                    processed,
                    rounds: round,
                    settled: true,
                });
            }
        }

        warn!(max_rounds, processed, "stream did not settle");
        Ok(IdleReport {
            processed,
            rounds: max_rounds,
            settled: false,
        })
    }

    /// Spawn one thread per worker.
    pub fn spawn(self: Arc<Self>) -> OrchestratorHandle {
        let workers = (0..self.workers)
            .map(|index| {
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
                let orchestrator = self.clone();
                let join = thread::Builder::new()
                    .name(format!("saksflyt-worker-{index}"))
                    .spawn(move || worker_loop(&orchestrator, index, shutdown_rx))
                    .expect("failed to spawn partition worker thread");

                WorkerHandle {
                    shutdown: shutdown_tx,
                    join: Some(join),
                }
            })
            .collect();

        OrchestratorHandle { workers }
    }
}

impl<S: EventStream> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("group", &self.group)
            .field("workers", &self.workers)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

fn worker_loop<S: EventStream + 'static>(
    orchestrator: &Orchestrator<S>,
    index: u32,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let partitions = orchestrator.partitions_of(index);
    info!(worker = index, ?partitions, group = orchestrator.group(), "partition worker started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let mut processed = 0;
        for &partition in &partitions {
            match orchestrator.pump_partition(partition) {
                Ok(n) => processed += n,
                Err(err) => warn!(worker = index, partition, error = %err, "partition pump failed"),
            }
        }

        if processed == 0 {
            match shutdown_rx.recv_timeout(orchestrator.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        } else {
            debug!(worker = index, processed, "batch committed");
        }
    }

    info!(worker = index, "partition worker stopped");
}

/// Handle to control and join one background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    fn join(mut self) {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Handle to every worker of a spawned orchestrator.
#[derive(Debug)]
pub struct OrchestratorHandle {
    workers: Vec<WorkerHandle>,
}

impl OrchestratorHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.signal();
        }
        for worker in self.workers {
            worker.join();
        }
    }
}

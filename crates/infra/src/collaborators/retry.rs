//! Bounded retry with backoff for synchronous collaborator calls.
//!
//! This handles transient failures *within* one step execution. A step that fails
//! outright is retried by the failure & retry channel instead.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::{Reply, TransportError};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for one collaborator call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (at least 1).
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
    /// Time budget for the whole call, retries and sleeps included.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Fixed delays, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Delay before retrying after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic pseudo-jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Per-attempt context handed to the remote call, so it can bound its own I/O.
#[derive(Debug, Clone)]
pub struct CallContext {
    operation: &'static str,
    attempt: u32,
    deadline: Instant,
}

impl CallContext {
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// 1-indexed attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time left before the call's deadline; use it as the request timeout.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{operation}: gave up after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("{operation}: deadline of {deadline:?} exceeded after {attempts} attempt(s)")]
    DeadlineExceeded {
        operation: &'static str,
        attempts: u32,
        deadline: Duration,
    },

    /// The collaborator answered with a non-retryable error.
    #[error("{operation}: rejected ({code}): {message}")]
    Rejected {
        operation: &'static str,
        code: String,
        message: String,
    },
}

/// Call a collaborator with bounded retries and unwrap its reply.
///
/// Transport errors and retryable remote errors are retried with backoff until
/// `max_attempts` or the deadline is reached; a non-retryable remote error fails
/// immediately.
///
/// Each attempt runs on its own thread and is awaited for at most the time left
/// before the deadline. An attempt still running at the deadline is abandoned and
/// its late answer discarded. A panic inside the call resumes on the caller's
/// thread.
pub fn call_with_retry<T, F>(
    policy: &RetryPolicy,
    operation: &'static str,
    call: F,
) -> Result<T, CollaboratorError>
where
    T: Send + 'static,
    F: FnMut(&CallContext) -> Result<Reply<T>, TransportError> + Send + 'static,
{
    let started = Instant::now();
    let deadline = started + policy.deadline;
    let call = Arc::new(Mutex::new(call));
    let mut attempt = 0;

    let deadline_exceeded = |attempts: u32| CollaboratorError::DeadlineExceeded {
        operation,
        attempts,
        deadline: policy.deadline,
    };

    loop {
        attempt += 1;
        let ctx = CallContext {
            operation,
            attempt,
            deadline,
        };

        let outcome = match run_attempt(&call, &ctx) {
            Attempt::Answered(outcome) => outcome,
            Attempt::TimedOut => {
                warn!(operation, attempt, "collaborator call did not answer before the deadline");
                return Err(deadline_exceeded(attempt));
            }
            Attempt::Panicked(payload) => panic::resume_unwind(payload),
        };

        let last_error = match outcome {
            Ok(Reply::Ok(value)) => {
                if attempt > 1 {
                    debug!(operation, attempt, "collaborator call recovered");
                }
                return Ok(value);
            }
            Ok(Reply::Err(remote)) if !remote.retryable => {
                return Err(CollaboratorError::Rejected {
                    operation,
                    code: remote.code,
                    message: remote.message,
                });
            }
            Ok(Reply::Err(remote)) => format!("{}: {}", remote.code, remote.message),
            Err(transport) => transport.to_string(),
        };

        if !policy.should_retry(attempt) {
            warn!(operation, attempt, error = %last_error, "collaborator retries exhausted");
            return Err(CollaboratorError::RetryExhausted {
                operation,
                attempts: attempt,
                last_error,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        if Instant::now() + delay >= deadline {
            warn!(operation, attempt, error = %last_error, "collaborator deadline exceeded");
            return Err(deadline_exceeded(attempt));
        }

        debug!(operation, attempt, ?delay, error = %last_error, "retrying collaborator call");
        thread::sleep(delay);
    }
}

enum Attempt<T> {
    Answered(Result<Reply<T>, TransportError>),
    TimedOut,
    Panicked(Box<dyn Any + Send>),
}

fn run_attempt<T, F>(call: &Arc<Mutex<F>>, ctx: &CallContext) -> Attempt<T>
where
    T: Send + 'static,
    F: FnMut(&CallContext) -> Result<Reply<T>, TransportError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let worker_call = Arc::clone(call);
    let worker_ctx = ctx.clone();

    let spawned = thread::Builder::new()
        .name(format!("{}#{}", ctx.operation, ctx.attempt))
        .spawn(move || {
            let Ok(mut call) = worker_call.lock() else {
                return;
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (&mut *call)(&worker_ctx)));
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return Attempt::Answered(Err(TransportError::new(format!("failed to spawn call thread: {e}"))));
    }

    match rx.recv_timeout(ctx.remaining()) {
        Ok(Ok(outcome)) => Attempt::Answered(outcome),
        Ok(Err(payload)) => Attempt::Panicked(payload),
        Err(RecvTimeoutError::Timeout) => Attempt::TimedOut,
        // The call panicked outside the unwind guard and poisoned its lock.
        Err(RecvTimeoutError::Disconnected) => {
            Attempt::Answered(Err(TransportError::new("collaborator call thread ended without answer")))
        }
    }
}

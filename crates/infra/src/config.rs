//! Orchestrator configuration, read from `SAKSFLYT_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use saksflyt_events::ServiceIdentity;

use crate::collaborators::{BackoffStrategy, RetryPolicy};

pub const ENV_SERVICE: &str = "SAKSFLYT_SERVICE";
pub const ENV_INSTANCE: &str = "SAKSFLYT_INSTANCE";
pub const ENV_CONSUMER_GROUP: &str = "SAKSFLYT_CONSUMER_GROUP";
pub const ENV_PARTITIONS: &str = "SAKSFLYT_PARTITIONS";
pub const ENV_WORKERS: &str = "SAKSFLYT_WORKERS";
pub const ENV_POLL_INTERVAL_MS: &str = "SAKSFLYT_POLL_INTERVAL_MS";
pub const ENV_BATCH_SIZE: &str = "SAKSFLYT_BATCH_SIZE";
pub const ENV_MAX_HOPS: &str = "SAKSFLYT_MAX_HOPS";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "SAKSFLYT_RETRY_MAX_ATTEMPTS";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "SAKSFLYT_RETRY_BASE_DELAY_MS";
pub const ENV_RETRY_MAX_DELAY_MS: &str = "SAKSFLYT_RETRY_MAX_DELAY_MS";
pub const ENV_CALL_DEADLINE_MS: &str = "SAKSFLYT_CALL_DEADLINE_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Service name stamped into provenance; also owns the retry channel's steps.
    pub service: String,
    /// Instance name stamped into provenance
    pub instance: String,
    /// Consumer group whose offsets this orchestrator commits
    pub consumer_group: String,
    /// Number of stream partitions
    pub partitions: u32,
    /// Worker threads; worker `i` owns partitions `p % workers == i`
    pub workers: u32,
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Records per poll
    pub batch_size: usize,
    /// Envelopes with more hops than this are treated as a runaway loop
    pub max_hops: u32,
    /// Retry policy for every collaborator call
    pub collaborator_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service: "saksflyt".to_string(),
            instance: Uuid::now_v7().to_string(),
            consumer_group: "saksflyt".to_string(),
            partitions: 8,
            workers: 4,
            poll_interval: Duration::from_millis(100),
            batch_size: 64,
            max_hops: 64,
            collaborator_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_millis(5_000),
                strategy: BackoffStrategy::Exponential,
                jitter: 0.1,
                deadline: Duration::from_millis(30_000),
            },
        }
    }
}

impl OrchestratorConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let service = lookup(ENV_SERVICE)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.service);
        let instance = lookup(ENV_INSTANCE)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.instance);
        let consumer_group = lookup(ENV_CONSUMER_GROUP)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| service.clone());

        let config = Self {
            partitions: parse_or(&lookup, ENV_PARTITIONS, defaults.partitions)?,
            workers: parse_or(&lookup, ENV_WORKERS, defaults.workers)?,
            poll_interval: millis_or(&lookup, ENV_POLL_INTERVAL_MS, defaults.poll_interval)?,
            batch_size: parse_or(&lookup, ENV_BATCH_SIZE, defaults.batch_size)?,
            max_hops: parse_or(&lookup, ENV_MAX_HOPS, defaults.max_hops)?,
            collaborator_retry: RetryPolicy {
                max_attempts: parse_or(
                    &lookup,
                    ENV_RETRY_MAX_ATTEMPTS,
                    defaults.collaborator_retry.max_attempts,
                )?,
                base_delay: millis_or(
                    &lookup,
                    ENV_RETRY_BASE_DELAY_MS,
                    defaults.collaborator_retry.base_delay,
                )?,
                max_delay: millis_or(
                    &lookup,
                    ENV_RETRY_MAX_DELAY_MS,
                    defaults.collaborator_retry.max_delay,
                )?,
                deadline: millis_or(
                    &lookup,
                    ENV_CALL_DEADLINE_MS,
                    defaults.collaborator_retry.deadline,
                )?,
                ..defaults.collaborator_retry
            },
            service,
            instance,
            consumer_group,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        non_zero(ENV_PARTITIONS, u64::from(self.partitions))?;
        non_zero(ENV_WORKERS, u64::from(self.workers))?;
        non_zero(ENV_BATCH_SIZE, self.batch_size as u64)?;
        non_zero(ENV_RETRY_MAX_ATTEMPTS, u64::from(self.collaborator_retry.max_attempts))?;
        Ok(())
    }

    /// Identity stamped onto every envelope this orchestrator publishes.
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.service.clone(), self.instance.clone())
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_collaborator_retry(mut self, policy: RetryPolicy) -> Self {
        self.collaborator_retry = policy;
        self
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let ms = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn non_zero(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.service, "saksflyt");
        assert_eq!(config.consumer_group, "saksflyt");
        assert_eq!(config.partitions, 8);
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_hops, 64);
        assert_eq!(config.collaborator_retry.max_attempts, 3);
        assert_eq!(config.collaborator_retry.deadline, Duration::from_secs(30));
        assert!(!config.instance.is_empty());
    }

    #[test]
    fn consumer_group_defaults_to_service() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            (ENV_SERVICE, "behandling"),
            (ENV_INSTANCE, "pod-1"),
            (ENV_RETRY_BASE_DELAY_MS, "50"),
        ]))
        .unwrap();

        assert_eq!(config.consumer_group, "behandling");
        assert_eq!(config.identity().to_string(), "behandling/pod-1");
        assert_eq!(config.collaborator_retry.base_delay, Duration::from_millis(50));
    }

    #[test]
    fn rejects_unparseable_and_zero_values() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(ENV_PARTITIONS, "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_PARTITIONS, .. }));

        let err = OrchestratorConfig::from_lookup(lookup(&[(ENV_WORKERS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_WORKERS, .. }));

        let err =
            OrchestratorConfig::from_lookup(lookup(&[(ENV_RETRY_MAX_ATTEMPTS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_RETRY_MAX_ATTEMPTS, .. }));
    }
}

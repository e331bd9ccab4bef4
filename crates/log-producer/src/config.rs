// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::constants;
use crate::errors::ProducerError;
use crate::log::LogTag;

const MIN_LINGER: Duration = Duration::from_millis(100);

/// Configuration of the producer engine.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Ceiling of bytes admitted but not yet delivered or dropped
    pub total_size_in_bytes: i64,
    /// Maximum number of sends running at the same time
    pub max_io_worker_count: usize,
    /// How long a caller may wait for pending bytes to drain.
    /// `None` waits forever, `Duration::ZERO` fails immediately.
    pub max_block: Option<Duration>,
    /// A batch is sealed once it holds this many bytes
    pub max_batch_size: i64,
    /// A batch is sealed once it holds this many records
    pub max_batch_count: usize,
    /// Maximum time an open batch waits before it is sent anyway
    pub linger: Duration,
    /// Retry budget of a batch
    pub retries: u32,
    /// Number of attempts kept in a batch result
    pub max_reserved_attempts: usize,
    pub base_retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    /// Status codes that fail a batch without retrying it
    pub no_retry_status_codes: HashSet<u16>,
    /// Tag every batch with a `__pack_id__` for server side deduplication
    pub generate_pack_id: bool,
    /// Tags attached to every batch
    pub log_tags: Vec<LogTag>,
    /// Send through the metric store ingestion path
    pub use_metric_store_url: bool,
    /// Interval of the monitor status report
    pub report_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            total_size_in_bytes: constants::DEFAULT_TOTAL_SIZE_IN_BYTES,
            max_io_worker_count: constants::DEFAULT_MAX_IO_WORKER_COUNT,
            max_block: Some(Duration::from_secs(constants::DEFAULT_MAX_BLOCK_SECS)),
            max_batch_size: constants::DEFAULT_MAX_BATCH_SIZE,
            max_batch_count: constants::DEFAULT_MAX_BATCH_COUNT,
            linger: Duration::from_millis(constants::DEFAULT_LINGER_MS),
            retries: constants::DEFAULT_RETRIES,
            max_reserved_attempts: constants::DEFAULT_MAX_RESERVED_ATTEMPTS,
            base_retry_backoff_ms: constants::DEFAULT_BASE_RETRY_BACKOFF_MS,
            max_retry_backoff_ms: constants::DEFAULT_MAX_RETRY_BACKOFF_MS,
            no_retry_status_codes: constants::DEFAULT_NO_RETRY_STATUS_CODES
                .into_iter()
                .collect(),
            generate_pack_id: true,
            log_tags: Vec::new(),
            use_metric_store_url: false,
            report_interval: Duration::from_secs(constants::DEFAULT_REPORT_INTERVAL_SECS),
        }
    }
}

impl ProducerConfig {
    /// Create configuration from `LOG_PRODUCER_*` environment variables,
    /// falling back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Self, ProducerError> {
        let defaults = Self::default();

        let max_block = match env::var("LOG_PRODUCER_MAX_BLOCK_MS")
            .ok()
            .and_then(|val| val.parse::<i64>().ok())
        {
            Some(ms) if ms < 0 => None,
            Some(ms) => Some(Duration::from_millis(ms.unsigned_abs())),
            None => defaults.max_block,
        };
        let no_retry_status_codes = env::var("LOG_PRODUCER_NO_RETRY_STATUS_CODES")
            .ok()
            .map(|val| {
                val.split(',')
                    .filter_map(|code| code.trim().parse::<u16>().ok())
                    .collect()
            })
            .unwrap_or(defaults.no_retry_status_codes);

        let config = Self {
            total_size_in_bytes: parse_env("LOG_PRODUCER_TOTAL_SIZE_IN_BYTES")
                .unwrap_or(defaults.total_size_in_bytes),
            max_io_worker_count: parse_env("LOG_PRODUCER_MAX_IO_WORKER_COUNT")
                .unwrap_or(defaults.max_io_worker_count),
            max_block,
            max_batch_size: parse_env("LOG_PRODUCER_MAX_BATCH_SIZE")
                .unwrap_or(defaults.max_batch_size),
            max_batch_count: parse_env("LOG_PRODUCER_MAX_BATCH_COUNT")
                .unwrap_or(defaults.max_batch_count),
            linger: parse_env("LOG_PRODUCER_LINGER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.linger),
            retries: parse_env("LOG_PRODUCER_RETRIES").unwrap_or(defaults.retries),
            max_reserved_attempts: parse_env("LOG_PRODUCER_MAX_RESERVED_ATTEMPTS")
                .unwrap_or(defaults.max_reserved_attempts),
            base_retry_backoff_ms: parse_env("LOG_PRODUCER_BASE_RETRY_BACKOFF_MS")
                .unwrap_or(defaults.base_retry_backoff_ms),
            max_retry_backoff_ms: parse_env("LOG_PRODUCER_MAX_RETRY_BACKOFF_MS")
                .unwrap_or(defaults.max_retry_backoff_ms),
            no_retry_status_codes,
            generate_pack_id: env::var("LOG_PRODUCER_GENERATE_PACK_ID")
                .map(|val| val.to_lowercase() != "false")
                .unwrap_or(defaults.generate_pack_id),
            log_tags: defaults.log_tags,
            use_metric_store_url: env::var("LOG_PRODUCER_USE_METRIC_STORE_URL")
                .map(|val| val.to_lowercase() == "true")
                .unwrap_or(defaults.use_metric_store_url),
            report_interval: parse_env("LOG_PRODUCER_REPORT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.report_interval),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ProducerError> {
        if self.total_size_in_bytes <= 0 {
            return Err(ProducerError::InvalidConfig(
                "total_size_in_bytes must be greater than 0".to_string(),
            ));
        }
        if self.max_batch_size <= 0 {
            return Err(ProducerError::InvalidConfig(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_batch_count == 0 {
            return Err(ProducerError::InvalidConfig(
                "max_batch_count must be greater than 0".to_string(),
            ));
        }
        if self.base_retry_backoff_ms > self.max_retry_backoff_ms {
            return Err(ProducerError::InvalidConfig(format!(
                "base_retry_backoff_ms ({}) exceeds max_retry_backoff_ms ({})",
                self.base_retry_backoff_ms, self.max_retry_backoff_ms
            )));
        }
        if self.report_interval.is_zero() {
            return Err(ProducerError::InvalidConfig(
                "report_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamps values the service or the engine cannot honor.
    #[must_use]
    pub fn adjusted(mut self) -> Self {
        if self.max_reserved_attempts == 0 {
            warn!("max_reserved_attempts must be at least 1, using 1");
            self.max_reserved_attempts = 1;
        }
        if self.max_batch_count > constants::MAX_BATCH_COUNT_LIMIT {
            warn!(
                "max_batch_count {} exceeds the limit, using {}",
                self.max_batch_count,
                constants::MAX_BATCH_COUNT_LIMIT
            );
            self.max_batch_count = constants::MAX_BATCH_COUNT_LIMIT;
        }
        if self.max_batch_size > constants::MAX_BATCH_SIZE_LIMIT {
            warn!(
                "max_batch_size {} exceeds the limit, using {}",
                self.max_batch_size,
                constants::MAX_BATCH_SIZE_LIMIT
            );
            self.max_batch_size = constants::MAX_BATCH_SIZE_LIMIT;
        }
        if self.max_io_worker_count == 0 {
            warn!("max_io_worker_count must be at least 1, using 1");
            self.max_io_worker_count = 1;
        }
        if self.base_retry_backoff_ms == 0 {
            self.base_retry_backoff_ms = constants::DEFAULT_BASE_RETRY_BACKOFF_MS;
        }
        if self.max_retry_backoff_ms == 0 {
            self.max_retry_backoff_ms = constants::DEFAULT_MAX_RETRY_BACKOFF_MS;
        }
        if self.linger < MIN_LINGER {
            warn!("linger {:?} is below the minimum, using {:?}", self.linger, MIN_LINGER);
            self.linger = MIN_LINGER;
        }
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

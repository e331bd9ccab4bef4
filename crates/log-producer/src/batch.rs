// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of accumulation and delivery.
//!
//! A [`ProducerBatch`] is created by the accumulator on the first record for a
//! routing key and is owned by exactly one component at a time: the open-batch
//! map, the worker pool queue, a sending task, or the retry queue. Moving the
//! value between them is what guarantees a batch is never in flight twice.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::error;

use crate::client::SendError;
use crate::config::ProducerConfig;
use crate::constants::{DELIMITER, PACK_ID_KEY};
use crate::log::{Log, LogGroup, LogTag};
use crate::pack_id::PackIdGenerator;

/// Where a batch is delivered and how its records are partitioned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Destination {
    pub project: String,
    pub logstore: String,
    pub topic: String,
    pub source: String,
    pub shard_hash: Option<String>,
}

impl Destination {
    pub fn new(project: impl Into<String>, logstore: impl Into<String>) -> Self {
        Destination {
            project: project.into(),
            logstore: logstore.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// An empty hash means "no shard preference".
    #[must_use]
    pub fn with_shard_hash(mut self, shard_hash: impl Into<String>) -> Self {
        let shard_hash = shard_hash.into();
        self.shard_hash = (!shard_hash.is_empty()).then_some(shard_hash);
        self
    }

    /// Key of the open batch records for this destination accumulate into.
    pub fn routing_key(&self) -> String {
        let shard_hash = self.shard_hash.as_deref().unwrap_or_default();
        let mut key = String::with_capacity(
            self.project.len()
                + self.logstore.len()
                + self.topic.len()
                + shard_hash.len()
                + self.source.len()
                + DELIMITER.len() * 4,
        );
        for (i, part) in [
            self.project.as_str(),
            self.logstore.as_str(),
            self.topic.as_str(),
            shard_hash,
            self.source.as_str(),
        ]
        .into_iter()
        .enumerate()
        {
            if i > 0 {
                key.push_str(DELIMITER);
            }
            key.push_str(part);
        }
        key
    }
}

/// Snapshot of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub success: bool,
    pub request_id: String,
    pub error_code: String,
    pub error_message: String,
    /// Unix time in milliseconds when the attempt finished
    pub timestamp_ms: u64,
    /// How long the attempt took, in milliseconds
    pub time_ms: u64,
}

/// Outcome of a batch handed to its callbacks.
#[derive(Debug, Clone, Default)]
pub struct ProducerResult {
    successful: bool,
    attempts: Vec<Attempt>,
}

impl ProducerResult {
    pub fn is_successful(&self) -> bool {
        self.successful
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn request_id(&self) -> &str {
        self.last_attempt().map_or("", |a| a.request_id.as_str())
    }

    pub fn error_code(&self) -> &str {
        self.last_attempt().map_or("", |a| a.error_code.as_str())
    }

    pub fn error_message(&self) -> &str {
        self.last_attempt().map_or("", |a| a.error_message.as_str())
    }

    pub fn time_ms(&self) -> u64 {
        self.last_attempt().map_or(0, |a| a.time_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Delivered(&'a ProducerResult),
    Failed(&'a ProducerResult),
}

impl<'a> Outcome<'a> {
    pub fn result(&self) -> &'a ProducerResult {
        match self {
            Outcome::Delivered(result) | Outcome::Failed(result) => result,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered(_))
    }
}

/// Observer of the final outcome of the batch a record landed in.
///
/// Runs on the sending task, so it should return quickly.
pub trait Callback: Send + Sync {
    fn on_complete(&self, outcome: Outcome<'_>);
}

impl<F> Callback for F
where
    F: Fn(Outcome<'_>) + Send + Sync,
{
    fn on_complete(&self, outcome: Outcome<'_>) {
        self(outcome)
    }
}

pub struct ProducerBatch {
    // read only
    destination: Destination,
    create_time: Instant,
    max_retry_backoff_ms: u64,
    base_retry_backoff_ms: u64,
    max_retry_times: u32,
    max_reserved_attempts: usize,
    use_metric_store_url: bool,

    // read only once sealed
    total_data_size: i64,
    log_group: LogGroup,
    callbacks: Vec<Arc<dyn Callback>>,

    // touched by one owner at a time
    attempt_count: u32,
    next_retry: Instant,
    result: ProducerResult,
}

impl std::fmt::Debug for ProducerBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerBatch")
            .field("destination", &self.destination)
            .field("logs", &self.log_group.logs.len())
            .field("total_data_size", &self.total_data_size)
            .field("attempt_count", &self.attempt_count)
            .finish_non_exhaustive()
    }
}

impl ProducerBatch {
    pub fn new(
        pack_id_generator: &PackIdGenerator,
        destination: Destination,
        config: &ProducerConfig,
    ) -> Self {
        let mut log_tags = Vec::with_capacity(config.log_tags.len() + 1);
        log_tags.extend_from_slice(&config.log_tags);
        if config.generate_pack_id {
            log_tags.push(LogTag::new(
                PACK_ID_KEY,
                pack_id_generator.generate_pack_id(&destination.project, &destination.logstore),
            ));
        }
        let log_group = LogGroup {
            topic: destination.topic.clone(),
            source: destination.source.clone(),
            logs: Vec::with_capacity(config.max_batch_count.min(1024) + 4),
            log_tags,
        };
        let now = Instant::now();

        ProducerBatch {
            destination,
            create_time: now,
            max_retry_backoff_ms: config.max_retry_backoff_ms,
            base_retry_backoff_ms: config.base_retry_backoff_ms,
            max_retry_times: config.retries,
            max_reserved_attempts: config.max_reserved_attempts,
            use_metric_store_url: config.use_metric_store_url,
            total_data_size: 0,
            log_group,
            callbacks: Vec::new(),
            attempt_count: 0,
            next_retry: now,
            result: ProducerResult::default(),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn project(&self) -> &str {
        &self.destination.project
    }

    pub fn logstore(&self) -> &str {
        &self.destination.logstore
    }

    pub fn shard_hash(&self) -> Option<&str> {
        self.destination.shard_hash.as_deref()
    }

    pub fn use_metric_store_url(&self) -> bool {
        self.use_metric_store_url
    }

    pub fn create_time(&self) -> Instant {
        self.create_time
    }

    pub fn log_group(&self) -> &LogGroup {
        &self.log_group
    }

    pub fn log_count(&self) -> usize {
        self.log_group.logs.len()
    }

    pub fn total_data_size(&self) -> i64 {
        self.total_data_size
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_retry_times(&self) -> u32 {
        self.max_retry_times
    }

    pub fn next_retry(&self) -> Instant {
        self.next_retry
    }

    pub fn set_next_retry(&mut self, next_retry: Instant) {
        self.next_retry = next_retry;
    }

    pub fn result(&self) -> &ProducerResult {
        &self.result
    }

    pub fn meets_send_condition(&self, max_batch_size: i64, max_batch_count: usize) -> bool {
        self.total_data_size >= max_batch_size || self.log_group.logs.len() >= max_batch_count
    }

    pub fn add_log(&mut self, log: Log, size: i64, callback: Option<Arc<dyn Callback>>) {
        self.log_group.logs.push(log);
        self.total_data_size += size;
        self.callbacks.extend(callback);
    }

    pub fn add_log_list(&mut self, logs: Vec<Log>, size: i64, callback: Option<Arc<dyn Callback>>) {
        self.log_group.logs.extend(logs);
        self.total_data_size += size;
        self.callbacks.extend(callback);
    }

    /// `base * 2^(attempts - 1)`, capped at the configured maximum.
    pub fn retry_backoff(&self) -> Duration {
        let exponent = self.attempt_count.saturating_sub(1);
        let backoff_ms = 2u64
            .checked_pow(exponent)
            .and_then(|factor| self.base_retry_backoff_ms.checked_mul(factor))
            .unwrap_or(u64::MAX)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(backoff_ms)
    }

    /// Records the outcome of a send attempt that started at `begin`.
    ///
    /// The attempt counter always moves; the attempt itself is only kept while
    /// fewer than `max_reserved_attempts` were recorded.
    pub fn add_attempt(&mut self, err: Option<&SendError>, begin: Instant) {
        self.result.successful = err.is_none();
        self.attempt_count += 1;

        if self.attempt_count as usize > self.max_reserved_attempts {
            return;
        }

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let time_ms = begin.elapsed().as_millis() as u64;
        let attempt = match err {
            None => Attempt {
                success: true,
                request_id: String::new(),
                error_code: String::new(),
                error_message: String::new(),
                timestamp_ms,
                time_ms,
            },
            Some(err) => Attempt {
                success: false,
                request_id: err.request_id.clone(),
                error_code: err.code.clone(),
                error_message: err.message.clone(),
                timestamp_ms,
                time_ms,
            },
        };
        self.result.attempts.push(attempt);
    }

    pub fn on_success(&mut self, begin: Instant) {
        self.add_attempt(None, begin);
        self.notify(Outcome::Delivered(&self.result));
    }

    pub fn on_fail(&mut self, err: &SendError, begin: Instant) {
        self.add_attempt(Some(err), begin);
        self.notify(Outcome::Failed(&self.result));
    }

    fn notify(&self, outcome: Outcome<'_>) {
        for callback in &self.callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback.on_complete(outcome))).is_err() {
                error!(
                    project = %self.destination.project,
                    logstore = %self.destination.logstore,
                    "Callback panicked, ignoring"
                );
            }
        }
    }
}

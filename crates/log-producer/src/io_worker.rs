// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sends one batch and decides what happens to it afterwards.
//!
//! # Outcome handling
//!
//! - **Success**: success callbacks fire and the batch's bytes are released
//! - **Retryable failure**: the attempt is recorded, the next retry is
//!   scheduled after the batch's backoff and the batch moves to the retry
//!   queue; its bytes stay accounted as pending
//! - **Terminal failure**: retries disabled, a non-retryable status code, or
//!   the retry budget is spent; failure callbacks fire and the bytes are released

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::batch::ProducerBatch;
use crate::client::{LogClient, SendError};
use crate::monitor::ProducerMonitor;
use crate::retry_queue::RetryQueue;

pub struct IoWorker {
    client: Arc<dyn LogClient>,
    retry_queue: Arc<RetryQueue>,
    retry_disabled: AtomicBool,
    no_retry_status_codes: HashSet<u16>,
    monitor: Arc<ProducerMonitor>,
    pending_bytes: Arc<AtomicI64>,
    task_count: AtomicI64,
}

impl IoWorker {
    pub fn new(
        client: Arc<dyn LogClient>,
        retry_queue: Arc<RetryQueue>,
        no_retry_status_codes: HashSet<u16>,
        monitor: Arc<ProducerMonitor>,
        pending_bytes: Arc<AtomicI64>,
    ) -> Self {
        IoWorker {
            client,
            retry_queue,
            retry_disabled: AtomicBool::new(false),
            no_retry_status_codes,
            monitor,
            pending_bytes,
            task_count: AtomicI64::new(0),
        }
    }

    pub async fn send_to_server(&self, mut batch: ProducerBatch) {
        debug!(
            project = %batch.project(),
            logstore = %batch.logstore(),
            logs = batch.log_count(),
            "Send data to server"
        );
        let send_begin = Instant::now();
        let result = if batch.use_metric_store_url() {
            self.client
                .put_logs_with_metric_store_url(batch.project(), batch.logstore(), batch.log_group())
                .await
        } else {
            self.client
                .put_logs(
                    batch.project(),
                    batch.logstore(),
                    batch.shard_hash(),
                    batch.log_group(),
                )
                .await
        };
        let send_end = Instant::now();

        let err = match result {
            Ok(()) => {
                debug!("Send to server succeeded");
                batch.on_success(send_begin);
                self.monitor
                    .record_success(send_begin, send_end, batch.total_data_size());
                self.release(&batch);
                return;
            }
            Err(err) => err,
        };

        let can_retry = self.can_retry(&batch, &err);
        error!(
            retry_times = batch.attempt_count(),
            request_id = %err.request_id,
            error_code = %err.code,
            error_message = %err.message,
            http_code = ?err.http_code,
            logs = batch.log_count(),
            can_retry,
            "Send to server failed"
        );
        if !can_retry {
            batch.on_fail(&err, send_begin);
            self.monitor.record_failure(send_begin, send_end);
            self.release(&batch);
            return;
        }

        self.monitor.record_retry(send_end.duration_since(send_begin));
        batch.add_attempt(Some(&err), send_begin);
        batch.set_next_retry(Instant::now() + batch.retry_backoff());
        self.retry_queue.send_to_retry_queue(batch);
    }

    /// Whether a batch that just failed with `err` gets another attempt.
    ///
    /// The attempt that just failed counts against the budget, so a batch is
    /// sent at most `max_retry_times` times.
    pub fn can_retry(&self, batch: &ProducerBatch, err: &SendError) -> bool {
        if self.retry_disabled.load(Ordering::SeqCst) {
            return false;
        }
        if err
            .http_code
            .is_some_and(|code| self.no_retry_status_codes.contains(&code))
        {
            return false;
        }
        batch.attempt_count() + 1 < batch.max_retry_times()
    }

    /// Every failure from now on is terminal.
    pub fn disable_retry(&self) {
        self.retry_disabled.store(true, Ordering::SeqCst);
    }

    /// Fails a batch that will never reach the network.
    pub fn fail_batch(&self, mut batch: ProducerBatch, err: &SendError) {
        let begin = Instant::now();
        batch.on_fail(err, begin);
        self.monitor.record_failure(begin, Instant::now());
        self.release(&batch);
    }

    /// Fails whatever is still parked in the retry queue. Used once every send
    /// finished during shutdown.
    pub fn fail_stranded(&self) -> usize {
        let stranded = self.retry_queue.get_retry_batches(true);
        let count = stranded.len();
        if count > 0 {
            warn!("Failing {count} batches left in the retry queue at shutdown");
        }
        let err = SendError::network("producer shut down before the batch could be retried");
        for batch in stranded {
            self.fail_batch(batch, &err);
        }
        count
    }

    pub fn start_send_task(&self) {
        self.task_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn close_send_task(&self) {
        self.task_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sends currently running.
    pub fn task_count(&self) -> i64 {
        self.task_count.load(Ordering::SeqCst)
    }

    fn release(&self, batch: &ProducerBatch) {
        self.pending_bytes
            .fetch_sub(batch.total_data_size(), Ordering::SeqCst);
    }
}

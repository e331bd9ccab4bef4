// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-window producer metrics, reported and reset on every tick.
//!
//! Recorders load the current [`ProducerMetrics`] and bump its atomics; the
//! reporter swaps in a fresh, zeroed window and logs the old one. A window is
//! replaced as a whole and never partially reset.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::histogram::TimeHistogram;

#[derive(Debug, Default)]
pub struct ProducerMetrics {
    /// Latency of send attempts
    pub send_batch: TimeHistogram,
    pub retry_count: AtomicI64,
    pub create_batch: AtomicI64,
    /// Batches that failed terminally
    pub failure_count: AtomicI64,
    /// Bytes of successfully delivered batches
    pub sent_bytes: AtomicI64,
    /// Time spent in success callbacks
    pub on_success: TimeHistogram,
    /// Time spent in failure callbacks
    pub on_fail: TimeHistogram,
    /// Time callers waited for pending memory
    pub wait_memory: TimeHistogram,
    pub wait_memory_fail_count: AtomicI64,
}

pub struct ProducerMonitor {
    metrics: ArcSwap<ProducerMetrics>,
}

impl Default for ProducerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn micros(d: Duration) -> f64 {
    d.as_micros() as f64
}

impl ProducerMonitor {
    pub fn new() -> Self {
        ProducerMonitor {
            metrics: ArcSwap::from_pointee(ProducerMetrics::default()),
        }
    }

    pub fn record_success(&self, send_begin: Instant, send_end: Instant, bytes: i64) {
        let metrics = self.metrics.load();
        metrics
            .send_batch
            .add_sample(micros(send_end.duration_since(send_begin)));
        metrics.on_success.add_sample(micros(send_end.elapsed()));
        metrics.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self, send_begin: Instant, send_end: Instant) {
        let metrics = self.metrics.load();
        metrics
            .send_batch
            .add_sample(micros(send_end.duration_since(send_begin)));
        metrics.on_fail.add_sample(micros(send_end.elapsed()));
        metrics.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, send_cost: Duration) {
        let metrics = self.metrics.load();
        metrics.send_batch.add_sample(micros(send_cost));
        metrics.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_memory(&self, start: Instant) {
        self.metrics
            .load()
            .wait_memory
            .add_sample(micros(start.elapsed()));
    }

    pub fn inc_wait_memory_fail(&self) {
        self.metrics
            .load()
            .wait_memory_fail_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_create_batch(&self) {
        self.metrics
            .load()
            .create_batch
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current window, still being recorded into.
    pub fn current(&self) -> Arc<ProducerMetrics> {
        self.metrics.load_full()
    }

    /// Closes the current window and starts a new one.
    pub fn get_and_reset_metrics(&self) -> Arc<ProducerMetrics> {
        self.metrics.swap(Arc::new(ProducerMetrics::default()))
    }

    pub fn report(&self) {
        let metrics = self.get_and_reset_metrics();
        info!(
            send_batch = %metrics.send_batch,
            retry_count = metrics.retry_count.load(Ordering::Relaxed),
            create_batch = metrics.create_batch.load(Ordering::Relaxed),
            failure_count = metrics.failure_count.load(Ordering::Relaxed),
            sent_bytes = metrics.sent_bytes.load(Ordering::Relaxed),
            on_success = %metrics.on_success,
            on_fail = %metrics.on_fail,
            wait_memory = %metrics.wait_memory,
            wait_memory_fail_count = metrics.wait_memory_fail_count.load(Ordering::Relaxed),
            "report status"
        );
    }

    pub async fn run_reporter(&self, report_interval: Duration, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(report_interval);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.report(),
                () = cancel_token.cancelled() => {
                    debug!("Monitor reporter stopped");
                    return;
                }
            }
        }
    }
}

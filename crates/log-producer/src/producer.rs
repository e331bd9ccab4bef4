// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Public entry point: wires the engine together and applies backpressure on
//! pending memory before records reach the accumulator.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accumulator::LogAccumulator;
use crate::batch::{Callback, Destination};
use crate::client::LogClient;
use crate::config::ProducerConfig;
use crate::constants::WAIT_MEMORY_STEP_MS;
use crate::errors::ProducerError;
use crate::io_worker::IoWorker;
use crate::log::Log;
use crate::monitor::{ProducerMetrics, ProducerMonitor};
use crate::mover::Mover;
use crate::retry_queue::RetryQueue;
use crate::worker_pool::WorkerPool;

struct BackgroundTasks {
    mover: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    reporter: JoinHandle<()>,
}

/// Everything the shutdown task needs, detached from the producer so the
/// sequence runs to completion even when nobody waits for it.
struct ShutdownSequence {
    accumulator: Arc<LogAccumulator>,
    io_worker: Arc<IoWorker>,
    worker_pool: Arc<WorkerPool>,
    monitor: Arc<ProducerMonitor>,
    pending_bytes: Arc<AtomicI64>,
    mover_token: CancellationToken,
    reporter_token: CancellationToken,
    tasks: Option<BackgroundTasks>,
    stopped_tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSequence {
    async fn run(self) {
        self.accumulator.shut_down().await;
        self.io_worker.disable_retry();

        if let Some(tasks) = self.tasks {
            self.mover_token.cancel();
            if let Err(e) = tasks.mover.await {
                error!("Mover task failed: {e}");
            }

            self.worker_pool.shutdown().await;
            self.worker_pool.wait_stopped().await;
            if let Err(e) = tasks.dispatcher.await {
                error!("Worker pool dispatcher failed: {e}");
            }

            self.reporter_token.cancel();
            if let Err(e) = tasks.reporter.await {
                error!("Monitor reporter failed: {e}");
            }
            self.monitor.report();
        } else {
            info!("Producer closed before it was started");
        }

        info!(
            pending_bytes = self.pending_bytes.load(Ordering::SeqCst),
            "Producer closed"
        );
        self.stopped_tx.send_replace(true);
    }
}

pub struct Producer {
    config: Arc<ProducerConfig>,
    accumulator: Arc<LogAccumulator>,
    io_worker: Arc<IoWorker>,
    worker_pool: Arc<WorkerPool>,
    mover: Arc<Mover>,
    monitor: Arc<ProducerMonitor>,
    pending_bytes: Arc<AtomicI64>,
    mover_token: CancellationToken,
    reporter_token: CancellationToken,
    tasks: Mutex<Option<BackgroundTasks>>,
    started: AtomicBool,
    closed: AtomicBool,
    stopped_tx: Arc<watch::Sender<bool>>,
}

impl Producer {
    /// Builds a producer shipping through `client`. Out of range settings are
    /// clamped first; what is still inconsistent afterwards is rejected.
    pub fn new(config: ProducerConfig, client: Arc<dyn LogClient>) -> Result<Self, ProducerError> {
        let config = config.adjusted();
        config.validate()?;
        let config = Arc::new(config);

        let monitor = Arc::new(ProducerMonitor::new());
        let pending_bytes = Arc::new(AtomicI64::new(0));
        let retry_queue = Arc::new(RetryQueue::new());
        let io_worker = Arc::new(IoWorker::new(
            client,
            Arc::clone(&retry_queue),
            config.no_retry_status_codes.clone(),
            Arc::clone(&monitor),
            Arc::clone(&pending_bytes),
        ));
        let worker_pool = Arc::new(WorkerPool::new(
            Arc::clone(&io_worker),
            config.max_io_worker_count,
        ));
        let accumulator = Arc::new(LogAccumulator::new(
            Arc::clone(&config),
            Arc::clone(&worker_pool),
            Arc::clone(&monitor),
            Arc::clone(&pending_bytes),
        ));
        let mover_token = CancellationToken::new();
        let mover = Arc::new(Mover::new(
            Arc::clone(&accumulator),
            retry_queue,
            Arc::clone(&worker_pool),
            config.linger,
            mover_token.clone(),
        ));

        Ok(Producer {
            config,
            accumulator,
            io_worker,
            worker_pool,
            mover,
            monitor,
            pending_bytes,
            mover_token,
            reporter_token: CancellationToken::new(),
            tasks: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stopped_tx: Arc::new(watch::channel(false).0),
        })
    }

    /// Spawns the mover, the worker pool dispatcher and the status reporter on
    /// the current runtime. Starting twice does nothing.
    pub fn start(&self) -> Result<(), ProducerError> {
        // checked under the lock so a concurrent close always sees the handles
        let mut slot = self.lock_tasks();
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProducerError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mover = Arc::clone(&self.mover);
        let worker_pool = Arc::clone(&self.worker_pool);
        let monitor = Arc::clone(&self.monitor);
        let report_interval = self.config.report_interval;
        let reporter_token = self.reporter_token.clone();
        let tasks = BackgroundTasks {
            mover: tokio::spawn(async move { mover.run().await }),
            dispatcher: tokio::spawn(async move { worker_pool.run().await }),
            reporter: tokio::spawn(async move {
                monitor.run_reporter(report_interval, reporter_token).await;
            }),
        };
        *slot = Some(tasks);
        drop(slot);
        info!(
            max_io_worker_count = self.config.max_io_worker_count,
            linger_ms = self.config.linger.as_millis() as u64,
            "Producer started"
        );
        Ok(())
    }

    pub async fn send_log(&self, destination: &Destination, log: Log) -> Result<(), ProducerError> {
        self.send(destination, vec![log], None).await
    }

    pub async fn send_log_list(
        &self,
        destination: &Destination,
        logs: Vec<Log>,
    ) -> Result<(), ProducerError> {
        self.send(destination, logs, None).await
    }

    pub async fn send_log_with_callback(
        &self,
        destination: &Destination,
        log: Log,
        callback: Arc<dyn Callback>,
    ) -> Result<(), ProducerError> {
        self.send(destination, vec![log], Some(callback)).await
    }

    pub async fn send_log_list_with_callback(
        &self,
        destination: &Destination,
        logs: Vec<Log>,
        callback: Arc<dyn Callback>,
    ) -> Result<(), ProducerError> {
        self.send(destination, logs, Some(callback)).await
    }

    /// Like [`Producer::send_log`], routed to the shard owning `shard_hash`.
    pub async fn hash_send_log(
        &self,
        destination: &Destination,
        shard_hash: &str,
        log: Log,
    ) -> Result<(), ProducerError> {
        let destination = destination.clone().with_shard_hash(shard_hash);
        self.send(&destination, vec![log], None).await
    }

    pub async fn hash_send_log_list(
        &self,
        destination: &Destination,
        shard_hash: &str,
        logs: Vec<Log>,
    ) -> Result<(), ProducerError> {
        let destination = destination.clone().with_shard_hash(shard_hash);
        self.send(&destination, logs, None).await
    }

    pub async fn hash_send_log_with_callback(
        &self,
        destination: &Destination,
        shard_hash: &str,
        log: Log,
        callback: Arc<dyn Callback>,
    ) -> Result<(), ProducerError> {
        let destination = destination.clone().with_shard_hash(shard_hash);
        self.send(&destination, vec![log], Some(callback)).await
    }

    pub async fn hash_send_log_list_with_callback(
        &self,
        destination: &Destination,
        shard_hash: &str,
        logs: Vec<Log>,
        callback: Arc<dyn Callback>,
    ) -> Result<(), ProducerError> {
        let destination = destination.clone().with_shard_hash(shard_hash);
        self.send(&destination, logs, Some(callback)).await
    }

    /// Bytes admitted but not delivered or dropped yet.
    pub fn pending_bytes(&self) -> i64 {
        self.pending_bytes.load(Ordering::SeqCst)
    }

    /// Metrics of the current reporting window.
    pub fn metrics(&self) -> Arc<ProducerMetrics> {
        self.monitor.current()
    }

    /// Closes the producer, giving up on waiting after `timeout`.
    ///
    /// Shutdown runs in its own task: on timeout it keeps going, and a later
    /// `close` or `safe_close` waits for that same shutdown to finish.
    pub async fn close(&self, timeout: Duration) -> Result<(), ProducerError> {
        let mut stopped_rx = self.begin_close();
        let result = match tokio::time::timeout(timeout, stopped_rx.wait_for(|stopped| *stopped)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Producer did not stop within {timeout:?}");
                Err(ProducerError::Timeout(format!(
                    "producer did not stop within {timeout:?}"
                )))
            }
        };
        result
    }

    /// Closes the producer once everything admitted has been delivered or
    /// failed. Closing again waits for the same shutdown.
    pub async fn safe_close(&self) -> Result<(), ProducerError> {
        let mut stopped_rx = self.begin_close();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = stopped_rx.wait_for(|stopped| *stopped).await;
        Ok(())
    }

    /// Whether shutdown has fully completed.
    pub fn is_closed(&self) -> bool {
        *self.stopped_tx.borrow()
    }

    /// Spawns the shutdown sequence on the first call only.
    fn begin_close(&self) -> watch::Receiver<bool> {
        let stopped_rx = self.stopped_tx.subscribe();
        if self.closed.swap(true, Ordering::SeqCst) {
            return stopped_rx;
        }
        info!("Closing producer");

        let sequence = ShutdownSequence {
            accumulator: Arc::clone(&self.accumulator),
            io_worker: Arc::clone(&self.io_worker),
            worker_pool: Arc::clone(&self.worker_pool),
            monitor: Arc::clone(&self.monitor),
            pending_bytes: Arc::clone(&self.pending_bytes),
            mover_token: self.mover_token.clone(),
            reporter_token: self.reporter_token.clone(),
            tasks: self.lock_tasks().take(),
            stopped_tx: Arc::clone(&self.stopped_tx),
        };
        tokio::spawn(sequence.run());
        stopped_rx
    }

    async fn send(
        &self,
        destination: &Destination,
        logs: Vec<Log>,
        callback: Option<Arc<dyn Callback>>,
    ) -> Result<(), ProducerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProducerError::ShutDown);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(ProducerError::NotStarted);
        }
        self.wait_for_memory().await?;
        self.accumulator
            .add_log_list(destination, logs, callback)
            .await
    }

    fn over_limit(&self) -> bool {
        self.pending_bytes() > self.config.total_size_in_bytes
    }

    async fn wait_for_memory(&self) -> Result<(), ProducerError> {
        if !self.over_limit() {
            return Ok(());
        }
        let start = Instant::now();
        let step = Duration::from_millis(WAIT_MEMORY_STEP_MS);
        loop {
            if let Some(max_block) = self.config.max_block {
                if start.elapsed() >= max_block {
                    self.monitor.inc_wait_memory_fail();
                    warn!(
                        pending_bytes = self.pending_bytes(),
                        total_size_in_bytes = self.config.total_size_in_bytes,
                        "Timed out waiting for pending memory to drain"
                    );
                    return Err(ProducerError::Timeout(format!(
                        "pending bytes stayed above {} for {max_block:?}",
                        self.config.total_size_in_bytes
                    )));
                }
            }
            tokio::time::sleep(step).await;
            if !self.over_limit() {
                self.monitor.record_wait_memory(start);
                return Ok(());
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Option<BackgroundTasks>> {
        #[allow(clippy::expect_used)]
        self.tasks.lock().expect("lock poisoned")
    }
}

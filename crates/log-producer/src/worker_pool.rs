// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::batch::ProducerBatch;
use crate::client::SendError;
use crate::constants::WORKER_POOL_QUEUE_SIZE;
use crate::io_worker::IoWorker;

#[derive(Debug)]
pub enum Task {
    Send(ProducerBatch),
    Shutdown,
}

/// Bounded queue of sealed batches drained by a single dispatcher, which runs
/// at most `max_io_worker_count` sends at a time.
pub struct WorkerPool {
    tx: mpsc::Sender<Task>,
    rx: Mutex<Option<mpsc::Receiver<Task>>>,
    io_worker: Arc<IoWorker>,
    max_io_worker_count: usize,
    shutdown_sent: AtomicBool,
    stopped_tx: watch::Sender<bool>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(io_worker: Arc<IoWorker>, max_io_worker_count: usize) -> Self {
        Self::with_capacity(io_worker, max_io_worker_count, WORKER_POOL_QUEUE_SIZE)
    }

    #[must_use]
    pub fn with_capacity(
        io_worker: Arc<IoWorker>,
        max_io_worker_count: usize,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stopped_tx, _) = watch::channel(false);
        WorkerPool {
            tx,
            rx: Mutex::new(Some(rx)),
            io_worker,
            max_io_worker_count: max_io_worker_count.max(1),
            shutdown_sent: AtomicBool::new(false),
            stopped_tx,
        }
    }

    /// Queues a batch for sending, waiting while the queue is full.
    ///
    /// A batch that can no longer be queued because the dispatcher is gone is
    /// failed so its callbacks still fire.
    pub async fn add_task(&self, batch: ProducerBatch) {
        if let Err(mpsc::error::SendError(task)) = self.tx.send(Task::Send(batch)).await {
            if let Task::Send(batch) = task {
                error!("Worker pool is closed, failing batch");
                self.io_worker.fail_batch(
                    batch,
                    &SendError::network("worker pool is shut down"),
                );
            }
        }
    }

    /// Enqueues the shutdown sentinel. Calling it again does nothing.
    pub async fn shutdown(&self) {
        if self.shutdown_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.tx.send(Task::Shutdown).await.is_err() {
            debug!("Worker pool dispatcher already exited");
        }
    }

    /// Dispatches queued batches until the shutdown sentinel arrives, then
    /// waits for every running send and fails what is left in the retry queue.
    pub async fn run(&self) {
        let rx = {
            #[allow(clippy::expect_used)]
            let mut guard = self.rx.lock().expect("lock poisoned");
            guard.take()
        };
        let Some(mut rx) = rx else {
            error!("Worker pool dispatcher is already running");
            return;
        };

        let semaphore = Arc::new(Semaphore::new(self.max_io_worker_count));
        let tracker = TaskTracker::new();

        while let Some(task) = rx.recv().await {
            match task {
                Task::Send(batch) => self.dispatch(&semaphore, &tracker, batch).await,
                Task::Shutdown => break,
            }
        }

        // anything that slipped in behind the sentinel still gets sent
        rx.close();
        while let Some(task) = rx.recv().await {
            if let Task::Send(batch) = task {
                self.dispatch(&semaphore, &tracker, batch).await;
            }
        }

        tracker.close();
        tracker.wait().await;
        self.io_worker.fail_stranded();

        info!("Worker pool stopped");
        self.stopped_tx.send_replace(true);
    }

    async fn dispatch(&self, semaphore: &Arc<Semaphore>, tracker: &TaskTracker, batch: ProducerBatch) {
        let permit = match Arc::clone(semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("Send slots closed: {e}");
                return;
            }
        };
        let io_worker = Arc::clone(&self.io_worker);
        io_worker.start_send_task();
        tracker.spawn(async move {
            io_worker.send_to_server(batch).await;
            io_worker.close_send_task();
            drop(permit);
        });
    }

    pub fn stopped(&self) -> bool {
        *self.stopped_tx.borrow()
    }

    /// Resolves once the dispatcher has finished.
    pub async fn wait_stopped(&self) {
        let mut stopped_rx = self.stopped_tx.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = stopped_rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Destination, Outcome};
    use crate::client::LogClient;
    use crate::config::ProducerConfig;
    use crate::io_worker::tests::ScriptedClient;
    use crate::log::{LogGroup, Log};
    use crate::monitor::ProducerMonitor;
    use crate::pack_id::PackIdGenerator;
    use crate::retry_queue::RetryQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, AtomicUsize};
    use std::time::Duration;
    use tokio::time::Instant;

    fn io_worker(client: Arc<dyn LogClient>, retry_queue: Arc<RetryQueue>) -> Arc<IoWorker> {
        Arc::new(IoWorker::new(
            client,
            retry_queue,
            Default::default(),
            Arc::new(ProducerMonitor::new()),
            Arc::new(AtomicI64::new(0)),
        ))
    }

    fn batch(done: &Arc<AtomicUsize>) -> ProducerBatch {
        let mut batch = ProducerBatch::new(
            &PackIdGenerator::new(),
            Destination::new("project", "logstore"),
            &ProducerConfig::default(),
        );
        let done = Arc::clone(done);
        batch.add_log(
            Log::new(0, [("k", "v")]),
            6,
            Some(Arc::new(move |_: Outcome<'_>| {
                done.fetch_add(1, Ordering::SeqCst);
            })),
        );
        batch
    }

    /// Sleeps on every send and remembers the highest concurrency it saw.
    #[derive(Default)]
    struct SlowClient {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LogClient for SlowClient {
        async fn put_logs(
            &self,
            _project: &str,
            _logstore: &str,
            _shard_hash: Option<&str>,
            _log_group: &LogGroup,
        ) -> Result<(), SendError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn put_logs_with_metric_store_url(
            &self,
            project: &str,
            logstore: &str,
            log_group: &LogGroup,
        ) -> Result<(), SendError> {
            self.put_logs(project, logstore, None, log_group).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_capped() {
        let client = Arc::new(SlowClient::default());
        let pool = Arc::new(WorkerPool::new(
            io_worker(Arc::clone(&client) as Arc<dyn LogClient>, Arc::new(RetryQueue::new())),
            2,
        ));
        let done = Arc::new(AtomicUsize::new(0));

        let runner = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.run().await }
        });
        for _ in 0..6 {
            pool.add_task(batch(&done)).await;
        }
        pool.shutdown().await;
        pool.wait_stopped().await;
        runner.await.unwrap();

        assert!(pool.stopped());
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert_eq!(client.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let pool = Arc::new(WorkerPool::new(
            io_worker(Arc::new(ScriptedClient::default()), Arc::new(RetryQueue::new())),
            4,
        ));
        let runner = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.run().await }
        });
        pool.shutdown().await;
        pool.shutdown().await;
        pool.wait_stopped().await;
        runner.await.unwrap();
        assert!(pool.stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stranded_retries_fail_at_stop() {
        let retry_queue = Arc::new(RetryQueue::new());
        let pool = Arc::new(WorkerPool::new(
            io_worker(Arc::new(ScriptedClient::default()), Arc::clone(&retry_queue)),
            4,
        ));
        let done = Arc::new(AtomicUsize::new(0));
        let mut parked = batch(&done);
        parked.set_next_retry(Instant::now() + Duration::from_secs(30));
        retry_queue.send_to_retry_queue(parked);

        let runner = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.run().await }
        });
        pool.shutdown().await;
        pool.wait_stopped().await;
        runner.await.unwrap();

        assert!(retry_queue.is_empty());
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_task_after_dispatcher_gone_fails_batch() {
        let pool = WorkerPool::new(
            io_worker(Arc::new(ScriptedClient::default()), Arc::new(RetryQueue::new())),
            1,
        );
        // drop the receiver to simulate a dispatcher that exited
        pool.rx.lock().unwrap().take();
        let done = Arc::new(AtomicUsize::new(0));
        pool.add_task(batch(&done)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}

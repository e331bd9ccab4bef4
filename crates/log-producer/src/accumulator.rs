// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routes incoming records into the open batch of their destination.
//!
//! Batches are keyed by project, logstore, topic, shard hash and source. A
//! batch that reaches the configured size or count is removed from the map and
//! handed to the worker pool once the map lock is released; batches that never
//! fill up are sealed by the mover when their linger time elapses.

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::batch::{Callback, Destination, ProducerBatch};
use crate::config::ProducerConfig;
use crate::constants::MAX_IDLE_KEYS;
use crate::errors::ProducerError;
use crate::log::{log_list_size, Log};
use crate::monitor::ProducerMonitor;
use crate::pack_id::PackIdGenerator;
use crate::worker_pool::WorkerPool;

type BatchMap = HashMap<String, ProducerBatch, FnvBuildHasher>;

pub struct LogAccumulator {
    log_group_data: Mutex<BatchMap>,
    // held shared by every add, exclusively once by shutdown
    admission: RwLock<()>,
    shutdown_flag: AtomicBool,
    config: Arc<ProducerConfig>,
    pending_bytes: Arc<AtomicI64>,
    pack_id_generator: PackIdGenerator,
    monitor: Arc<ProducerMonitor>,
    worker_pool: Arc<WorkerPool>,
}

impl LogAccumulator {
    pub fn new(
        config: Arc<ProducerConfig>,
        worker_pool: Arc<WorkerPool>,
        monitor: Arc<ProducerMonitor>,
        pending_bytes: Arc<AtomicI64>,
    ) -> Self {
        LogAccumulator {
            log_group_data: Mutex::new(BatchMap::default()),
            admission: RwLock::new(()),
            shutdown_flag: AtomicBool::new(false),
            config,
            pending_bytes,
            pack_id_generator: PackIdGenerator::new(),
            monitor,
            worker_pool,
        }
    }

    pub async fn add_log(
        &self,
        destination: &Destination,
        log: Log,
        callback: Option<Arc<dyn Callback>>,
    ) -> Result<(), ProducerError> {
        self.add_log_list(destination, vec![log], callback).await
    }

    pub async fn add_log_list(
        &self,
        destination: &Destination,
        logs: Vec<Log>,
        callback: Option<Arc<dyn Callback>>,
    ) -> Result<(), ProducerError> {
        let _admitted = self.admission.read().await;
        if self.is_shut_down() {
            warn!("Producer has started and shut down and cannot write to new logs");
            return Err(ProducerError::ShutDown);
        }
        if logs.is_empty() {
            return Ok(());
        }

        let size = log_list_size(&logs);
        let key = destination.routing_key();
        let sealed = {
            let mut map = self.lock();
            // the flag may flip between the check above and taking the lock
            if self.is_shut_down() {
                return Err(ProducerError::ShutDown);
            }
            self.pending_bytes.fetch_add(size, Ordering::SeqCst);

            let batch = map.entry_ref(key.as_str()).or_insert_with(|| {
                self.monitor.inc_create_batch();
                ProducerBatch::new(&self.pack_id_generator, destination.clone(), &self.config)
            });
            batch.add_log_list(logs, size, callback);

            if batch.meets_send_condition(self.config.max_batch_size, self.config.max_batch_count) {
                map.remove(key.as_str())
            } else {
                None
            }
        };

        if let Some(batch) = sealed {
            debug!(
                routing_key = %key,
                logs = batch.log_count(),
                bytes = batch.total_data_size(),
                "Batch is full, sending"
            );
            self.worker_pool.add_task(batch).await;
        }
        Ok(())
    }

    /// Removes every open batch whose linger time elapsed at `now`.
    ///
    /// Also returns how long until the next remaining batch expires, or the
    /// full linger when no batch is open.
    pub fn expire_lingering(&self, now: Instant, linger: Duration) -> (Vec<ProducerBatch>, Duration) {
        let mut map = self.lock();
        let mut sleep_for = linger;
        let mut expired_keys = Vec::new();
        for (key, batch) in map.iter() {
            let elapsed = now.saturating_duration_since(batch.create_time());
            if elapsed >= linger {
                expired_keys.push(key.clone());
            } else {
                sleep_for = sleep_for.min(linger - elapsed);
            }
        }
        let expired = expired_keys
            .iter()
            .filter_map(|key| map.remove(key.as_str()))
            .collect();
        (expired, sleep_for)
    }

    /// Removes every open batch regardless of size or age.
    pub fn drain_all(&self) -> Vec<ProducerBatch> {
        let mut map = self.lock();
        map.drain()
            .map(|(_, batch)| batch)
            .filter(|batch| batch.log_count() > 0)
            .collect()
    }

    /// Gives memory back once the map grew large and emptied out again.
    pub fn compact_if_needed(&self) {
        let mut map = self.lock();
        let capacity = map.capacity();
        if capacity > MAX_IDLE_KEYS && map.len() * 4 < capacity {
            let len = map.len();
            map.shrink_to(len * 2);
            debug!(
                before = capacity,
                after = map.capacity(),
                "Compacted open batch map"
            );
        }
    }

    /// Stops admissions and waits for every add already past the gate.
    pub async fn shut_down(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        drop(self.admission.write().await);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub fn open_batch_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BatchMap> {
        #[allow(clippy::expect_used)]
        self.log_group_data.lock().expect("lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Outcome;
    use crate::client::LogClient;
    use crate::io_worker::tests::ScriptedClient;
    use crate::io_worker::IoWorker;
    use crate::retry_queue::RetryQueue;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        accumulator: Arc<LogAccumulator>,
        pool: Arc<WorkerPool>,
        client: Arc<ScriptedClient>,
        pending_bytes: Arc<AtomicI64>,
    }

    fn fixture(config: ProducerConfig) -> Fixture {
        let client = Arc::new(ScriptedClient::default());
        let pending_bytes = Arc::new(AtomicI64::new(0));
        let monitor = Arc::new(ProducerMonitor::new());
        let io_worker = Arc::new(IoWorker::new(
            Arc::clone(&client) as Arc<dyn LogClient>,
            Arc::new(RetryQueue::new()),
            config.no_retry_status_codes.clone(),
            Arc::clone(&monitor),
            Arc::clone(&pending_bytes),
        ));
        let pool = Arc::new(WorkerPool::new(io_worker, 4));
        let accumulator = Arc::new(LogAccumulator::new(
            Arc::new(config),
            Arc::clone(&pool),
            monitor,
            Arc::clone(&pending_bytes),
        ));
        Fixture {
            accumulator,
            pool,
            client,
            pending_bytes,
        }
    }

    fn config() -> ProducerConfig {
        ProducerConfig {
            max_batch_count: 2,
            generate_pack_id: false,
            ..Default::default()
        }
    }

    fn log(message: &str) -> Log {
        Log::new(0, [("message", message)])
    }

    async fn stop(fixture: &Fixture) {
        fixture.pool.shutdown().await;
        fixture.pool.wait_stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_record_seals_batch() {
        let fixture = fixture(config());
        let runner = tokio::spawn({
            let pool = Arc::clone(&fixture.pool);
            async move { pool.run().await }
        });
        let destination = Destination::new("p", "l");
        let delivered = Arc::new(AtomicUsize::new(0));
        let callback: Arc<dyn Callback> = {
            let delivered = Arc::clone(&delivered);
            Arc::new(move |outcome: Outcome<'_>| {
                if outcome.is_delivered() {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        fixture
            .accumulator
            .add_log(&destination, log("a"), Some(Arc::clone(&callback)))
            .await
            .unwrap();
        assert_eq!(fixture.accumulator.open_batch_count(), 1);

        fixture
            .accumulator
            .add_log(&destination, log("b"), Some(callback))
            .await
            .unwrap();
        assert_eq!(fixture.accumulator.open_batch_count(), 0);

        stop(&fixture).await;
        runner.await.unwrap();

        let sent = fixture.client.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].logs, vec![log("a"), log("b")]);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.pending_bytes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destinations_get_separate_batches() {
        let fixture = fixture(config());
        let base = Destination::new("p", "l");
        for destination in [
            base.clone(),
            base.clone().with_topic("t"),
            base.clone().with_source("s"),
            base.clone().with_shard_hash("00"),
            Destination::new("p", "other"),
        ] {
            fixture
                .accumulator
                .add_log(&destination, log("x"), None)
                .await
                .unwrap();
        }
        assert_eq!(fixture.accumulator.open_batch_count(), 5);
        assert!(fixture.pending_bytes.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown_without_mutation() {
        let fixture = fixture(config());
        fixture.accumulator.shut_down().await;

        let result = fixture
            .accumulator
            .add_log(&Destination::new("p", "l"), log("x"), None)
            .await;
        assert_eq!(result, Err(ProducerError::ShutDown));
        assert_eq!(fixture.accumulator.open_batch_count(), 0);
        assert_eq!(fixture.pending_bytes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_list_is_noop() {
        let fixture = fixture(config());
        fixture
            .accumulator
            .add_log_list(&Destination::new("p", "l"), Vec::new(), None)
            .await
            .unwrap();
        assert_eq!(fixture.accumulator.open_batch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_lingering() {
        let fixture = fixture(config());
        let linger = Duration::from_millis(1000);
        fixture
            .accumulator
            .add_log(&Destination::new("p", "old"), log("x"), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(700)).await;
        fixture
            .accumulator
            .add_log(&Destination::new("p", "young"), log("x"), None)
            .await
            .unwrap();

        let (expired, sleep_for) = fixture
            .accumulator
            .expire_lingering(Instant::now(), linger);
        assert!(expired.is_empty());
        assert_eq!(sleep_for, Duration::from_millis(300));

        tokio::time::advance(Duration::from_millis(300)).await;
        let (expired, sleep_for) = fixture
            .accumulator
            .expire_lingering(Instant::now(), linger);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].logstore(), "old");
        assert_eq!(sleep_for, Duration::from_millis(700));
        assert_eq!(fixture.accumulator.open_batch_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_all_and_compact() {
        let fixture = fixture(ProducerConfig {
            generate_pack_id: false,
            ..Default::default()
        });
        for i in 0..(MAX_IDLE_KEYS * 2) {
            fixture
                .accumulator
                .add_log(&Destination::new("p", format!("l{i}")), log("x"), None)
                .await
                .unwrap();
        }
        let capacity = fixture.accumulator.lock().capacity();
        assert!(capacity > MAX_IDLE_KEYS);

        assert_eq!(fixture.accumulator.drain_all().len(), MAX_IDLE_KEYS * 2);
        fixture.accumulator.compact_if_needed();
        assert!(fixture.accumulator.lock().capacity() < capacity);
        assert_eq!(fixture.accumulator.open_batch_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_to_one_key_account_for_every_record() {
        const TASKS: usize = 16;
        const ADDS: usize = 100;

        let fixture = fixture(ProducerConfig {
            max_batch_count: 7,
            generate_pack_id: false,
            ..Default::default()
        });
        let runner = tokio::spawn({
            let pool = Arc::clone(&fixture.pool);
            async move { pool.run().await }
        });

        let destination = Destination::new("p", "shared");
        let mut adders = Vec::with_capacity(TASKS);
        for task in 0..TASKS {
            let accumulator = Arc::clone(&fixture.accumulator);
            let destination = destination.clone();
            adders.push(tokio::spawn(async move {
                for i in 0..ADDS {
                    accumulator
                        .add_log(&destination, log(&format!("{task}-{i}")), None)
                        .await
                        .unwrap();
                }
            }));
        }
        for adder in adders {
            adder.await.unwrap();
        }

        let rest = fixture.accumulator.drain_all();
        stop(&fixture).await;
        runner.await.unwrap();

        let sent: usize = fixture
            .client
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|group| group.logs.len())
            .sum();
        let rest_logs: usize = rest.iter().map(ProducerBatch::log_count).sum();
        let rest_bytes: i64 = rest.iter().map(ProducerBatch::total_data_size).sum();
        assert_eq!(sent + rest_logs, TASKS * ADDS);
        assert_eq!(fixture.pending_bytes.load(Ordering::SeqCst), rest_bytes);
    }
}

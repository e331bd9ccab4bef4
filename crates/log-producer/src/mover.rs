// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::accumulator::LogAccumulator;
use crate::constants::RETRY_YIELD_MS;
use crate::retry_queue::RetryQueue;
use crate::worker_pool::WorkerPool;

/// Background flush scheduler. Seals batches whose linger time elapsed,
/// resubmits due retries, and on cancellation submits everything left.
pub struct Mover {
    accumulator: Arc<LogAccumulator>,
    retry_queue: Arc<RetryQueue>,
    worker_pool: Arc<WorkerPool>,
    linger: Duration,
    cancel_token: CancellationToken,
}

impl Mover {
    pub fn new(
        accumulator: Arc<LogAccumulator>,
        retry_queue: Arc<RetryQueue>,
        worker_pool: Arc<WorkerPool>,
        linger: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Mover {
            accumulator,
            retry_queue,
            worker_pool,
            linger,
            cancel_token,
        }
    }

    pub async fn run(&self) {
        info!("Mover started");
        while !self.cancel_token.is_cancelled() {
            let (expired, mut sleep_for) =
                self.accumulator.expire_lingering(Instant::now(), self.linger);
            for batch in expired {
                self.worker_pool.add_task(batch).await;
            }

            let retries = self.retry_queue.get_retry_batches(false);
            if !retries.is_empty() {
                debug!("Resubmitting {} due retries", retries.len());
                for batch in retries {
                    self.worker_pool.add_task(batch).await;
                }
                sleep_for = Duration::from_millis(RETRY_YIELD_MS);
            }

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                () = self.cancel_token.cancelled() => {}
            }
            self.accumulator.compact_if_needed();
        }

        self.send_remaining().await;
        info!("Mover stopped");
    }

    /// Final pass: every open batch and every parked retry goes to the pool.
    async fn send_remaining(&self) {
        let open = self.accumulator.drain_all();
        let retries = self.retry_queue.get_retry_batches(true);
        debug!(
            open = open.len(),
            retries = retries.len(),
            "Submitting remaining batches"
        );
        for batch in open.into_iter().chain(retries) {
            self.worker_pool.add_task(batch).await;
        }
    }
}

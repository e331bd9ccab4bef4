// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batches waiting for their next attempt, earliest retry first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::batch::ProducerBatch;

struct RetryEntry(ProducerBatch);

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.next_retry() == other.0.next_retry()
    }
}

impl Eq for RetryEntry {}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryEntry {
    // BinaryHeap is a max-heap; the earliest retry has to come out first
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.next_retry().cmp(&self.0.next_retry())
    }
}

#[derive(Default)]
pub struct RetryQueue {
    batches: Mutex<BinaryHeap<RetryEntry>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_to_retry_queue(&self, batch: ProducerBatch) {
        debug!(
            project = %batch.project(),
            logstore = %batch.logstore(),
            attempt_count = batch.attempt_count(),
            "Send to retry queue"
        );
        #[allow(clippy::expect_used)]
        let mut batches = self.batches.lock().expect("lock poisoned");
        batches.push(RetryEntry(batch));
    }

    /// Removes and returns every batch whose retry time has come, or every
    /// batch at all when `force` is set.
    pub fn get_retry_batches(&self, force: bool) -> Vec<ProducerBatch> {
        #[allow(clippy::expect_used)]
        let mut batches = self.batches.lock().expect("lock poisoned");
        if force {
            return std::mem::take(&mut *batches)
                .into_sorted_vec()
                .into_iter()
                .rev()
                .map(|entry| entry.0)
                .collect();
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while batches
            .peek()
            .is_some_and(|entry| entry.0.next_retry() <= now)
        {
            if let Some(entry) = batches.pop() {
                due.push(entry.0);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let batches = self.batches.lock().expect("lock poisoned");
        batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free running statistics used by the producer monitor.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Running count, sum and sum of squares of samples, in microseconds.
///
/// Samples are added with atomic operations only, so any task may record into
/// the same histogram while the reporter reads it.
#[derive(Debug, Default)]
pub struct TimeHistogram {
    count: AtomicI64,
    sum: AtomicF64,
    sum_square: AtomicF64,
}

impl TimeHistogram {
    pub fn add_sample(&self, us: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.add(us);
        self.sum_square.add(us * us);
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum.load()
    }

    pub fn avg(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum.load() / count as f64
    }

    /// Sample standard deviation, zero until two samples were recorded.
    pub fn std_dev(&self) -> f64 {
        let count = self.count();
        if count < 2 {
            return 0.0;
        }
        let n = count as f64;
        let num = n * self.sum_square.load() - self.sum.load().powi(2);
        // rounding can push a zero variance slightly negative
        (num.max(0.0) / (n * (n - 1.0))).sqrt()
    }
}

impl fmt::Display for TimeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{avg: {:.1}us, stdDev: {:.1}us, count: {}}}",
            self.avg(),
            self.std_dev(),
            self.count()
        )
    }
}

/// `f64` stored as its bit pattern in an `AtomicU64`.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn add(&self, value: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

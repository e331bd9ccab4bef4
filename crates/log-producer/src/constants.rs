// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Joins the components of a routing key. Not expected inside any project,
/// logstore, topic, shard hash or source name.
pub const DELIMITER: &str = "|@|";

/// Tag key carrying the pack id of a batch.
pub const PACK_ID_KEY: &str = "__pack_id__";

/// Fixed per-record overhead counted by the size function (the timestamp).
pub const LOG_TIME_SIZE: usize = 4;

/// Capacity of the worker pool task channel.
pub const WORKER_POOL_QUEUE_SIZE: usize = 100_000;

/// Open-batch map capacity above which the mover compacts it.
pub const MAX_IDLE_KEYS: usize = 1000;

/// Sleep of the mover right after it resubmitted due retries, in milliseconds.
pub const RETRY_YIELD_MS: u64 = 1;

/// Polling step while a caller waits for pending memory to drain.
pub const WAIT_MEMORY_STEP_MS: u64 = 10;

pub const DEFAULT_TOTAL_SIZE_IN_BYTES: i64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_IO_WORKER_COUNT: usize = 50;
pub const DEFAULT_MAX_BLOCK_SECS: u64 = 60;
pub const DEFAULT_MAX_BATCH_SIZE: i64 = 512 * 1024;
pub const DEFAULT_MAX_BATCH_COUNT: usize = 4096;
pub const DEFAULT_LINGER_MS: u64 = 2000;
pub const DEFAULT_RETRIES: u32 = 10;
pub const DEFAULT_MAX_RESERVED_ATTEMPTS: usize = 11;
pub const DEFAULT_BASE_RETRY_BACKOFF_MS: u64 = 100;
pub const DEFAULT_MAX_RETRY_BACKOFF_MS: u64 = 50_000;
pub const DEFAULT_NO_RETRY_STATUS_CODES: [u16; 2] = [400, 404];
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 60;

/// Upper bound of a single batch accepted by the service (5MB).
pub const MAX_BATCH_SIZE_LIMIT: i64 = 5 * 1024 * 1024;
/// Upper bound of records in a single batch accepted by the service.
pub const MAX_BATCH_COUNT_LIMIT: usize = 40_960;

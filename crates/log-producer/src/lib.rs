// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous batching log producer.
//!
//! Records handed to a [`producer::Producer`] are grouped into batches keyed by
//! destination, sealed by size, count or linger time, and shipped through a
//! [`client::LogClient`] by a bounded pool of sending tasks. Failed batches are
//! retried with exponential backoff until their retry budget runs out.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod accumulator;
pub mod batch;
pub mod client;
pub mod config;
pub mod constants;
pub mod errors;
pub mod histogram;
pub mod http;
pub mod io_worker;
pub mod log;
pub mod monitor;
pub mod mover;
pub mod pack_id;
pub mod producer;
pub mod retry_queue;
pub mod worker_pool;

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract of the network collaborator that delivers a batch.

use async_trait::async_trait;
use derive_more::Display;

use crate::log::LogGroup;

/// How a failed send was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    /// The request never produced a response (connect, timeout, reset).
    #[display("network")]
    Network,
    /// The service answered with a status code and an error body.
    #[display("server")]
    Server,
    /// The service answered with something that could not be interpreted.
    #[display("malformed")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error (status: {http_code:?}, code: {code}, request id: {request_id}): {message}")]
pub struct SendError {
    pub kind: ErrorKind,
    pub http_code: Option<u16>,
    pub code: String,
    pub message: String,
    pub request_id: String,
}

impl SendError {
    pub fn network(message: impl Into<String>) -> Self {
        SendError {
            kind: ErrorKind::Network,
            http_code: None,
            code: String::new(),
            message: message.into(),
            request_id: String::new(),
        }
    }

    pub fn server(
        http_code: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        SendError {
            kind: ErrorKind::Server,
            http_code: Some(http_code),
            code: code.into(),
            message: message.into(),
            request_id: request_id.into(),
        }
    }

    pub fn malformed(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        SendError {
            kind: ErrorKind::Malformed,
            http_code: None,
            code: String::new(),
            message: message.into(),
            request_id: request_id.into(),
        }
    }
}

/// Delivers one log group to the ingestion service.
#[async_trait]
pub trait LogClient: Send + Sync {
    async fn put_logs(
        &self,
        project: &str,
        logstore: &str,
        shard_hash: Option<&str>,
        log_group: &LogGroup,
    ) -> Result<(), SendError>;

    /// Metric stores are written through their own ingestion path.
    async fn put_logs_with_metric_store_url(
        &self,
        project: &str,
        logstore: &str,
        log_group: &LogGroup,
    ) -> Result<(), SendError>;
}

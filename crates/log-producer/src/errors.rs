// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced synchronously to callers of the producer.
///
/// Delivery failures never show up here: by the time a batch is sent the
/// `send_log*` call has long returned, so they reach callers only through the
/// batch callbacks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProducerError {
    #[error("Producer has started and shut down and cannot write to new logs")]
    ShutDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Producer has not been started")]
    NotStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProducerError::InvalidConfig("linger must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: linger must be positive"
        );
        assert_eq!(
            ProducerError::ShutDown.to_string(),
            "Producer has started and shut down and cannot write to new logs"
        );
    }

    #[test]
    fn test_error_debug() {
        let error = ProducerError::Timeout("close".into());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("Timeout"));
    }
}

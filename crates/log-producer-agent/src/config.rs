// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),

    #[error("{name} environment variable is invalid: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Where stdin lines are shipped to. The log level is read separately by
/// `main`, before this is parsed, so configuration errors are logged.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: String,
    pub project: String,
    pub logstore: String,
    pub topic: String,
    pub source: String,
    pub compression_level: Option<i32>,
    pub close_timeout: Duration,
}

impl AgentConfig {
    pub fn from_env() -> Result<AgentConfig, ConfigError> {
        let required = |name: &'static str| {
            env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let compression_level = match env::var("LOG_PRODUCER_COMPRESSION_LEVEL") {
            Ok(value) => Some(value.trim().parse::<i32>().map_err(|_| ConfigError::Invalid {
                name: "LOG_PRODUCER_COMPRESSION_LEVEL",
                value,
            })?),
            Err(_) => None,
        };
        let close_timeout = match env::var("LOG_PRODUCER_CLOSE_TIMEOUT_SECS") {
            Ok(value) => Duration::from_secs(value.trim().parse::<u64>().map_err(|_| {
                ConfigError::Invalid {
                    name: "LOG_PRODUCER_CLOSE_TIMEOUT_SECS",
                    value,
                }
            })?),
            Err(_) => Duration::from_secs(DEFAULT_CLOSE_TIMEOUT_SECS),
        };

        Ok(AgentConfig {
            endpoint: required("LOG_PRODUCER_ENDPOINT")?,
            project: required("LOG_PRODUCER_PROJECT")?,
            logstore: required("LOG_PRODUCER_LOGSTORE")?,
            topic: env::var("LOG_PRODUCER_TOPIC").unwrap_or_default(),
            source: env::var("LOG_PRODUCER_SOURCE").unwrap_or_default(),
            compression_level,
            close_timeout,
        })
    }
}

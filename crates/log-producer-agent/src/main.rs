// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod logger;

use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use log_producer::{
    batch::Destination,
    config::ProducerConfig,
    http::{HttpClientConfig, HttpLogClient},
    log::Log,
    producer::Producer,
};

use crate::config::AgentConfig;

const CONTENT_KEY: &str = "content";

#[tokio::main]
pub async fn main() {
    let env_filter = log_filter();

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(logger::Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let agent_config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}. Shutting down log producer agent.");
            return;
        }
    };
    let producer_config = match ProducerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}. Shutting down log producer agent.");
            return;
        }
    };

    let client = match HttpLogClient::new(HttpClientConfig {
        compression_level: agent_config.compression_level,
        ..HttpClientConfig::new(agent_config.endpoint.as_str())
    }) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to create http client: {e}");
            return;
        }
    };

    let producer = match Producer::new(producer_config, Arc::new(client)) {
        Ok(producer) => producer,
        Err(e) => {
            error!("Unable to create producer: {e}");
            return;
        }
    };
    if let Err(e) = producer.start() {
        error!("Unable to start producer: {e}");
        return;
    }

    let destination = Destination::new(&agent_config.project, &agent_config.logstore)
        .with_topic(&agent_config.topic)
        .with_source(&agent_config.source);
    info!(
        project = %agent_config.project,
        logstore = %agent_config.logstore,
        "Shipping stdin lines"
    );

    ship_lines(&producer, &destination).await;

    match producer.close(agent_config.close_timeout).await {
        Ok(()) => info!("Log producer agent stopped"),
        Err(e) => error!("Unable to close producer cleanly: {e}"),
    }
}

async fn ship_lines(producer: &Producer, destination: &Destination) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let log = Log::new(unix_seconds(), [(CONTENT_KEY, line)]);
                    if let Err(e) = producer.send_log(destination, log).await {
                        warn!("Dropping line: {e}");
                    }
                }
                Ok(None) => {
                    debug!("Reached end of stdin");
                    return;
                }
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    return;
                }
            },
            _ = &mut interrupted => {
                info!("Received interrupt, flushing pending logs");
                return;
            }
        }
    }
}

/// Filter directives for the agent's own logs, read before anything else so
/// configuration errors still get logged.
fn log_filter() -> String {
    let log_level = env::var("LOG_PRODUCER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    format!("h2=off,hyper=off,rustls=off,{}", log_level)
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or_default()
}

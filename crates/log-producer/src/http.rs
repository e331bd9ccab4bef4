// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `LogClient` over HTTP.
//!
//! Log groups are posted as JSON, optionally zstd compressed. Responses map to
//! [`SendError`] as follows:
//!
//! - **2xx**: delivered
//! - **other status with an error body**: `Server` error carrying the status,
//!   the service error code and the request id
//! - **other status with an unreadable body**: `Malformed` error
//! - **no response at all**: `Network` error

use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::time::Duration;
use tracing::debug;
use zstd::stream::write::Encoder;
use zstd::zstd_safe::CompressionLevel;

use crate::client::{LogClient, SendError};
use crate::log::LogGroup;

const API_VERSION: &str = "0.6.0";
const REQUEST_ID_HEADER: &str = "x-log-requestid";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Base URL of the project endpoint, without a trailing slash
    pub endpoint: String,
    pub timeout: Duration,
    /// zstd level of request bodies, `None` sends them uncompressed
    pub compression_level: Option<CompressionLevel>,
}

impl HttpClientConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpClientConfig {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(15),
            compression_level: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "errorCode")]
    error_code: String,
    #[serde(rename = "errorMessage")]
    error_message: String,
}

#[derive(Debug, Clone)]
pub struct HttpLogClient {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpLogClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(HttpLogClient { client, config })
    }

    fn encode(&self, log_group: &LogGroup) -> Result<(Vec<u8>, usize), SendError> {
        let raw = serde_json::to_vec(log_group)
            .map_err(|e| encode_failed("serialize", e))?;
        let raw_size = raw.len();
        let Some(level) = self.config.compression_level else {
            return Ok((raw, raw_size));
        };
        let mut encoder = Encoder::new(Vec::new(), level)
            .map_err(|e| encode_failed("compress", e))?;
        encoder
            .write_all(&raw)
            .map_err(|e| encode_failed("compress", e))?;
        let compressed = encoder
            .finish()
            .map_err(|e| encode_failed("compress", e))?;
        Ok((compressed, raw_size))
    }

    async fn post(
        &self,
        request: reqwest::RequestBuilder,
        project: &str,
        log_group: &LogGroup,
    ) -> Result<(), SendError> {
        let (body, raw_size) = self.encode(log_group)?;
        let mut request = request
            .header("Content-Type", "application/json")
            .header("x-log-apiversion", API_VERSION)
            .header("x-log-project", project)
            .header("x-log-bodyrawsize", raw_size.to_string());
        if self.config.compression_level.is_some() {
            request = request.header("x-log-compresstype", "zstd");
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| SendError::network(e.to_string()))?;

        let status = response.status();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if status.is_success() {
            debug!(request_id = %request_id, "Log group accepted");
            return Ok(());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SendError::network(e.to_string()))?;
        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(error) => Err(SendError::server(
                status.as_u16(),
                error.error_code,
                error.error_message,
                request_id,
            )),
            Err(e) => Err(SendError::malformed(
                format!(
                    "unexpected response with status {status}: {e}: {}",
                    String::from_utf8_lossy(&body)
                ),
                request_id,
            )),
        }
    }
}

/// A body that could not be built never reached the wire.
fn encode_failed(step: &str, e: impl std::fmt::Display) -> SendError {
    SendError::malformed(format!("failed to {step} log group: {e}"), "")
}

#[async_trait]
impl LogClient for HttpLogClient {
    async fn put_logs(
        &self,
        project: &str,
        logstore: &str,
        shard_hash: Option<&str>,
        log_group: &LogGroup,
    ) -> Result<(), SendError> {
        let request = match shard_hash {
            Some(hash) => self
                .client
                .post(format!(
                    "{}/logstores/{logstore}/shards/route",
                    self.config.endpoint
                ))
                .query(&[("key", hash)]),
            None => self.client.post(format!(
                "{}/logstores/{logstore}/shards/lb",
                self.config.endpoint
            )),
        };
        self.post(request, project, log_group).await
    }

    async fn put_logs_with_metric_store_url(
        &self,
        project: &str,
        logstore: &str,
        log_group: &LogGroup,
    ) -> Result<(), SendError> {
        let request = self.client.post(format!(
            "{}/prometheus/{project}/{logstore}/api/v1/write",
            self.config.endpoint
        ));
        self.post(request, project, log_group).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ErrorKind;
    use crate::log::Log;
    use mockito::{Matcher, Server};

    fn log_group() -> LogGroup {
        LogGroup {
            topic: "topic".to_string(),
            logs: vec![Log::new(1_700_000_000, [("message", "hello")])],
            ..Default::default()
        }
    }

    fn client(server: &Server) -> HttpLogClient {
        HttpLogClient::new(HttpClientConfig::new(server.url())).unwrap()
    }

    #[tokio::test]
    async fn test_put_logs_load_balanced() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logstores/store/shards/lb")
            .match_header("x-log-project", "project")
            .match_header("Content-Type", "application/json")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "__topic__": "topic",
                "__logs__": [{"__time__": 1_700_000_000, "message": "hello"}]
            })))
            .with_status(200)
            .create_async()
            .await;

        client(&server)
            .put_logs("project", "store", None, &log_group())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_put_logs_routed_by_shard_hash() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logstores/store/shards/route")
            .match_query(Matcher::UrlEncoded("key".into(), "7f00".into()))
            .with_status(200)
            .create_async()
            .await;

        client(&server)
            .put_logs("project", "store", Some("7f00"), &log_group())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_metric_store_url() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/prometheus/project/metrics/api/v1/write")
            .with_status(200)
            .create_async()
            .await;

        client(&server)
            .put_logs_with_metric_store_url("project", "metrics", &log_group())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_classified() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/logstores/store/shards/lb")
            .with_status(400)
            .with_header(REQUEST_ID_HEADER, "5F0A")
            .with_body(r#"{"errorCode":"PostBodyInvalid","errorMessage":"bad body"}"#)
            .create_async()
            .await;

        let err = client(&server)
            .put_logs("project", "store", None, &log_group())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Server);
        assert_eq!(err.http_code, Some(400));
        assert_eq!(err.code, "PostBodyInvalid");
        assert_eq!(err.message, "bad body");
        assert_eq!(err.request_id, "5F0A");
    }

    #[tokio::test]
    async fn test_unreadable_error_body_is_malformed() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/logstores/store/shards/lb")
            .with_status(502)
            .with_body("<html>bad gateway</html>")
            .create_async()
            .await;

        let err = client(&server)
            .put_logs("project", "store", None, &log_group())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Malformed);
        assert_eq!(err.http_code, None);
    }

    #[test]
    fn test_encoding_failure_is_malformed() {
        let err = encode_failed("compress", "unsupported level");
        assert_eq!(err.kind, ErrorKind::Malformed);
        assert_eq!(err.http_code, None);
        assert_eq!(err.message, "failed to compress log group: unsupported level");
    }

    #[test]
    fn test_encode_reports_raw_size() {
        let client = HttpLogClient::new(HttpClientConfig {
            compression_level: Some(3),
            ..HttpClientConfig::new("http://127.0.0.1:1")
        })
        .unwrap();
        let raw = serde_json::to_vec(&log_group()).unwrap();
        let (body, raw_size) = client.encode(&log_group()).unwrap();
        assert_eq!(raw_size, raw.len());
        assert_eq!(zstd::decode_all(&body[..]).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_connection_failure_is_network() {
        let config = HttpClientConfig {
            timeout: Duration::from_millis(500),
            ..HttpClientConfig::new("http://127.0.0.1:1")
        };
        let err = HttpLogClient::new(config)
            .unwrap()
            .put_logs("project", "store", None, &log_group())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_compressed_body() {
        let mut server = Server::new_async().await;
        let raw = serde_json::to_vec(&log_group()).unwrap();
        let mock = server
            .mock("POST", "/logstores/store/shards/lb")
            .match_header("x-log-compresstype", "zstd")
            .match_header("x-log-bodyrawsize", raw.len().to_string().as_str())
            .match_request(move |request| {
                let body = request.body().unwrap();
                zstd::decode_all(&body[..]).unwrap() == raw
            })
            .with_status(200)
            .create_async()
            .await;

        let config = HttpClientConfig {
            compression_level: Some(3),
            ..HttpClientConfig::new(server.url())
        };
        HttpLogClient::new(config)
            .unwrap()
            .put_logs("project", "store", None, &log_group())
            .await
            .unwrap();
        mock.assert_async().await;
    }
}

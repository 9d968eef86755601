//! HTTP destination.
//!
//! Value batches are POSTed as a JSON array, files as a raw body with their
//! original name in `X-Filename`.

use std::collections::HashMap;

use async_trait::async_trait;
use connector_core::{Connectable, ConnectorError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::north::sink::{Batch, SendOutcome, Sink};
use crate::utils::http_client::{apply_proxy_config, install_rustls_provider};
use crate::{Error, Result};

pub const FILENAME_HEADER: &str = "X-Filename";

pub struct HttpSink {
    endpoint: String,
    client: Client,
    headers: HeaderMap,
}

impl HttpSink {
    pub fn new(
        endpoint: &str,
        headers: &HashMap<String, String>,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Self> {
        install_rustls_provider();
        url::Url::parse(endpoint)
            .map_err(|e| Error::config(format!("invalid endpoint '{endpoint}': {e}")))?;

        let builder = apply_proxy_config(Client::builder(), proxy)?;
        let client = builder
            .build()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
            headers: build_headers(headers)?,
        })
    }

    async fn post(
        &self,
        batch: &Batch,
        file_body: Vec<u8>,
        deadline: Instant,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let request = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .timeout(timeout);

        let request = match batch {
            Batch::Values(values) => {
                let payload: Vec<_> = values
                    .iter()
                    .map(|v| {
                        json!({
                            "pointId": v.point_id,
                            "timestamp": v.timestamp.to_rfc3339(),
                            "data": v.payload,
                        })
                    })
                    .collect();
                request.json(&payload)
            }
            Batch::File(file) => request
                .header(FILENAME_HEADER, file.original_name.as_str())
                .body(file_body),
        };

        request.send().await
    }
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| Error::config(format!("invalid header name '{name}': {e}")))?;
        let value = value
            .parse::<HeaderValue>()
            .map_err(|e| Error::config(format!("invalid header value for '{name}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Map a response status onto a delivery outcome.
///
/// Timeouts, throttling and server errors are worth retrying later; other
/// client errors mean the payload itself was refused.
pub fn classify_status(status: StatusCode, body: &str) -> SendOutcome {
    if status.is_success() {
        return SendOutcome::Delivered;
    }
    let reason = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        SendOutcome::TransportFailed(reason)
    } else if status.is_client_error() {
        SendOutcome::Rejected(reason)
    } else {
        SendOutcome::TransportFailed(reason)
    }
}

#[async_trait]
impl Connectable for HttpSink {
    async fn connect(&self) -> connector_core::Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> connector_core::Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> connector_core::Result<()> {
        self.client
            .head(&self.endpoint)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| ConnectorError::transport(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn driver_name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, batch: &Batch, deadline: Instant) -> SendOutcome {
        let file_body = match batch {
            Batch::File(file) => match tokio::fs::read(&file.stored_path).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(file = %file.stored_path.display(), error = %e, "Cannot read cached file");
                    return SendOutcome::Rejected(format!(
                        "cannot read cached file {}: {e}",
                        file.stored_path.display()
                    ));
                }
            },
            Batch::Values(_) => Vec::new(),
        };

        match self.post(batch, file_body, deadline).await {
            Ok(response) => {
                let status = response.status();
                let body = if status.is_success() {
                    String::new()
                } else {
                    response.text().await.unwrap_or_default()
                };
                let outcome = classify_status(status, &body);
                debug!(endpoint = %self.endpoint, %status, batch = %batch.describe(), "HTTP send finished");
                outcome
            }
            Err(e) => SendOutcome::TransportFailed(format!("request failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::OK, "delivered")]
    #[case(StatusCode::NO_CONTENT, "delivered")]
    #[case(StatusCode::BAD_REQUEST, "rejected")]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, "rejected")]
    #[case(StatusCode::REQUEST_TIMEOUT, "transport")]
    #[case(StatusCode::TOO_MANY_REQUESTS, "transport")]
    #[case(StatusCode::BAD_GATEWAY, "transport")]
    #[case(StatusCode::SERVICE_UNAVAILABLE, "transport")]
    fn test_classify_status(#[case] status: StatusCode, #[case] expected: &str) {
        let class = match classify_status(status, "") {
            SendOutcome::Delivered => "delivered",
            SendOutcome::Rejected(_) => "rejected",
            SendOutcome::TransportFailed(_) => "transport",
            SendOutcome::PartiallyRejected(_) => "partial",
        };
        assert_eq!(class, expected);
    }

    #[test]
    fn test_reason_carries_body() {
        let outcome = classify_status(StatusCode::BAD_REQUEST, "bad point id");
        assert_eq!(
            outcome,
            SendOutcome::Rejected("HTTP 400 Bad Request: bad point id".to_string())
        );
    }

    #[test]
    fn test_invalid_header_is_configuration_error() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = HttpSink::new("http://127.0.0.1:1/ingest", &headers, None)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_invalid_endpoint_is_configuration_error() {
        let err = HttpSink::new("not a url", &HashMap::new(), None).err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_failure() {
        // Port 1 on loopback refuses connections.
        let sink = HttpSink::new("http://127.0.0.1:1/ingest", &HashMap::new(), None).unwrap();
        let batch = Batch::Values(Vec::new());
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        assert!(sink.send(&batch, deadline).await.is_transport_failure());
    }

    #[tokio::test]
    async fn test_unreadable_cached_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = HttpSink::new("http://127.0.0.1:1/ingest", &HashMap::new(), None).unwrap();
        let batch = Batch::File(north_cache::CachedFile {
            stored_path: dir.path().join("vanished.csv"),
            original_name: "vanished.csv".to_string(),
            created_at: chrono::Utc::now(),
        });
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let outcome = sink.send(&batch, deadline).await;
        assert!(matches!(outcome, SendOutcome::Rejected(_)), "{outcome:?}");
    }
}

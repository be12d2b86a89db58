//! HTTP transport to the remote collector
//!
//! One POST per staged unit. The body is the unit's newline-joined envelopes,
//! sent as `application/x-json-stream` and optionally gzip-compressed.

use std::io::Write;

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};

/// Content type of a staged unit on the wire
pub const JSON_STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

/// What the sender needs to know about a collector response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Response text, read only for non-2xx responses
    pub body: Option<String>,
}

/// Ships one payload to the collector.
///
/// `Err` means no status was received (connect failure, timeout, broken body).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &str) -> Result<TransportResponse>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: String,
    gzip: bool,
}

impl HttpTransport {
    /// Create a transport from configuration
    ///
    /// Returns an error if the configuration is invalid or the client cannot be built.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let endpoint = config
            .endpoint_url
            .clone()
            .ok_or_else(|| Error::Config("pipeline.endpoint_url is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(JSON_STREAM_CONTENT_TYPE),
        );

        // The read timeout bounds the whole exchange once connected
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout() + config.read_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint,
            gzip: config.gzip,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &str) -> Result<TransportResponse> {
        let mut request = self.http_client.post(&self.endpoint);

        let body = if self.gzip {
            match gzip(payload.as_bytes()) {
                Ok(compressed) => {
                    request = request.header(CONTENT_ENCODING, "gzip");
                    compressed
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to gzip payload, sending uncompressed");
                    payload.as_bytes().to_vec()
                }
            }
        } else {
            payload.as_bytes().to_vec()
        };

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = if status.is_success() {
            None
        } else {
            Some(
                response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string()),
            )
        };

        Ok(TransportResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn gzip(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

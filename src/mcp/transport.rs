//! Transport seam for the event-stream session.
//!
//! The lifecycle code only needs three things from the wire: the origin used
//! to resolve the discovered message endpoint, a long-lived byte stream, and
//! a way to POST JSON-RPC envelopes. [`HttpEventTransport`] provides them over
//! reqwest; tests substitute an in-memory implementation.

use super::classify::classify_http_status;
use super::error::SearchError;
use super::session::origin_of;
use crate::core::config::ClientConfig;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_EVENT_STREAM_ACCEPT: &str = "text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Raw chunks from the stream; errors are transport failures.
pub type EventStream = BoxStream<'static, Result<Vec<u8>, String>>;

#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Scheme, host and port of the stream endpoint.
    fn origin(&self) -> Url;

    /// Opens the long-lived event stream.
    async fn open(&self) -> Result<EventStream, SearchError>;

    /// Sends one JSON-RPC envelope to the message endpoint.
    ///
    /// Responses arrive on the event stream; the HTTP body is only drained.
    async fn post(&self, endpoint: &Url, payload: String) -> Result<(), SearchError>;
}

pub struct HttpEventTransport {
    client: reqwest::Client,
    stream_url: Url,
    auth_header: Option<String>,
    protocol_version: String,
    post_timeout: Duration,
}

impl HttpEventTransport {
    pub fn new(config: &ClientConfig, token: Option<String>) -> Result<Self, SearchError> {
        // No overall client timeout: it would cut the long-lived stream.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
            .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|err| {
                SearchError::connection(format!("Failed to build HTTP client: {err}"))
            })?;

        Ok(Self {
            client,
            stream_url: config.base_url.clone(),
            auth_header: token
                .filter(|token| !token.trim().is_empty())
                .map(|token| format!("Bearer {}", token.trim())),
            protocol_version: config.protocol_version.clone(),
            post_timeout: config.request_timeout,
        })
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_header {
            Some(auth) => request.header("Authorization", auth),
            None => request,
        }
    }
}

pub fn apply_client_post_headers(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

pub fn apply_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

async fn error_for_status(response: reqwest::Response) -> SearchError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_http_status(status, &body)
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    fn origin(&self) -> Url {
        origin_of(&self.stream_url)
    }

    async fn open(&self) -> Result<EventStream, SearchError> {
        debug!(url = %self.stream_url, "Opening MCP event stream");
        let request = self.apply_auth(
            self.client
                .get(self.stream_url.clone())
                .header("Accept", MCP_EVENT_STREAM_ACCEPT),
        );

        let response = request
            .send()
            .await
            .map_err(|err| SearchError::connection(err.to_string()))?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_event_stream_content_type(&content_type) {
            return Err(SearchError::protocol(format!(
                "Expected an event stream, got content type {content_type:?}"
            )));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|err| err.to_string())
            })
            .boxed())
    }

    async fn post(&self, endpoint: &Url, payload: String) -> Result<(), SearchError> {
        debug!(url = %endpoint, bytes = payload.len(), "Posting MCP message");
        let request = apply_protocol_version_header(
            apply_client_post_headers(self.client.post(endpoint.clone())),
            Some(self.protocol_version.as_str()),
        )
        .timeout(self.post_timeout)
        .body(payload);

        let response = self
            .apply_auth(request)
            .send()
            .await
            .map_err(|err| SearchError::connection(err.to_string()))?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        response
            .bytes()
            .await
            .map_err(|err| SearchError::connection(err.to_string()))?;
        Ok(())
    }
}

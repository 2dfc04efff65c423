//! Sample results and the transport seam samplers execute through.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub use reqwest::Method;

/// The immutable record of one sampler invocation.
///
/// Produced once per unit of work, owned by the executing thread only until
/// it has been handed to every applicable listener, and never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    /// Label the result is aggregated under.
    pub label: String,
    /// Name of the virtual user that produced the result.
    pub thread_name: String,
    /// Milliseconds since the unix epoch at which the request was fired.
    pub start_millis: u64,
    /// Wall-clock time the unit of work took.
    pub elapsed: Duration,
    /// Protocol-level success flag (response received and status < 400).
    pub success: bool,
    pub request: RequestRecord,
    /// Present when the transport produced a response, absent on
    /// timeouts and connection failures.
    pub response: Option<ResponseRecord>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Transport error detail when no response was received.
    pub error: Option<String>,
}

impl SampleResult {
    /// Response status as written to result files; empty when the request
    /// never produced a response.
    pub fn response_code(&self) -> String {
        self.response
            .as_ref()
            .map(|r| r.status.to_string())
            .unwrap_or_default()
    }

    /// Status text, or the transport error detail for failed exchanges.
    pub fn response_message(&self) -> &str {
        match &self.response {
            Some(r) => &r.status_text,
            None => self.error.as_deref().unwrap_or(""),
        }
    }
}

/// Request metadata captured on a [`SampleResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    /// Effective headers after scope resolution.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Response metadata captured on a [`SampleResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// One outbound request, fully resolved, as a sampler hands it to the
/// transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    /// Approximate request size on the wire, for the `sentBytes` field.
    pub fn wire_size(&self) -> u64 {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len() + 4)
            .sum();
        let body_bytes = self.body.as_ref().map(String::len).unwrap_or(0);
        (self.method.as_str().len() + self.url.len() + header_bytes + body_bytes) as u64
    }
}

/// Response as returned by a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Approximate response size on the wire, for the `bytes` field.
    pub fn wire_size(&self) -> u64 {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len() + 4)
            .sum();
        (header_bytes + self.body.len()) as u64
    }
}

/// The protocol seam samplers execute through.
///
/// The default implementation is [`HttpTransport`]; tests swap in stubs to
/// get deterministic outcomes. A transport must never panic on request
/// failure: timeouts and refused connections are ordinary `Err` values that
/// the executor turns into failed [`SampleResult`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Reqwest-backed [`Transport`] used by default.
///
/// Holds a single shared client; connection pooling across virtual users is
/// intentional and mirrors what real callers of the target would do.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)?
            .to_vec();

        Ok(TransportResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_is_empty_without_response() {
        let result = SampleResult {
            label: "s1".into(),
            thread_name: "g1 t1".into(),
            start_millis: 0,
            elapsed: Duration::from_millis(5),
            success: false,
            request: RequestRecord {
                method: "GET".into(),
                url: "http://localhost/".into(),
                headers: vec![],
                body: None,
            },
            response: None,
            bytes_sent: 0,
            bytes_received: 0,
            error: Some("request timed out".into()),
        };
        assert_eq!(result.response_code(), "");
        assert_eq!(result.response_message(), "request timed out");
    }

    #[test]
    fn wire_size_counts_headers_and_body() {
        let request = TransportRequest {
            method: Method::POST,
            url: "http://h/".into(),
            headers: vec![("a".into(), "b".into())],
            body: Some("xyz".into()),
            timeout: None,
        };
        // method(4) + url(9) + header(1+1+4) + body(3)
        assert_eq!(request.wire_size(), 22);
    }
}

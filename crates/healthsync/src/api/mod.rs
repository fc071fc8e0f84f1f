//! Backend HTTP layer
//!
//! Uses synchronous HTTP (ureq) behind [`HttpTransport`] to stay
//! executor-agnostic; tests swap in [`MockTransport`].

mod auth;
mod client;
mod mock;
pub mod payload;

use anyhow::Result;

pub use auth::TokenManager;
pub use client::UreqTransport;
pub use mock::MockTransport;
pub use payload::{PayloadRecord, PayloadValue, Section, SyncPayload, build_payload};

/// A POST request ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// JSON POST with an optional `Authorization` header
    pub fn json(url: impl Into<String>, body: Vec<u8>, authorization: Option<&str>) -> Self {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(auth) = authorization {
            headers.push(("Authorization".to_string(), auth.to_string()));
        }
        Self {
            url: url.into(),
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status and body of a completed request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP POST capability
///
/// Any HTTP status is a successful `Ok`; `Err` means no response was received.
pub trait HttpTransport: Send + Sync {
    fn post(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

//! ureq-backed HTTP transport

use anyhow::{Context, Result};
use std::time::Duration;

use super::{HttpRequest, HttpResponse, HttpTransport};

/// Production transport using a shared ureq agent
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    /// Create a transport whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            // Non-2xx statuses are classified by the caller, not raised as errors
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl HttpTransport for UreqTransport {
    fn post(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.agent.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut response = builder
            .send(request.body.as_slice())
            .with_context(|| format!("Failed to send POST to {}", request.url))?;

        let status = response.status().as_u16();
        // An unreadable body still carries a meaningful status
        let body = response.body_mut().read_to_string().unwrap_or_default();

        Ok(HttpResponse { status, body })
    }
}

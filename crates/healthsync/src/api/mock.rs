//! Mock transport for testing.
//!
//! Allows queueing responses and capturing sent requests for verification.

use anyhow::{Result, bail};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{HttpRequest, HttpResponse, HttpTransport};

/// Mock transport for testing.
///
/// Responses are taken from the first matching route queue (URL substring),
/// then from the general queue, then the default response (200, `{}`).
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    requests: Vec<HttpRequest>,
    routes: Vec<(String, VecDeque<HttpResponse>)>,
    queue: VecDeque<HttpResponse>,
    default_response: Option<HttpResponse>,
    fail_next: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a response for the next request not matched by a route.
    pub fn queue_response(&self, status: u16, body: &str) {
        self.inner().queue.push_back(HttpResponse::new(status, body));
    }

    /// Queue a response for the next request whose URL contains `fragment`.
    pub fn queue_response_for(&self, fragment: &str, status: u16, body: &str) {
        let mut inner = self.inner();
        let response = HttpResponse::new(status, body);
        match inner.routes.iter_mut().find(|(f, _)| f == fragment) {
            Some((_, queue)) => queue.push_back(response),
            None => inner
                .routes
                .push((fragment.to_string(), VecDeque::from([response]))),
        }
    }

    /// Response used once every queue is empty.
    pub fn set_default_response(&self, status: u16, body: &str) {
        self.inner().default_response = Some(HttpResponse::new(status, body));
    }

    /// Cause the next request to fail without a response.
    pub fn fail_next(&self, error: &str) {
        self.inner().fail_next = Some(error.to_string());
    }

    /// Get all requests that were sent.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.inner().requests.clone()
    }

    /// Requests whose URL contains `fragment`.
    pub fn requests_matching(&self, fragment: &str) -> Vec<HttpRequest> {
        self.inner()
            .requests
            .iter()
            .filter(|r| r.url.contains(fragment))
            .cloned()
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.inner().requests.len()
    }

    /// Clear all state (requests, queues, failures).
    pub fn reset(&self) {
        *self.inner() = MockTransportInner::default();
    }
}

impl HttpTransport for MockTransport {
    fn post(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut inner = self.inner();
        inner.requests.push(request.clone());

        if let Some(error) = inner.fail_next.take() {
            bail!("mock transport failure: {}", error);
        }

        let routed = inner
            .routes
            .iter_mut()
            .find(|(fragment, queue)| request.url.contains(fragment.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front());

        if let Some(response) = routed {
            return Ok(response);
        }
        if let Some(response) = inner.queue.pop_front() {
            return Ok(response);
        }
        Ok(inner
            .default_response
            .clone()
            .unwrap_or_else(|| HttpResponse::new(200, "{}")))
    }
}

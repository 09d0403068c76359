//! Data source abstraction for change feed reads.

use crate::error::SourceError;
use async_trait::async_trait;
use leasefeed_protocol::status::{code, sub_status};
use leasefeed_protocol::{ChangeFeedRequest, Document, ResponseHeaders};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A change feed source performs one page read against the document store.
///
/// This trait abstracts the wire transport, allowing for different
/// implementations (HTTP, direct connectivity, in-memory for testing).
/// Implementations must not retry; the processor owns the retry policy.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Reads one page.
    ///
    /// Returns `Err` only when no response was received at all.
    async fn fetch_page(&self, request: &ChangeFeedRequest) -> Result<SourceResponse, SourceError>;
}

#[async_trait]
impl<S: ChangeFeedSource + ?Sized> ChangeFeedSource for Arc<S> {
    async fn fetch_page(&self, request: &ChangeFeedRequest) -> Result<SourceResponse, SourceError> {
        (**self).fetch_page(request).await
    }
}

/// Raw response of a page read.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResponse {
    /// Status code.
    pub status: u16,
    /// Sub-status code.
    pub sub_status: u32,
    /// Documents of a 200 response.
    pub documents: Vec<Document>,
    /// Continuation of the position after this response.
    pub etag: Option<String>,
    /// Cost of the read.
    pub request_charge: f64,
    /// Server-side identifier of the read.
    pub activity_id: String,
    /// Delay requested before retrying.
    pub retry_after: Option<Duration>,
    /// Error message.
    pub message: Option<String>,
    /// Remaining headers.
    pub headers: ResponseHeaders,
}

impl SourceResponse {
    fn with_status(status: u16, sub_status: u32) -> Self {
        Self {
            status,
            sub_status,
            documents: Vec::new(),
            etag: None,
            request_charge: 0.0,
            activity_id: uuid::Uuid::new_v4().to_string(),
            retry_after: None,
            message: None,
            headers: ResponseHeaders::new(),
        }
    }

    /// A 200 response carrying documents.
    pub fn ok(documents: Vec<Document>, etag: impl Into<String>) -> Self {
        let mut response = Self::with_status(code::OK, sub_status::NONE);
        response.documents = documents;
        response.etag = Some(etag.into());
        response
    }

    /// A 304 response.
    pub fn not_modified(etag: impl Into<String>) -> Self {
        let mut response = Self::with_status(code::NOT_MODIFIED, sub_status::NONE);
        response.etag = Some(etag.into());
        response
    }

    /// An error response.
    pub fn error(status: u16, sub_status: u32) -> Self {
        Self::with_status(status, sub_status)
    }

    /// Sets the retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Sets the error message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the request charge.
    pub fn with_request_charge(mut self, charge: f64) -> Self {
        self.request_charge = charge;
        self
    }

    /// Removes the etag.
    pub fn without_etag(mut self) -> Self {
        self.etag = None;
        self
    }

    /// Returns true for 200 and 304.
    pub fn has_page(&self) -> bool {
        self.status == code::OK || self.status == code::NOT_MODIFIED
    }
}

/// A scripted source for testing.
///
/// Responses are returned in the order they were queued. Every request is
/// recorded so tests can assert on what the processor asked for.
#[derive(Debug, Default)]
pub struct MockChangeFeedSource {
    responses: Mutex<VecDeque<Result<SourceResponse, SourceError>>>,
    requests: Mutex<Vec<ChangeFeedRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl MockChangeFeedSource {
    /// Creates a source with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: SourceResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: SourceError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Makes every read take this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Returns the requests received so far.
    pub fn requests(&self) -> Vec<ChangeFeedRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of reads performed.
    pub fn fetch_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns the number of responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl ChangeFeedSource for MockChangeFeedSource {
    async fn fetch_page(&self, request: &ChangeFeedRequest) -> Result<SourceResponse, SourceError> {
        self.requests.lock().push(request.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::new("no scripted response left")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasefeed_protocol::{ChangeFeedState, FeedRange, FeedRangeState};
    use serde_json::json;

    fn request() -> ChangeFeedRequest {
        FeedRangeState::new(FeedRange::new("0"), ChangeFeedState::Beginning)
            .build_request(Some(10), None)
    }

    #[tokio::test]
    async fn mock_source_replays_in_order() {
        let source = MockChangeFeedSource::new();
        source.push_response(SourceResponse::ok(vec![json!({"id": "1"})], "\"1\""));
        source.push_response(SourceResponse::not_modified("\"1\""));

        let first = source.fetch_page(&request()).await.unwrap();
        assert_eq!(first.status, 200);
        assert_eq!(first.documents.len(), 1);

        let second = source.fetch_page(&request()).await.unwrap();
        assert_eq!(second.status, 304);
        assert_eq!(source.fetch_count(), 2);
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test]
    async fn mock_source_exhausted() {
        let source = MockChangeFeedSource::new();
        let err = source.fetch_page(&request()).await.unwrap_err();
        assert_eq!(err, SourceError::new("no scripted response left"));
        assert_eq!(source.requests()[0].page_size_hint, Some(10));
    }

    #[test]
    fn response_builders() {
        let response = SourceResponse::error(429, 3200)
            .with_retry_after(Duration::from_millis(10))
            .with_message("throttled");
        assert!(!response.has_page());
        assert_eq!(response.retry_after, Some(Duration::from_millis(10)));
        assert_eq!(response.message.as_deref(), Some("throttled"));

        assert!(SourceResponse::ok(vec![], "\"0\"").has_page());
        assert!(SourceResponse::not_modified("\"0\"").has_page());
        assert!(SourceResponse::not_modified("\"0\"")
            .without_etag()
            .etag
            .is_none());
    }
}

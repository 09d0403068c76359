//! One-page-at-a-time reader over a change feed source.

use crate::error::{ProcessorError, ProcessorResult};
use crate::source::{ChangeFeedSource, SourceResponse};
use leasefeed_protocol::status::{code, sub_status};
use leasefeed_protocol::{classify_response, ChangeFeedPage, DocDbError, FeedRangeState, PageFailure};
use tracing::{trace, warn};

/// Reads the page that follows a position.
///
/// Stateless across calls: the caller threads the returned state into the
/// next call. Failures are classified and returned, never retried here.
#[derive(Debug)]
pub struct PageEnumerator<S> {
    source: S,
    session_token: Option<String>,
}

impl<S: ChangeFeedSource> PageEnumerator<S> {
    /// Creates an enumerator over `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            session_token: None,
        }
    }

    /// Forwards a session token on every read.
    pub fn with_session_token(mut self, token: Option<String>) -> Self {
        self.session_token = token;
        self
    }

    /// Returns the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches the page after `state`.
    pub async fn fetch_next(
        &self,
        state: &FeedRangeState,
        page_size_hint: Option<u32>,
    ) -> ProcessorResult<ChangeFeedPage> {
        let request = state.build_request(page_size_hint, self.session_token.as_deref());
        trace!(range = %state.range, state = %state.state, ?page_size_hint, "fetching page");

        match self.source.fetch_page(&request).await {
            Ok(response) => into_page(state, response),
            Err(err) => {
                warn!(range = %state.range, error = %err, "change feed source unavailable");
                Err(ProcessorError::Fetch(
                    PageFailure::new(
                        DocDbError::TransientError,
                        code::SERVICE_UNAVAILABLE,
                        sub_status::NONE,
                    )
                    .with_message(err.to_string()),
                ))
            }
        }
    }
}

fn into_page(state: &FeedRangeState, response: SourceResponse) -> ProcessorResult<ChangeFeedPage> {
    match response.status {
        code::OK => {
            let next = state.state.advance(response.etag.as_deref())?;
            // A priming read only resolves the tail.
            let documents = if state.state.is_priming() {
                Vec::new()
            } else {
                response.documents
            };
            Ok(ChangeFeedPage::Success {
                documents,
                request_charge: response.request_charge,
                activity_id: response.activity_id,
                headers: response.headers,
                state: state.with_state(next),
            })
        }
        code::NOT_MODIFIED => {
            let next = state.state.advance(response.etag.as_deref())?;
            Ok(ChangeFeedPage::NotModified {
                request_charge: response.request_charge,
                activity_id: response.activity_id,
                headers: response.headers,
                state: state.with_state(next),
            })
        }
        status => {
            let error = classify_response(status, response.sub_status, response.message.as_deref());
            let mut failure = PageFailure::new(error, status, response.sub_status)
                .with_retry_after(response.retry_after)
                .with_activity_id(response.activity_id);
            failure.message = response.message;
            Err(ProcessorError::Fetch(failure))
        }
    }
}

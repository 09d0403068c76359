//! In-memory change feed for tests and local runs.
//!
//! Every range keeps an append-only log of documents numbered by a log
//! sequence number (LSN). Continuations are quoted LSNs (`"12"`), so a
//! resumed read returns exactly the documents appended after that point.

use crate::error::SourceError;
use crate::source::{ChangeFeedSource, SourceResponse};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use leasefeed_protocol::status::{code, sub_status};
use leasefeed_protocol::{headers, ChangeFeedRequest, ContinuationToken, Document};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

/// Page size used when a request carries no page size.
const DEFAULT_PAGE_SIZE: usize = 100;

/// A scripted failure returned instead of a page.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRule {
    /// Only requests for this range fail; `None` matches every range.
    pub range: Option<String>,
    /// Status code returned.
    pub status: u16,
    /// Sub-status code returned.
    pub sub_status: u32,
    /// Number of requests that fail; `None` fails forever.
    pub hit_limit: Option<u32>,
    /// Retry-after hint returned.
    pub retry_after: Option<Duration>,
    /// Error message returned.
    pub message: Option<String>,
    hits: u32,
}

impl FaultRule {
    /// Fails every request with the given status.
    pub fn new(status: u16, sub_status: u32) -> Self {
        Self {
            range: None,
            status,
            sub_status,
            hit_limit: None,
            retry_after: None,
            message: None,
            hits: 0,
        }
    }

    /// Restricts the rule to one range.
    pub fn for_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    /// Stops failing after `limit` hits.
    pub fn times(mut self, limit: u32) -> Self {
        self.hit_limit = Some(limit);
        self
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

    /// Number of requests this rule failed so far.
    pub fn hits(&self) -> u32 {
        self.hits
    }

    fn matches(&self, range: &str) -> bool {
        let exhausted = self.hit_limit.is_some_and(|limit| self.hits >= limit);
        !exhausted && self.range.as_deref().map_or(true, |r| r == range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeStatus {
    Active,
    Split,
    Removed,
}

#[derive(Debug)]
struct Entry {
    lsn: u64,
    at: DateTime<Utc>,
    document: Document,
}

#[derive(Debug)]
struct RangeLog {
    entries: Vec<Entry>,
    status: RangeStatus,
}

impl RangeLog {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            status: RangeStatus::Active,
        }
    }

    fn tail(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.lsn)
    }
}

#[derive(Debug, Default)]
struct Inner {
    ranges: BTreeMap<String, RangeLog>,
    faults: Vec<FaultRule>,
    requests: Vec<ChangeFeedRequest>,
    max_page_size: Option<u32>,
}

/// Deterministic change feed over in-memory logs.
#[derive(Debug, Default)]
pub struct InMemoryChangeFeedSource {
    inner: Mutex<Inner>,
}

/// Renders an LSN as a continuation.
pub fn lsn_token(lsn: u64) -> ContinuationToken {
    ContinuationToken::new(format!("\"{lsn}\""))
}

fn parse_lsn(token: &str) -> Option<u64> {
    token.trim_matches('"').parse().ok()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

impl InMemoryChangeFeedSource {
    /// Creates a source with no ranges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects requests asking for more than `size` documents with a 413.
    pub fn with_max_page_size(self, size: u32) -> Self {
        self.inner.lock().max_page_size = Some(size);
        self
    }

    /// Creates an empty range.
    pub fn add_range(&self, range: impl Into<String>) {
        self.inner
            .lock()
            .ranges
            .entry(range.into())
            .or_insert_with(RangeLog::new);
    }

    /// Appends a document now, returning its LSN.
    pub fn append(&self, range: &str, document: Document) -> u64 {
        self.append_at(range, document, Utc::now())
    }

    /// Appends a document with an explicit timestamp, returning its LSN.
    ///
    /// Object documents get an `_lsn` field.
    pub fn append_at(&self, range: &str, mut document: Document, at: DateTime<Utc>) -> u64 {
        let mut inner = self.inner.lock();
        let log = inner
            .ranges
            .entry(range.to_string())
            .or_insert_with(RangeLog::new);
        let lsn = log.tail() + 1;
        if let Some(object) = document.as_object_mut() {
            object.insert("_lsn".into(), lsn.into());
        }
        log.entries.push(Entry { lsn, at, document });
        lsn
    }

    /// Marks a range as split; reads return 410 with PartitionKeyRangeGone.
    pub fn split(&self, range: &str) {
        self.set_status(range, RangeStatus::Split);
    }

    /// Marks a range as deleted; reads return 404.
    pub fn remove(&self, range: &str) {
        self.set_status(range, RangeStatus::Removed);
    }

    fn set_status(&self, range: &str, status: RangeStatus) {
        if let Some(log) = self.inner.lock().ranges.get_mut(range) {
            log.status = status;
        }
    }

    /// Adds a fault rule, returning its index for [`Self::fault_hits`].
    pub fn inject_fault(&self, rule: FaultRule) -> usize {
        let mut inner = self.inner.lock();
        inner.faults.push(rule);
        inner.faults.len() - 1
    }

    /// Returns how many requests the rule at `index` failed.
    pub fn fault_hits(&self, index: usize) -> u32 {
        self.inner.lock().faults.get(index).map_or(0, FaultRule::hits)
    }

    /// Returns the continuation after the newest document of `range`.
    pub fn tail(&self, range: &str) -> Option<ContinuationToken> {
        self.inner
            .lock()
            .ranges
            .get(range)
            .map(|log| lsn_token(log.tail()))
    }

    /// Returns the requests received so far.
    pub fn requests(&self) -> Vec<ChangeFeedRequest> {
        self.inner.lock().requests.clone()
    }

    /// Returns the number of reads performed.
    pub fn fetch_count(&self) -> usize {
        self.inner.lock().requests.len()
    }
}

impl Inner {
    fn respond(&mut self, request: &ChangeFeedRequest) -> SourceResponse {
        let range = request.range.id();

        if let Some(rule) = self.faults.iter_mut().find(|rule| rule.matches(range)) {
            rule.hits += 1;
            let mut response = SourceResponse::error(rule.status, rule.sub_status);
            response.retry_after = rule.retry_after;
            response.message = rule.message.clone();
            return response;
        }

        let Some(log) = self.ranges.get(range) else {
            return SourceResponse::error(code::NOT_FOUND, sub_status::NONE)
                .with_message(format!("range {range} does not exist"));
        };
        match log.status {
            RangeStatus::Active => {}
            RangeStatus::Split => {
                return SourceResponse::error(code::GONE, sub_status::PARTITION_KEY_RANGE_GONE)
                    .with_message(format!("range {range} was split"));
            }
            RangeStatus::Removed => {
                return SourceResponse::error(code::NOT_FOUND, sub_status::NONE)
                    .with_message(format!("range {range} was removed"));
            }
        }

        if let (Some(limit), Some(requested)) = (self.max_page_size, request.page_size_hint) {
            if requested > limit {
                return SourceResponse::error(code::REQUEST_ENTITY_TOO_LARGE, sub_status::NONE)
                    .with_message("Reduce page size and try again.");
            }
        }
        let page_size = request
            .page_size_hint
            .map_or(DEFAULT_PAGE_SIZE, |size| size as usize);

        let if_none_match = request.headers.get(headers::IF_NONE_MATCH);
        let if_modified_since = request.headers.get(headers::IF_MODIFIED_SINCE);

        let candidates: Vec<&Entry> = match (if_none_match, if_modified_since) {
            (Some(headers::MATCH_ANY), _) => {
                return SourceResponse::not_modified(lsn_token(log.tail()).into_inner());
            }
            (Some(token), _) => match parse_lsn(token) {
                Some(after) => log.entries.iter().filter(|e| e.lsn > after).collect(),
                None => {
                    return SourceResponse::error(code::BAD_REQUEST, sub_status::NONE)
                        .with_message(format!("invalid continuation {token}"));
                }
            },
            (None, Some(since)) => match parse_http_date(since) {
                Some(since) => log.entries.iter().filter(|e| e.at >= since).collect(),
                None => {
                    return SourceResponse::error(code::BAD_REQUEST, sub_status::NONE)
                        .with_message(format!("invalid If-Modified-Since {since}"));
                }
            },
            (None, None) => log.entries.iter().collect(),
        };

        if candidates.is_empty() {
            let cursor = if_none_match
                .and_then(parse_lsn)
                .unwrap_or_else(|| log.tail());
            return SourceResponse::not_modified(lsn_token(cursor).into_inner());
        }

        let page: Vec<&Entry> = candidates.into_iter().take(page_size.max(1)).collect();
        let last = page.last().map_or(0, |e| e.lsn);
        let documents = page.into_iter().map(|e| e.document.clone()).collect();
        SourceResponse::ok(documents, lsn_token(last).into_inner())
            .with_request_charge(1.0)
    }
}

#[async_trait]
impl ChangeFeedSource for InMemoryChangeFeedSource {
    async fn fetch_page(&self, request: &ChangeFeedRequest) -> Result<SourceResponse, SourceError> {
        let mut inner = self.inner.lock();
        inner.requests.push(request.clone());
        Ok(inner.respond(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use leasefeed_protocol::{ChangeFeedState, FeedRange, FeedRangeState};
    use serde_json::json;

    fn request(state: ChangeFeedState, page_size: Option<u32>) -> ChangeFeedRequest {
        FeedRangeState::new(FeedRange::new("0"), state).build_request(page_size, None)
    }

    fn lsns(response: &SourceResponse) -> Vec<u64> {
        response
            .documents
            .iter()
            .map(|d| d["_lsn"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn pages_from_beginning_then_continuation() {
        let source = InMemoryChangeFeedSource::new();
        for i in 0..5 {
            source.append("0", json!({"id": i}));
        }

        let first = source
            .fetch_page(&request(ChangeFeedState::Beginning, Some(3)))
            .await
            .unwrap();
        assert_eq!(first.status, 200);
        assert_eq!(lsns(&first), vec![1, 2, 3]);
        assert_eq!(first.etag.as_deref(), Some("\"3\""));

        let second = source
            .fetch_page(&request(ChangeFeedState::continuation("\"3\""), Some(3)))
            .await
            .unwrap();
        assert_eq!(lsns(&second), vec![4, 5]);

        let third = source
            .fetch_page(&request(ChangeFeedState::continuation("\"5\""), Some(3)))
            .await
            .unwrap();
        assert_eq!(third.status, 304);
        assert_eq!(third.etag.as_deref(), Some("\"5\""));
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn now_resolves_the_tail() {
        let source = InMemoryChangeFeedSource::new();
        source.append("0", json!({}));
        source.append("0", json!({}));

        let response = source
            .fetch_page(&request(ChangeFeedState::Now, None))
            .await
            .unwrap();
        assert_eq!(response.status, 304);
        assert_eq!(response.etag.as_deref(), Some("\"2\""));
        assert_eq!(source.tail("0"), Some(lsn_token(2)));
    }

    #[tokio::test]
    async fn time_filters_by_timestamp() {
        let source = InMemoryChangeFeedSource::new();
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        source.append_at("0", json!({"id": "a"}), early);
        source.append_at("0", json!({"id": "b"}), late);

        let response = source
            .fetch_page(&request(
                ChangeFeedState::Time(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(lsns(&response), vec![2]);

        let response = source
            .fetch_page(&request(
                ChangeFeedState::Time(ChangeFeedState::BEGINNING_OF_TIME),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(lsns(&response), vec![1, 2]);
    }

    #[tokio::test]
    async fn split_and_removed_ranges() {
        let source = InMemoryChangeFeedSource::new();
        source.add_range("0");
        source.split("0");
        let response = source
            .fetch_page(&request(ChangeFeedState::Beginning, None))
            .await
            .unwrap();
        assert_eq!((response.status, response.sub_status), (410, 1002));

        source.remove("0");
        let response = source
            .fetch_page(&request(ChangeFeedState::Beginning, None))
            .await
            .unwrap();
        assert_eq!(response.status, 404);

        let unknown = FeedRangeState::new(FeedRange::new("9"), ChangeFeedState::Beginning)
            .build_request(None, None);
        assert_eq!(source.fetch_page(&unknown).await.unwrap().status, 404);
    }

    #[tokio::test]
    async fn faults_are_hit_counted() {
        let source = InMemoryChangeFeedSource::new();
        source.append("0", json!({}));
        let rule = source.inject_fault(
            FaultRule::new(429, 3200)
                .times(2)
                .with_retry_after(Duration::from_millis(5)),
        );

        for _ in 0..2 {
            let response = source
                .fetch_page(&request(ChangeFeedState::Beginning, None))
                .await
                .unwrap();
            assert_eq!(response.status, 429);
            assert_eq!(response.retry_after, Some(Duration::from_millis(5)));
        }
        let response = source
            .fetch_page(&request(ChangeFeedState::Beginning, None))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(source.fault_hits(rule), 2);
    }

    #[tokio::test]
    async fn fault_scoped_to_other_range_is_ignored() {
        let source = InMemoryChangeFeedSource::new();
        source.append("0", json!({}));
        let rule = source.inject_fault(FaultRule::new(503, 0).for_range("1"));

        let response = source
            .fetch_page(&request(ChangeFeedState::Beginning, None))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(source.fault_hits(rule), 0);
    }

    #[tokio::test]
    async fn oversized_pages_are_rejected() {
        let source = InMemoryChangeFeedSource::new().with_max_page_size(10);
        source.append("0", json!({}));

        let response = source
            .fetch_page(&request(ChangeFeedState::Beginning, Some(11)))
            .await
            .unwrap();
        assert_eq!(response.status, 413);

        let response = source
            .fetch_page(&request(ChangeFeedState::Beginning, Some(10)))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn garbage_continuation_is_a_bad_request() {
        let source = InMemoryChangeFeedSource::new();
        source.add_range("0");
        let response = source
            .fetch_page(&request(ChangeFeedState::continuation("not-an-lsn"), None))
            .await
            .unwrap();
        assert_eq!(response.status, 400);
    }
}

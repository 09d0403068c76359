//! Change feed cursor states and request construction.

use crate::error::{ProtocolError, ProtocolResult};
use crate::lease::ContinuationToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Header names used on change feed requests.
pub mod headers {
    /// Continuation (etag) to resume after, or `*` for the current tail.
    pub const IF_NONE_MATCH: &str = "If-None-Match";
    /// Start time for a time-based read.
    pub const IF_MODIFIED_SINCE: &str = "If-Modified-Since";
    /// Marks the request as an incremental feed read.
    pub const A_IM: &str = "A-IM";
    /// Page size hint.
    pub const MAX_ITEM_COUNT: &str = "x-ms-max-item-count";
    /// Session token for session consistency.
    pub const SESSION_TOKEN: &str = "x-ms-session-token";

    /// Value of `A-IM` for change feed reads.
    pub const INCREMENTAL_FEED: &str = "Incremental feed";
    /// `If-None-Match` value that asks for the current tail.
    pub const MATCH_ANY: &str = "*";
}

/// Identity of a partition slice being consumed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedRange(String);

impl FeedRange {
    /// Creates a range identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the range identity.
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeedRange {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Position of a cursor within one range.
///
/// `Beginning`, `Time` and `Now` are start positions. Each of them becomes
/// `Continuation` after the first successful or not-modified response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ChangeFeedState {
    /// Start of the log.
    Beginning,
    /// Changes made at or after the given time.
    Time(DateTime<Utc>),
    /// Resume after an opaque cursor.
    Continuation(ContinuationToken),
    /// Current tail, resolved by a priming read.
    Now,
}

impl ChangeFeedState {
    /// Time value that means "from the beginning" rather than a real instant.
    pub const BEGINNING_OF_TIME: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

    /// Creates a continuation state.
    pub fn continuation(token: impl Into<ContinuationToken>) -> Self {
        ChangeFeedState::Continuation(token.into())
    }

    /// Returns true if the next read only resolves the tail.
    pub fn is_priming(&self) -> bool {
        matches!(self, ChangeFeedState::Now)
    }

    /// Returns the continuation if this state holds one.
    pub fn continuation_token(&self) -> Option<&ContinuationToken> {
        match self {
            ChangeFeedState::Continuation(token) => Some(token),
            _ => None,
        }
    }

    /// Writes the headers that select this position.
    pub fn populate(&self, out: &mut RequestHeaders) {
        match self {
            ChangeFeedState::Beginning => {}
            ChangeFeedState::Time(start) => {
                if *start != Self::BEGINNING_OF_TIME {
                    out.insert(headers::IF_MODIFIED_SINCE, format_http_date(start));
                }
            }
            ChangeFeedState::Continuation(token) => {
                out.insert(headers::IF_NONE_MATCH, token.as_str());
            }
            ChangeFeedState::Now => {
                out.insert(headers::IF_NONE_MATCH, headers::MATCH_ANY);
            }
        }
    }

    /// Computes the state that follows a successful or not-modified response.
    ///
    /// `etag` is the continuation returned by the store. Without one, only a
    /// state that already holds a continuation can stay where it is.
    pub fn advance(&self, etag: Option<&str>) -> ProtocolResult<ChangeFeedState> {
        match (etag, self) {
            (Some(etag), _) => Ok(ChangeFeedState::continuation(etag)),
            (None, ChangeFeedState::Continuation(_)) => Ok(self.clone()),
            (None, other) => Err(ProtocolError::MissingContinuation {
                state: other.kind().into(),
            }),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ChangeFeedState::Beginning => "Beginning",
            ChangeFeedState::Time(_) => "Time",
            ChangeFeedState::Continuation(_) => "Continuation",
            ChangeFeedState::Now => "Now",
        }
    }
}

impl fmt::Display for ChangeFeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeFeedState::Time(start) => write!(f, "Time({})", start.to_rfc3339()),
            ChangeFeedState::Continuation(token) => write!(f, "Continuation({token})"),
            other => f.write_str(other.kind()),
        }
    }
}

/// RFC 1123 date as used by `If-Modified-Since`.
fn format_http_date(time: &DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// A cursor position paired with the range it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRangeState {
    /// Range identity.
    pub range: FeedRange,
    /// Position within the range.
    pub state: ChangeFeedState,
}

impl FeedRangeState {
    /// Creates a feed range state.
    pub fn new(range: FeedRange, state: ChangeFeedState) -> Self {
        Self { range, state }
    }

    /// Builds the request for the next page of this range.
    pub fn build_request(
        &self,
        page_size_hint: Option<u32>,
        session_token: Option<&str>,
    ) -> ChangeFeedRequest {
        let mut request_headers = RequestHeaders::new();
        request_headers.insert(headers::A_IM, headers::INCREMENTAL_FEED);
        if let Some(size) = page_size_hint {
            request_headers.insert(headers::MAX_ITEM_COUNT, size.to_string());
        }
        if let Some(token) = session_token {
            request_headers.insert(headers::SESSION_TOKEN, token);
        }
        self.state.populate(&mut request_headers);

        ChangeFeedRequest {
            range: self.range.clone(),
            page_size_hint,
            headers: request_headers,
        }
    }

    /// Returns the same range at a new position.
    pub fn with_state(&self, state: ChangeFeedState) -> Self {
        Self {
            range: self.range.clone(),
            state,
        }
    }

    /// Encodes to CBOR.
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Ordered request header map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders(BTreeMap<String, String>);

impl RequestHeaders {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a header, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Gets a header value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns true if the header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Iterates over headers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no header is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single change feed page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedRequest {
    /// Range to read.
    pub range: FeedRange,
    /// Requested page size.
    pub page_size_hint: Option<u32>,
    /// Request headers, including the position headers.
    pub headers: RequestHeaders,
}

impl ChangeFeedRequest {
    /// Returns true if this request only resolves the tail.
    pub fn is_priming(&self) -> bool {
        self.headers.get(headers::IF_NONE_MATCH) == Some(headers::MATCH_ANY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn range_state(state: ChangeFeedState) -> FeedRangeState {
        FeedRangeState::new(FeedRange::new("0"), state)
    }

    #[test]
    fn beginning_sets_no_position_header() {
        let request = range_state(ChangeFeedState::Beginning).build_request(None, None);
        assert!(!request.headers.contains(headers::IF_NONE_MATCH));
        assert!(!request.headers.contains(headers::IF_MODIFIED_SINCE));
        assert_eq!(
            request.headers.get(headers::A_IM),
            Some(headers::INCREMENTAL_FEED)
        );
    }

    #[test]
    fn time_sets_if_modified_since() {
        let start = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let request = range_state(ChangeFeedState::Time(start)).build_request(None, None);
        assert_eq!(
            request.headers.get(headers::IF_MODIFIED_SINCE),
            Some("Tue, 05 Mar 2024 07:08:09 GMT")
        );
        assert!(!request.headers.contains(headers::IF_NONE_MATCH));
    }

    #[test]
    fn beginning_of_time_behaves_as_beginning() {
        let request = range_state(ChangeFeedState::Time(ChangeFeedState::BEGINNING_OF_TIME))
            .build_request(None, None);
        assert!(!request.headers.contains(headers::IF_MODIFIED_SINCE));
    }

    #[test]
    fn continuation_sets_if_none_match_verbatim() {
        let request = range_state(ChangeFeedState::continuation("\"17\""))
            .build_request(Some(25), Some("0:-1#12"));
        assert_eq!(request.headers.get(headers::IF_NONE_MATCH), Some("\"17\""));
        assert_eq!(request.headers.get(headers::MAX_ITEM_COUNT), Some("25"));
        assert_eq!(request.headers.get(headers::SESSION_TOKEN), Some("0:-1#12"));
        assert!(!request.is_priming());
    }

    #[test]
    fn now_is_a_priming_read() {
        let request = range_state(ChangeFeedState::Now).build_request(None, None);
        assert_eq!(
            request.headers.get(headers::IF_NONE_MATCH),
            Some(headers::MATCH_ANY)
        );
        assert!(request.is_priming());
        assert!(ChangeFeedState::Now.is_priming());
    }

    #[test]
    fn start_states_advance_to_continuation() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for state in [
            ChangeFeedState::Beginning,
            ChangeFeedState::Time(start),
            ChangeFeedState::Now,
            ChangeFeedState::continuation("\"1\""),
        ] {
            let next = state.advance(Some("\"9\"")).unwrap();
            assert_eq!(next, ChangeFeedState::continuation("\"9\""));
        }
    }

    #[test]
    fn advance_without_etag() {
        let state = ChangeFeedState::continuation("\"3\"");
        assert_eq!(state.advance(None).unwrap(), state);

        let err = ChangeFeedState::Now.advance(None).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingContinuation {
                state: "Now".into()
            }
        );
        assert!(ChangeFeedState::Beginning.advance(None).is_err());
    }

    #[test]
    fn feed_range_state_cbor() {
        let start = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        for state in [
            ChangeFeedState::Beginning,
            ChangeFeedState::Time(start),
            ChangeFeedState::continuation("\"abc\""),
            ChangeFeedState::Now,
        ] {
            let original = range_state(state);
            let bytes = original.to_bytes().unwrap();
            assert_eq!(FeedRangeState::from_bytes(&bytes).unwrap(), original);
        }
    }

    #[test]
    fn feed_range_state_decode_garbage() {
        let err = FeedRangeState::from_bytes(&[0xFF, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn display() {
        assert_eq!(ChangeFeedState::Now.to_string(), "Now");
        assert_eq!(
            ChangeFeedState::continuation("\"5\"").to_string(),
            "Continuation(\"5\")"
        );
    }
}

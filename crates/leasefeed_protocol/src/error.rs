//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting change feed state.
///
/// Every variant indicates malformed state: either the remote replied
/// outside the protocol or a persisted position could not be read back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A response that must carry a continuation did not.
    #[error("response for state {state} carried no continuation")]
    MissingContinuation {
        /// The state the request was built from.
        state: String,
    },

    /// Failed to encode a feed range state.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Failed to decode a feed range state.
    #[error("decoding failed: {0}")]
    Decode(String),
}

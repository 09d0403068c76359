//! Status and sub-status codes returned by the document store.

/// HTTP status codes the change feed reacts to.
pub mod code {
    /// Page with changes.
    pub const OK: u16 = 200;
    /// No new changes since the supplied continuation.
    pub const NOT_MODIFIED: u16 = 304;
    /// Malformed request.
    pub const BAD_REQUEST: u16 = 400;
    /// Resource (range, container) does not exist.
    pub const NOT_FOUND: u16 = 404;
    /// Request did not finish within its deadline.
    pub const REQUEST_TIMEOUT: u16 = 408;
    /// Resource existed but is gone (split, merge).
    pub const GONE: u16 = 410;
    /// Payload exceeds what the service accepts.
    pub const REQUEST_ENTITY_TOO_LARGE: u16 = 413;
    /// Request rate too large.
    pub const TOO_MANY_REQUESTS: u16 = 429;
    /// Service failed internally.
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    /// Service temporarily unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Sub-status codes that refine a status code.
pub mod sub_status {
    /// No sub-status.
    pub const NONE: u32 = 0;
    /// 404: the session token is not yet readable on this replica.
    pub const READ_SESSION_NOT_AVAILABLE: u32 = 1002;
    /// 410: the partition key range no longer exists.
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    /// 410: the range is in the middle of a split.
    pub const COMPLETING_SPLIT: u32 = 1007;
    /// 410: the range is being migrated.
    pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;
}

//! Error types for the replicated key-value core.
//!
//! The whole crate shares one closed error enum. Each variant corresponds to
//! a semantic kind that callers can act on, and each kind carries a stable
//! numeric code used in the `error_code` field of wire responses. Dynamic
//! downcasting is never needed: transport, codec, storage and authorization
//! failures all map into these variants at the boundary where they occur.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed error taxonomy for the core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Validation failure: empty/oversize key, bad UTF-8, missing field.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// A size cap was violated on a value, bulk payload, or encoded event.
    #[error("payload too large: {message}")]
    PayloadTooLarge { message: String },

    /// GET on an absent (or deleted) key.
    #[error("key not found: '{key}'")]
    NotFound { key: String },

    /// Numeric operation on a stored value that is not an integer.
    #[error("value for key '{key}' is not an integer")]
    InvalidType { key: String },

    /// INCR/DECR would leave the int64 range.
    #[error("numeric operation on key '{key}' overflows int64")]
    RangeOverflow { key: String },

    /// Deadline elapsed before a definitive response.
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Transport unavailable and queueing disabled or full.
    #[error("disconnected: {message}")]
    Disconnected { message: String },

    /// Replication payload is not decodable at all.
    #[error("malformed payload: {message}")]
    Malformed { message: String },

    /// Replication payload decodes but violates the event schema.
    #[error("schema violation: {message}")]
    SchemaViolation { message: String },

    /// Topic authorization failure. Carries the offending topic.
    #[error("unauthorized topic '{topic}': {message}")]
    Unauthorized { topic: String, message: String },

    /// Configuration rejected before startup.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Anything else. Never surfaces internal data to callers.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest { message: msg.into() }
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Error::PayloadTooLarge { message: msg.into() }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    pub fn invalid_type(key: impl Into<String>) -> Self {
        Error::InvalidType { key: key.into() }
    }

    pub fn range_overflow(key: impl Into<String>) -> Self {
        Error::RangeOverflow { key: key.into() }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout { message: msg.into() }
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Error::Disconnected { message: msg.into() }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed { message: msg.into() }
    }

    pub fn schema_violation(msg: impl Into<String>) -> Self {
        Error::SchemaViolation { message: msg.into() }
    }

    pub fn unauthorized(topic: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Unauthorized { topic: topic.into(), message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal { message: msg.into() }
    }

    /// Stable numeric code carried in wire responses.
    pub fn error_code(&self) -> i64 {
        match self {
            Error::InvalidRequest { .. } => 100,
            Error::PayloadTooLarge { .. } => 101,
            Error::NotFound { .. } => 102,
            Error::InvalidType { .. } => 103,
            Error::RangeOverflow { .. } => 104,
            Error::Timeout { .. } => 105,
            Error::Disconnected { .. } => 106,
            Error::Malformed { .. } => 107,
            Error::SchemaViolation { .. } => 108,
            Error::Unauthorized { .. } => 109,
            Error::Config { .. } => 110,
            Error::Internal { .. } => 199,
        }
    }

    /// Short uppercase tag for the `error` field of wire responses.
    pub fn error_tag(&self) -> &'static str {
        match self {
            Error::InvalidRequest { .. } => "INVALID_REQUEST",
            Error::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::InvalidType { .. } => "INVALID_TYPE",
            Error::RangeOverflow { .. } => "RANGE_OVERFLOW",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Disconnected { .. } => "DISCONNECTED",
            Error::Malformed { .. } => "MALFORMED",
            Error::SchemaViolation { .. } => "SCHEMA_VIOLATION",
            Error::Unauthorized { .. } => "UNAUTHORIZED",
            Error::Config { .. } => "CONFIG",
            Error::Internal { .. } => "INTERNAL",
        }
    }
}

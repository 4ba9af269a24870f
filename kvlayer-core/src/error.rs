//! Error types for kvlayer operations
//!
//! Store calls never return these: a miss is `None` and a failed mutation is
//! `false`. Errors only surface where a programming mistake or a malformed
//! payload has to be reported, i.e. at registration and configuration time,
//! and from the value codec.

use thiserror::Error;

/// Configuration and registration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cannot derive a stable cache key for {function}: variadic arguments are not supported")]
    VariadicArguments { function: String },

    #[error("Paginated cache target {function} must declare a 'limit' parameter")]
    MissingLimit { function: String },

    #[error("Key pattern {pattern:?} references unknown parameter {placeholder:?}")]
    UnknownPlaceholder { pattern: String, placeholder: String },

    #[error("Invalid key pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid configuration payload: {reason}")]
    InvalidPayload { reason: String },
}

/// Value encoding and decoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to serialize value: {reason}")]
    Serialize { reason: String },

    #[error("Failed to deserialize value: {reason}")]
    Deserialize { reason: String },

    #[error("Unexpected value encoding: expected {expected}, found flags {flags:#x}")]
    UnexpectedEncoding { expected: &'static str, flags: u32 },
}

/// Master error type for all kvlayer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result type alias for kvlayer operations.
pub type KvResult<T> = Result<T, KvError>;

// =============================================================================
// TESTS
// =============================================================================

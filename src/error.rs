//! Error types for the DDF codec.

use thiserror::Error;

/// Main error type for all DDF operations.
#[derive(Debug, Error)]
pub enum DdfError {
    /// Malformed, truncated or otherwise invalid wire data.
    #[error("Wire format error: {0}")]
    WireFormat(String),

    /// Descriptor major version does not match the runtime.
    #[error("Version mismatch: expected major version {expected}, found {found}")]
    VersionMismatch {
        /// Major version this runtime understands.
        expected: u16,
        /// Major version carried by the descriptor.
        found: u16,
    },

    /// A field labelled required never appeared on the wire.
    #[error("Missing required field '{field}' in message '{message}'")]
    MissingRequiredField {
        /// Name of the message type being decoded.
        message: String,
        /// Name of the absent field.
        field: String,
    },

    /// I/O error reported by a save sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading a schema description.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Descriptor tables are inconsistent.
    #[error("Schema error: {0}")]
    Schema(String),

    /// A typed accessor named a field the descriptor does not have,
    /// or asked for it with the wrong type.
    #[error("Field '{field}' not usable on message '{message}': {reason}")]
    FieldNotFound {
        /// Name of the message type.
        message: String,
        /// Requested field name.
        field: String,
        /// Why the lookup failed.
        reason: &'static str,
    },

    /// Caller contract violation or an unsupported construct was reached.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using DdfError.
pub type Result<T> = std::result::Result<T, DdfError>;

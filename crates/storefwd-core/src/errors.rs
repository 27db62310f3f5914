//! Error types for the Store & Forward engine
//!
//! This module contains all error types used throughout the subsystem:
//! transport errors, protocol codec errors, storage errors, and the main
//! `StoreForwardError` type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Transport-side failures surfaced through the transport seam
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transmission not allowed: channel utilization too high")]
    TxNotAllowed,
    #[error("Packet allocation failed")]
    AllocFailed,
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
}

/// Wire protocol encode/decode failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Encoded envelope too large: {size} bytes (max {max})")]
    EncodeTooLarge { size: usize, max: usize },
    #[error("Truncated field while decoding {what}")]
    Truncated { what: &'static str },
    #[error("Malformed varint")]
    InvalidVarint,
    #[error("Unsupported wire type {0}")]
    UnsupportedWireType(u8),
}

/// Persistent storage failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported history file version {found}")]
    BadVersion { found: u8 },
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("Corrupt file: {reason}")]
    Corrupt { reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the Store & Forward engine
#[derive(Debug, thiserror::Error)]
pub enum StoreForwardError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl StoreForwardError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        StoreForwardError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transport send failure with a reason
    pub fn send_failed<T: Into<String>>(reason: T) -> Self {
        StoreForwardError::Transport(TransportError::SendFailed {
            reason: reason.into(),
        })
    }

    /// Check whether this error originated at the transport seam
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreForwardError::Transport(_))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, StoreForwardError>;

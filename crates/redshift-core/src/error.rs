//! Error taxonomy for the ingest engine.
//!
//! Mirrors the five-way split the engine's design calls for: malformed
//! input and protocol violations, schema-level conflicts, per-record
//! validation failures, retryable I/O, and everything else that is
//! fatal. `TransientIo` is the only variant a caller should retry;
//! everything else should terminate the process.

use thiserror::Error;

/// The stream a given error occurred on, when applicable.
pub type StreamName = String;

#[derive(Debug, Error)]
pub enum TargetError {
    /// Malformed input line, unknown message `type`, or a `RECORD`
    /// seen before its stream's `SCHEMA`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Column collision after flattening, a primary-key-required
    /// violation, or an incompatible column type change.
    #[error("schema error for stream {stream}: {message}")]
    Schema { stream: StreamName, message: String },

    /// A record failed validation (only surfaced when
    /// `validate_records` is enabled).
    #[error("validation error for stream {stream}, record {locator}: {message}")]
    Validation {
        stream: StreamName,
        locator: String,
        message: String,
    },

    /// Object-store or warehouse I/O that has exhausted its retry
    /// budget and has been promoted to fatal.
    #[error("transient I/O error for stream {stream} exhausted retries: {source}")]
    TransientIo {
        stream: StreamName,
        #[source]
        source: anyhow::Error,
    },

    /// Any other unrecovered I/O or SQL error.
    #[error("fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl TargetError {
    pub fn protocol(message: impl Into<String>) -> Self {
        TargetError::Protocol(message.into())
    }

    pub fn schema(stream: impl Into<String>, message: impl Into<String>) -> Self {
        TargetError::Schema {
            stream: stream.into(),
            message: message.into(),
        }
    }

    pub fn validation(
        stream: impl Into<String>,
        locator: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TargetError::Validation {
            stream: stream.into(),
            locator: locator.into(),
            message: message.into(),
        }
    }

    /// The process exit code this error should produce, per the
    /// protocol's exit-code table. Signal-triggered exits (130) are
    /// not constructed through this type; they're set directly by the
    /// message loop's signal handler.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

pub type Result<T> = std::result::Result<T, TargetError>;

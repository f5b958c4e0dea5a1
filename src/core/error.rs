//! Structured error handling for the TTS job service
//!
//! Provides a layered error type covering admission, resolution, synthesis,
//! encoding, caching, and store faults, plus the per-segment error codes
//! surfaced in job manifests.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias with ServiceError
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Main error type for the job service
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    /// Request rejected at admission
    #[error("Admission rejected ({kind}): {message}")]
    Admission {
        kind: AdmissionErrorKind,
        message: String,
    },

    /// Pronunciation resolution errors
    #[error("Resolver error: {message}")]
    Resolver { message: String },

    /// Synthesis backend errors
    #[error("Synthesis error: {message}")]
    Synth { message: String, transient: bool },

    /// Audio codec errors (encode or concat)
    #[error("Codec error ({operation}): {message}")]
    Codec {
        message: String,
        operation: CodecOperation,
    },

    /// Segment cache errors
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        path: Option<PathBuf>,
    },

    /// Job store / queue errors
    #[error("Store error: {message}")]
    Store { message: String },

    /// Merge lock could not be acquired within the wait budget
    #[error("Merge lock timeout after {waited_ms}ms")]
    MergeLockTimeout { waited_ms: u64 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Internal/bug errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Admission rejection categories, each with a fixed HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionErrorKind {
    /// Empty or malformed text (400)
    InvalidText,
    /// Text or segment count over the configured limits (413)
    TooLarge,
    /// Per-client rate limit hit (429)
    RateLimited,
    /// Active-job capacity reached (429)
    Capacity,
    /// Requested model not in the allowlist (400)
    ModelDisallowed,
    /// `require_workers` set and no worker heartbeat is live (503)
    NoWorkers,
}

impl AdmissionErrorKind {
    /// HTTP status code for this rejection
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionErrorKind::InvalidText => 400,
            AdmissionErrorKind::TooLarge => 413,
            AdmissionErrorKind::RateLimited => 429,
            AdmissionErrorKind::Capacity => 429,
            AdmissionErrorKind::ModelDisallowed => 400,
            AdmissionErrorKind::NoWorkers => 503,
        }
    }
}

impl fmt::Display for AdmissionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionErrorKind::InvalidText => write!(f, "invalid_text"),
            AdmissionErrorKind::TooLarge => write!(f, "too_large"),
            AdmissionErrorKind::RateLimited => write!(f, "rate_limited"),
            AdmissionErrorKind::Capacity => write!(f, "capacity"),
            AdmissionErrorKind::ModelDisallowed => write!(f, "model_disallowed"),
            AdmissionErrorKind::NoWorkers => write!(f, "no_workers"),
        }
    }
}

/// Codec operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecOperation {
    Encode,
    Concat,
    Silence,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecOperation::Encode => write!(f, "encode"),
            CodecOperation::Concat => write!(f, "concat"),
            CodecOperation::Silence => write!(f, "silence"),
        }
    }
}

/// Terminal error codes recorded on segments in the job manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentErrorCode {
    /// Transient failures exhausted the retry budget
    RetryCapExceeded,
    /// The synthesis backend reported a non-retryable fault
    SynthPermanent,
    /// Both the encode and re-encode paths failed
    CodecFailed,
    /// The fallback phonemizer was unavailable
    ResolverUnavailable,
    /// The cache write failed twice
    CacheWriteFailed,
    /// The job was canceled before the segment committed
    Canceled,
}

impl fmt::Display for SegmentErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentErrorCode::RetryCapExceeded => "retry_cap_exceeded",
            SegmentErrorCode::SynthPermanent => "synth_permanent",
            SegmentErrorCode::CodecFailed => "codec_failed",
            SegmentErrorCode::ResolverUnavailable => "resolver_unavailable",
            SegmentErrorCode::CacheWriteFailed => "cache_write_failed",
            SegmentErrorCode::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

impl ServiceError {
    /// True when a segment-level retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Synth { transient: true, .. })
    }

    /// Shorthand for a synthesis error
    pub fn synth(message: impl Into<String>, transient: bool) -> Self {
        ServiceError::Synth {
            message: message.into(),
            transient,
        }
    }

    /// Shorthand for a store error
    pub fn store(message: impl Into<String>) -> Self {
        ServiceError::Store {
            message: message.into(),
        }
    }

    /// Shorthand for an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for an admission rejection
    pub fn admission(kind: AdmissionErrorKind, message: impl Into<String>) -> Self {
        ServiceError::Admission {
            kind,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Internal {
            message: format!("JSON serialization failed: {}", err),
        }
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::Store {
            message: format!("redis: {}", err),
        }
    }
}

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add a simple message context
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| ServiceError::Internal {
            message: format!("{}: {}", msg.into(), e),
        })
    }
}

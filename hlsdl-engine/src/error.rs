//! Engine-wide error type.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Every fatal or retryable failure class the engine can surface.
///
/// Retryable classes (`Network`, `Http` with 429/5xx, `Validation`, the first
/// `Decrypt` failure) are handled internally by the segment worker's retry loop
/// (see [`crate::retry`]) and only escape to the caller once retries are exhausted.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    #[error("playlist is malformed: {0}")]
    MalformedPlaylist(String),

    #[error("master playlists are not supported; the caller must select a media playlist variant")]
    MasterPlaylistNotSupported,

    #[error("live playlists are not supported (missing #EXT-X-ENDLIST)")]
    LivePlaylistNotSupported,

    #[error("decryption failed: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("segment {index} failed validation")]
    Validation { index: u32 },

    #[error("journal entry for segment {index} is corrupt: {reason}")]
    JournalCorruption { index: u32, reason: String },

    #[error("segment {index} exhausted its retry budget after {attempts} attempts: {source}")]
    SegmentExhausted {
        index: u32,
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error("ffmpeg exited with {exit:?}: {stderr_tail}")]
    Muxer { exit: Option<i32>, stderr_tail: String },

    #[error("ffmpeg binary not found or not executable: {0}")]
    MuxerUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown task id: {0}")]
    UnknownTask(String),

    #[error("task {0} is already running")]
    TaskAlreadyRunning(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn http(status: reqwest::StatusCode, url: impl Into<String>) -> Self {
        Self::Http {
            status: status.as_u16(),
            url: url.into(),
        }
    }

    /// Whether this error class should be retried by the segment worker.
    ///
    /// `Http(4xx)` other than 408/429 is deliberately excluded: those are
    /// treated as permanent per-segment failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(_) => true,
            EngineError::Http { status, .. } => {
                *status == 429 || *status == 408 || (500..600).contains(status)
            }
            EngineError::Validation { .. } => true,
            EngineError::Decrypt(DecryptError::BadPadding) => true,
            EngineError::Cancelled => false,
            _ => false,
        }
    }
}

/// Crypto-specific failures, nested under [`EngineError::Decrypt`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    #[error("ciphertext padding is invalid (possibly a truncated segment body)")]
    BadPadding,
    #[error("decryption key has the wrong length (expected 16 bytes for AES-128)")]
    BadKeyLength,
}

//! Engine-wide tunables, grouped by component the way the teacher's `HlsConfig`
//! composes `FetcherConfig`/`PlaylistConfig`/`DecryptionConfig` sub-structs.

use std::time::Duration;

/// HTTP client behavior: timeouts and redirect policy (§4.1).
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_redirects: 8,
        }
    }
}

/// Segment fetch retry policy (§4.5).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Key-fetch retry policy; decryption key fetches are small and get their own,
/// tighter budget so a dead key server doesn't stall every segment worker.
#[derive(Debug, Clone)]
pub struct KeyFetchConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for KeyFetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Top-level engine configuration. One process-wide instance is shared by the
/// task registry and handed to every task it drives.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub http: HttpConfig,
    pub retry: RetryConfig,
    pub key_fetch: KeyFetchConfig,
    /// Path to the ffmpeg binary; looked up on `$PATH` if not a full path.
    pub ffmpeg_binary: String,
    /// Upper bound on concurrent segment requests across *all* tasks, regardless
    /// of individual thread budgets (§4.5, "Concurrency knob").
    pub global_concurrency_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            retry: RetryConfig::default(),
            key_fetch: KeyFetchConfig::default(),
            ffmpeg_binary: "ffmpeg".to_string(),
            global_concurrency_cap: 64,
        }
    }
}

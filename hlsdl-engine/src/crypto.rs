//! C3: segment decryption.
//!
//! AES-128-CBC with PKCS#7 padding, matching the only `METHOD` the spec
//! supports. Keys are fetched once per URI and cached for the life of a task;
//! the cache is the thing that gets [`zeroize`]d when the task is torn down,
//! since it is the only place raw key material lives for longer than a single
//! decrypt call.
//!
//! Decryption is CPU-bound, so (mirroring the teacher's `DecryptionOffloader`)
//! the actual cipher pass runs inside `tokio::task::spawn_blocking` rather than
//! on the async executor thread.

use std::collections::HashMap;
use std::sync::Arc;

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use tokio::sync::Mutex;
use zeroize::Zeroize;

use tokio_util::sync::CancellationToken;

use crate::config::KeyFetchConfig;
use crate::error::{DecryptError, EngineError, Result};
use crate::http::HttpClient;
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// A fetched AES-128 key, zeroized on drop.
#[derive(Clone)]
struct CachedKey(Arc<KeyBytes>);

struct KeyBytes([u8; 16]);

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Per-task key cache, keyed by the absolute key URI.
///
/// Grounded on the teacher's key cache in `decryption.rs`: a single in-flight
/// fetch per URI, shared by every segment worker that needs it.
pub struct KeyCache {
    http: Arc<HttpClient>,
    retry: RetryPolicy,
    keys: Mutex<HashMap<String, CachedKey>>,
}

impl KeyCache {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self::with_retry_config(http, &KeyFetchConfig::default())
    }

    /// Construct with an explicit key-fetch retry budget, tighter than the
    /// segment-fetch budget so a dead key server fails fast instead of
    /// stalling every segment worker for the full segment retry window.
    pub fn with_retry_config(http: Arc<HttpClient>, config: &KeyFetchConfig) -> Self {
        Self {
            http,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.base_delay,
                max_delay: config.max_delay,
                jitter: true,
            },
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or return the cached) 16-byte key for `uri`.
    pub async fn get(&self, uri: &str) -> Result<Arc<KeyBytesHandle>> {
        self.get_with_token(uri, &CancellationToken::new()).await
    }

    /// Fetch (or return the cached) 16-byte key for `uri`, observing `token`
    /// for cooperative cancellation between retry attempts.
    pub async fn get_with_token(
        &self,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<Arc<KeyBytesHandle>> {
        {
            let keys = self.keys.lock().await;
            if let Some(cached) = keys.get(uri) {
                return Ok(Arc::new(KeyBytesHandle(cached.0.clone())));
            }
        }

        let key = retry_with_backoff(&self.retry, token, |_attempt| async move {
            match self.fetch_key(uri).await {
                Ok(key) => RetryAction::Success(key),
                Err(err) if err.is_retryable() => RetryAction::Retry(err),
                Err(err) => RetryAction::Fail(err),
            }
        })
        .await?;
        let cached = CachedKey(Arc::new(KeyBytes(key)));

        let mut keys = self.keys.lock().await;
        let entry = keys.entry(uri.to_string()).or_insert(cached);
        Ok(Arc::new(KeyBytesHandle(entry.0.clone())))
    }

    async fn fetch_key(&self, uri: &str) -> Result<[u8; 16]> {
        let bytes = self.http.get_bytes(uri, &HashMap::new()).await?;
        if bytes.len() != 16 {
            return Err(EngineError::Decrypt(DecryptError::BadKeyLength));
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

/// Opaque handle so callers outside this module never see raw key bytes.
pub struct KeyBytesHandle(Arc<KeyBytes>);

/// Decrypt `ciphertext` in place using AES-128-CBC/PKCS7 with `key` and `iv`.
///
/// Runs on a blocking thread pool worker since AES-NI-less builds of the
/// `aes` crate fall back to a software implementation that is non-trivial CPU
/// work for multi-megabyte segments.
pub async fn decrypt_segment(
    key: Arc<KeyBytesHandle>,
    iv: [u8; 16],
    ciphertext: Vec<u8>,
) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || decrypt_blocking(&key.0 .0, &iv, ciphertext))
        .await
        .map_err(|e| EngineError::Other(format!("decrypt task panicked: {e}")))?
}

fn decrypt_blocking(key: &[u8; 16], iv: &[u8; 16], mut buf: Vec<u8>) -> Result<Vec<u8>> {
    let mut decryptor = Aes128CbcDec::new(key.into(), iv.into());
    let plaintext_len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| EngineError::Decrypt(DecryptError::BadPadding))?
        .len();
    buf.truncate(plaintext_len);
    Ok(buf)
}

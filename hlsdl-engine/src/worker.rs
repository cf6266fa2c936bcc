//! C5: segment worker pool.
//!
//! Pulls pending indices in ascending order (stable FIFO), fetches, decrypts
//! when needed, validates, and persists each segment, reporting results back
//! through an [`UnboundedSender`] of [`SegmentOutcome`] so the task state
//! machine (C6) can aggregate progress without the pool knowing about tasks.
//!
//! Grounded on the teacher's `scheduler.rs`/`fetcher.rs` split: the scheduler
//! hands out work, the fetcher does the I/O. Here both halves live in one
//! module since the work unit (a single HTTP GET plus an optional decrypt) is
//! small enough not to warrant the split the teacher needed for its
//! multi-protocol fetcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, RetryConfig};
use crate::crypto::KeyCache;
use crate::error::{DecryptError, EngineError, Result};
use crate::http::HttpClient;
use crate::manifest::SegmentDescriptor;
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};
use crate::store::SegmentStore;

/// Result of attempting one segment, reported once per segment regardless of
/// how many retries it took.
pub enum SegmentOutcome {
    Done { index: u32, bytes_written: u64 },
    Failed { index: u32, error: EngineError },
}

/// Drives every pending segment in `descriptors` to completion (or permanent
/// failure), honoring `token` for cooperative cancellation.
///
/// `done` marks indices already durable on disk (from [`SegmentStore::recover`])
/// and are skipped entirely — they are not re-reported as [`SegmentOutcome::Done`]
/// since the caller already knows their size from its own recovery pass.
pub struct SegmentWorkerPool {
    http: Arc<HttpClient>,
    keys: Arc<KeyCache>,
    store: Arc<SegmentStore>,
    retry: RetryPolicy,
    concurrency: usize,
    headers: Arc<HashMap<String, String>>,
}

impl SegmentWorkerPool {
    pub fn new(
        http: Arc<HttpClient>,
        keys: Arc<KeyCache>,
        store: Arc<SegmentStore>,
        config: &EngineConfig,
        thread_budget: usize,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            http,
            keys,
            store,
            retry: retry_policy_from(&config.retry),
            concurrency: thread_budget.max(1),
            headers: Arc::new(headers),
        }
    }

    /// Run the pool over every index in `descriptors` whose state isn't
    /// already `Done` in `done_indices`. Returns once every index has
    /// reported an outcome or the token is cancelled.
    pub async fn run(
        &self,
        descriptors: Arc<Vec<SegmentDescriptor>>,
        done_indices: &[bool],
        token: CancellationToken,
        outcomes: UnboundedSender<SegmentOutcome>,
    ) -> Result<()> {
        let next_index = Arc::new(AtomicU32::new(0));
        let total = descriptors.len() as u32;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let done_indices = Arc::new(done_indices.to_vec());

        let mut handles = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            let next_index = next_index.clone();
            let descriptors = descriptors.clone();
            let done_indices = done_indices.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();
            let outcomes = outcomes.clone();
            let http = self.http.clone();
            let keys = self.keys.clone();
            let store = self.store.clone();
            let retry = self.retry.clone();
            let headers = self.headers.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if token.is_cancelled() {
                        return;
                    }

                    let index = next_index.fetch_add(1, Ordering::SeqCst);
                    if index >= total {
                        return;
                    }
                    if done_indices.get(index as usize).copied().unwrap_or(false) {
                        continue;
                    }

                    let _permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };

                    let descriptor = descriptors[index as usize].clone();
                    let outcome = fetch_one(
                        &http,
                        &keys,
                        &store,
                        &retry,
                        &token,
                        &headers,
                        &descriptor,
                    )
                    .await;

                    let failed = matches!(outcome, SegmentOutcome::Failed { .. });
                    if outcomes.send(outcome).is_err() {
                        return;
                    }
                    if failed {
                        token.cancel();
                        return;
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }
}

async fn fetch_one(
    http: &Arc<HttpClient>,
    keys: &Arc<KeyCache>,
    store: &Arc<SegmentStore>,
    retry: &RetryPolicy,
    token: &CancellationToken,
    headers: &Arc<HashMap<String, String>>,
    descriptor: &SegmentDescriptor,
) -> SegmentOutcome {
    let result = retry_with_backoff(retry, token, |attempt| {
        let http = http.clone();
        let keys = keys.clone();
        let store = store.clone();
        let headers = headers.clone();
        let descriptor = descriptor.clone();
        let inner_token = token.clone();
        async move {
            match download_and_persist(&http, &keys, &store, &headers, &descriptor, &inner_token).await {
                Ok(bytes_written) => RetryAction::Success(bytes_written),
                // §7: a decrypt failure is retried once (it usually means a
                // truncated body), then treated as fatal rather than burning
                // the full segment retry budget.
                Err(err @ EngineError::Decrypt(DecryptError::BadPadding)) if attempt == 0 => {
                    RetryAction::Retry(err)
                }
                Err(err @ EngineError::Decrypt(_)) => RetryAction::Fail(err),
                Err(err) if err.is_retryable() => RetryAction::Retry(err),
                Err(err) => RetryAction::Fail(err),
            }
        }
    })
    .await;

    match result {
        Ok(bytes_written) => SegmentOutcome::Done {
            index: descriptor.index,
            bytes_written,
        },
        Err(error) => SegmentOutcome::Failed {
            index: descriptor.index,
            error,
        },
    }
}

async fn download_and_persist(
    http: &Arc<HttpClient>,
    keys: &Arc<KeyCache>,
    store: &Arc<SegmentStore>,
    headers: &Arc<HashMap<String, String>>,
    descriptor: &SegmentDescriptor,
    token: &CancellationToken,
) -> Result<u64> {
    let bytes = http.get_bytes(&descriptor.url, headers).await?;

    let plaintext = match &descriptor.key {
        None => bytes.to_vec(),
        Some(key_ref) => {
            let key = keys.get_with_token(&key_ref.uri, token).await?;
            crate::crypto::decrypt_segment(key, descriptor.iv, bytes.to_vec()).await?
        }
    };

    store.commit_segment(descriptor.index, &plaintext).await
}

fn retry_policy_from(config: &RetryConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.max_retries,
        base_delay: config.base_delay,
        max_delay: config.max_delay,
        jitter: config.jitter,
    }
}

//! C6: task state machine and driver.
//!
//! Owns one download end-to-end: manifest fetch → segment fan-out → progress
//! aggregation → mux → cleanup. `Task::run` is the top-level async job the
//! registry spawns per task id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::crypto::KeyCache;
use crate::error::{EngineError, Result};
use crate::events::{format_speed, EngineEvent};
use crate::http::HttpClient;
use crate::manifest;
use crate::muxer;
use crate::store::SegmentStore;
use crate::worker::{SegmentOutcome, SegmentWorkerPool};

/// Status codes, stable across the engine/UI boundary (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Cancelled = 0,
    Queued = 1,
    Downloading = 2,
    DownloadComplete = 3,
    Muxing = 4,
    Muxed = 5,
    New = 10,
    MuxFailed = 400,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Everything needed to create and drive one task. Supplied by `start_download`.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub task_id: String,
    pub manifest_url: String,
    pub display_name: String,
    pub output_dir: PathBuf,
    pub thread_budget: usize,
    pub headers: HashMap<String, String>,
    /// §3: "Attributes: ... creation time." Caller-supplied so a UI
    /// collaborator can restore it verbatim across a process restart rather
    /// than having the engine silently reset it on every resume.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Live, shared progress counters. Cheap to read from any thread without
/// locking; only the driving task writes them.
pub struct TaskProgress {
    done_count: AtomicU32,
    total_count: AtomicU32,
    bytes_total: AtomicU64,
    status: AtomicU16,
    last_emitted_percent: AtomicU32,
}

impl TaskProgress {
    fn new() -> Self {
        Self {
            done_count: AtomicU32::new(0),
            total_count: AtomicU32::new(0),
            bytes_total: AtomicU64::new(0),
            status: AtomicU16::new(Status::New.code()),
            last_emitted_percent: AtomicU32::new(u32::MAX),
        }
    }

    pub fn status(&self) -> u16 {
        self.status.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> (u32, u32, u64, u16) {
        (
            self.done_count.load(Ordering::Acquire),
            self.total_count.load(Ordering::Acquire),
            self.bytes_total.load(Ordering::Acquire),
            self.status.load(Ordering::Acquire),
        )
    }

    fn set_status(&self, status: Status) {
        self.status.store(status.code(), Ordering::Release);
    }

    /// Percent complete, 0 when `total_count` is still unknown.
    fn percent(&self) -> u8 {
        let done = self.done_count.load(Ordering::Acquire);
        let total = self.total_count.load(Ordering::Acquire);
        if total == 0 {
            0
        } else {
            ((100u64 * done as u64) / total as u64) as u8
        }
    }
}

/// Drives a single task from `new` to a terminal state.
pub struct Task {
    config: TaskConfig,
    engine_config: Arc<EngineConfig>,
    http: Arc<HttpClient>,
    progress: Arc<TaskProgress>,
    token: CancellationToken,
    events: UnboundedSender<EngineEvent>,
}

impl Task {
    pub fn new(
        config: TaskConfig,
        engine_config: Arc<EngineConfig>,
        http: Arc<HttpClient>,
        token: CancellationToken,
        events: UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            config,
            engine_config,
            http,
            progress: Arc::new(TaskProgress::new()),
            token,
            events,
        }
    }

    pub fn progress(&self) -> Arc<TaskProgress> {
        self.progress.clone()
    }

    /// Run the task to completion. Never panics on task-local failure; all
    /// errors route through the `mux-failed`/`cancelled` terminal states and
    /// are also returned to the caller (the registry logs them).
    pub async fn run(self) -> Result<PathBuf> {
        self.progress.set_status(Status::Queued);
        self.progress.set_status(Status::Downloading);

        match self.run_inner().await {
            Ok(path) => Ok(path),
            Err(EngineError::Cancelled) => {
                self.progress.set_status(Status::Cancelled);
                self.emit_terminal_progress();
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                self.progress.set_status(Status::MuxFailed);
                self.emit_terminal_progress();
                Err(err)
            }
        }
    }

    /// §6: "Failure is surfaced ... by a final `download_progress` with
    /// status `0` or `400`." Unlike [`Self::emit_progress_if_changed`], this
    /// always sends — a task that fails before any percent change (e.g. the
    /// manifest fetch itself errors) must still produce a terminal event, or
    /// a caller blocked on the event stream would wait forever.
    fn emit_terminal_progress(&self) {
        let (done_count, total_count, bytes_total, status) = self.progress.snapshot();
        let _ = self.events.send(EngineEvent::DownloadProgress {
            id: self.config.task_id.clone(),
            progress: self.progress.percent(),
            speed: format_speed(0),
            done_count,
            total_count,
            bytes_total,
            status,
        });
    }

    async fn run_inner(&self) -> Result<PathBuf> {
        let store = Arc::new(SegmentStore::open(&self.config.output_dir, &self.config.task_id).await?);
        let _ = self.events.send(EngineEvent::CreateTempDirectory {
            id: self.config.task_id.clone(),
            is_created_temp_dir: true,
            path: store.dir().display().to_string(),
        });

        let playlist_text = self
            .http
            .get_text(&self.config.manifest_url, &self.config.headers)
            .await?;
        let descriptors = manifest::parse(&playlist_text, &self.config.manifest_url)?;
        let total = descriptors.len() as u32;
        self.progress.total_count.store(total, Ordering::Release);

        let recovered = store.recover(total).await?;
        let mut done_indices = vec![false; total as usize];
        let mut bytes_total = 0u64;
        let mut done_count = 0u32;
        for (i, state) in recovered.iter().enumerate() {
            if let crate::store::SegmentState::Done { bytes_written } = state {
                done_indices[i] = true;
                bytes_total += bytes_written;
                done_count += 1;
            }
        }
        self.progress.bytes_total.store(bytes_total, Ordering::Release);
        self.progress.done_count.store(done_count, Ordering::Release);
        self.emit_progress_if_changed();

        let keys = Arc::new(KeyCache::with_retry_config(
            self.http.clone(),
            &self.engine_config.key_fetch,
        ));
        let pool = SegmentWorkerPool::new(
            self.http.clone(),
            keys,
            store.clone(),
            &self.engine_config,
            self.config.thread_budget,
            self.config.headers.clone(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let descriptors = Arc::new(descriptors);
        let pool_token = self.token.clone();
        let pool_handle = tokio::spawn({
            let descriptors = descriptors.clone();
            let done_indices = done_indices.clone();
            async move { pool.run(descriptors, &done_indices, pool_token, tx).await }
        });

        let mut first_failure: Option<EngineError> = None;
        while let Some(outcome) = rx.recv().await {
            match outcome {
                SegmentOutcome::Done { bytes_written, .. } => {
                    self.progress.done_count.fetch_add(1, Ordering::AcqRel);
                    self.progress
                        .bytes_total
                        .fetch_add(bytes_written, Ordering::AcqRel);
                    self.emit_progress_if_changed();
                }
                SegmentOutcome::Failed { index, error } => {
                    tracing::error!(task_id = %self.config.task_id, index, %error, "segment failed permanently");
                    first_failure.get_or_insert(error);
                }
            }
        }
        pool_handle
            .await
            .map_err(|e| EngineError::Other(format!("worker pool task panicked: {e}")))??;

        if let Some(err) = first_failure {
            return Err(err);
        }
        if self.token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.progress.set_status(Status::DownloadComplete);

        // Probe ffmpeg before committing to `muxing` so a missing/broken
        // binary surfaces as a clean `MuxerUnavailable` rather than failing
        // deep inside `muxer::mux`'s spawn.
        muxer::detect_ffmpeg(&self.engine_config.ffmpeg_binary).await?;

        self.progress.set_status(Status::Muxing);
        let _ = self.events.send(EngineEvent::StartMergeVideo {
            id: self.config.task_id.clone(),
        });

        let concat_list = store.write_concat_list(total).await?;
        let output = muxer::output_path(&self.config.output_dir, &self.config.display_name);
        let mux_result = muxer::mux(
            &self.engine_config.ffmpeg_binary,
            &concat_list,
            &output,
            &self.token,
        )
        .await;

        match mux_result {
            Ok(()) => {
                store.cleanup().await?;
                self.progress.set_status(Status::Muxed);
                let _ = self.events.send(EngineEvent::MergeVideo {
                    id: self.config.task_id.clone(),
                    is_merged: true,
                    file: Some(output.display().to_string()),
                    status: Status::Muxed.code(),
                });
                Ok(output)
            }
            Err(err) => {
                let _ = self.events.send(EngineEvent::MergeVideo {
                    id: self.config.task_id.clone(),
                    is_merged: false,
                    file: None,
                    status: Status::MuxFailed.code(),
                });
                Err(err)
            }
        }
    }

    fn emit_progress_if_changed(&self) {
        let percent = self.progress.percent() as u32;
        let last = self
            .progress
            .last_emitted_percent
            .swap(percent, Ordering::AcqRel);
        if last == percent {
            return;
        }
        let (done_count, total_count, bytes_total, status) = self.progress.snapshot();
        let _ = self.events.send(EngineEvent::DownloadProgress {
            id: self.config.task_id.clone(),
            progress: percent as u8,
            speed: format_speed(0),
            done_count,
            total_count,
            bytes_total,
            status,
        });
    }
}

/// 1 Hz speed sampler: observes `progress.bytes_total` once a second and
/// emits a `download_progress` event carrying the instantaneous rate. Spawned
/// alongside the task driver and cancelled with the same token.
pub async fn run_speed_sampler(
    task_id: String,
    progress: Arc<TaskProgress>,
    events: UnboundedSender<EngineEvent>,
    token: CancellationToken,
) {
    let mut last_bytes = 0u64;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        let (done_count, total_count, bytes_total, status) = progress.snapshot();
        if status != Status::Downloading.code() {
            if status == Status::Muxed.code()
                || status == Status::Cancelled.code()
                || status == Status::MuxFailed.code()
            {
                return;
            }
            continue;
        }
        let speed_bps = bytes_total.saturating_sub(last_bytes);
        last_bytes = bytes_total;
        let percent = if total_count == 0 {
            0
        } else {
            ((100u64 * done_count as u64) / total_count as u64) as u8
        };
        let _ = events.send(EngineEvent::DownloadProgress {
            id: task_id.clone(),
            progress: percent,
            speed: format_speed(speed_bps),
            done_count,
            total_count,
            bytes_total,
            status,
        });
    }
}

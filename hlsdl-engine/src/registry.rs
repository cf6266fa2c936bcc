//! C8: process-wide task registry.
//!
//! Grounded on the teacher's `DownloadManager`: a `dashmap::DashMap` gives
//! lock-free reads on the hot per-task paths (progress snapshot, cancel
//! check) while insert/remove only ever touch the map's own per-shard locks.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::http::HttpClient;
use crate::task::{Task, TaskConfig, TaskProgress};

/// Everything the registry needs to manage one in-flight or completed task.
pub struct TaskHandle {
    token: CancellationToken,
    progress: Arc<TaskProgress>,
    join_handle: JoinHandle<Result<PathBuf>>,
    output_dir: PathBuf,
    task_id: String,
}

impl TaskHandle {
    pub fn progress(&self) -> Arc<TaskProgress> {
        self.progress.clone()
    }
}

/// Top-level engine handle. One instance per process; cheap to clone (it's
/// just `Arc`s internally).
#[derive(Clone)]
pub struct Engine {
    http: Arc<HttpClient>,
    config: Arc<EngineConfig>,
    tasks: Arc<DashMap<String, Arc<TaskHandle>>>,
    events: UnboundedSender<EngineEvent>,
}

impl Engine {
    pub fn new(config: EngineConfig, events: UnboundedSender<EngineEvent>) -> Result<Self> {
        let http = HttpClient::with_pool_size(&config.http, config.global_concurrency_cap)?;
        Ok(Self {
            http,
            config: Arc::new(config),
            tasks: Arc::new(DashMap::new()),
            events,
        })
    }

    /// `start_download`: create and spawn a task. Errors if `task_id` is
    /// already registered and not in a terminal state.
    pub fn start_download(&self, task_config: TaskConfig) -> Result<()> {
        if let Some(existing) = self.tasks.get(&task_config.task_id) {
            if !existing.join_handle.is_finished() {
                return Err(EngineError::TaskAlreadyRunning(task_config.task_id));
            }
        }

        let task_id = task_config.task_id.clone();
        let output_dir = task_config.output_dir.clone();
        let token = CancellationToken::new();

        let task = Task::new(
            task_config,
            self.config.clone(),
            self.http.clone(),
            token.clone(),
            self.events.clone(),
        );
        let progress = task.progress();

        let sampler_events = self.events.clone();
        let sampler_progress = progress.clone();
        let sampler_token = token.clone();
        let sampler_task_id = task_id.clone();
        tokio::spawn(crate::task::run_speed_sampler(
            sampler_task_id,
            sampler_progress,
            sampler_events,
            sampler_token,
        ));

        let join_handle = tokio::spawn(task.run());

        let handle = Arc::new(TaskHandle {
            token,
            progress,
            join_handle,
            output_dir,
            task_id: task_id.clone(),
        });
        self.tasks.insert(task_id, handle);
        Ok(())
    }

    /// `cancel_download`: idempotent; a no-op on an unknown or terminal task.
    pub fn cancel_download(&self, task_id: &str) -> Result<()> {
        match self.tasks.get(task_id) {
            Some(handle) => {
                handle.token.cancel();
                Ok(())
            }
            None => Err(EngineError::UnknownTask(task_id.to_string())),
        }
    }

    /// `delete_download`: cancel (if running) and remove the task's temp
    /// directory along with its registry entry.
    pub async fn delete_download(&self, task_id: &str) -> Result<()> {
        let handle = self
            .tasks
            .remove(task_id)
            .map(|(_, handle)| handle)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        handle.token.cancel();

        let store = crate::store::SegmentStore::open(&handle.output_dir, &handle.task_id).await?;
        store.cleanup().await
    }

    /// `delete_file`: remove a completed output file from disk, independent
    /// of the task registry (the task may already be gone).
    pub async fn delete_file(&self, output_path: &std::path::Path) -> Result<()> {
        match tokio::fs::remove_file(output_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    pub fn progress(&self, task_id: &str) -> Result<(u32, u32, u64, u16)> {
        self.tasks
            .get(task_id)
            .map(|handle| handle.progress.snapshot())
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))
    }

    /// `get_cpu_info`: `(physical_cores, logical_cores)` per §6, backed by
    /// the `sysinfo` crate the way the teacher's resource scheduler samples
    /// host topology before admitting new work.
    pub fn get_cpu_info(&self) -> CpuInfo {
        let system = sysinfo::System::new_all();
        CpuInfo {
            physical_cores: sysinfo::System::physical_core_count().unwrap_or(0),
            logical_cores: system.cpus().len(),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CpuInfo {
    pub physical_cores: usize,
    pub logical_cores: usize,
}

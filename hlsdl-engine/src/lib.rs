//! HLS-to-MP4 download engine.
//!
//! Parses a media playlist, fetches and (if encrypted) decrypts every
//! segment with bounded concurrency and automatic retry, persists them
//! durably enough to resume after a crash, and muxes the result into a
//! single MP4 via ffmpeg.
//!
//! The public surface is [`Engine`]: construct one per process, then drive
//! it with [`Engine::start_download`], [`Engine::cancel_download`],
//! [`Engine::delete_download`], [`Engine::delete_file`], and
//! [`Engine::get_cpu_info`]. Progress and lifecycle notifications arrive on
//! the `UnboundedSender<EngineEvent>` passed to [`Engine::new`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod http;
pub mod manifest;
pub mod muxer;
pub mod registry;
pub mod retry;
pub mod store;
pub mod task;
pub mod worker;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::EngineEvent;
pub use registry::{CpuInfo, Engine};
pub use task::{Status, TaskConfig};

//! Thin demonstration front end for `hlsdl-engine`, grounded on the teacher's
//! `mesio-cli`/`siphon-cli` binaries: parse args with `clap`, wire up
//! `tracing-subscriber`, drive the engine, and print JSON-lines events to
//! stdout so a caller can pipe them into whatever UI they like.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hlsdl_engine::task::Status;
use hlsdl_engine::{Engine, EngineConfig, EngineEvent, TaskConfig};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "hlsdl", about = "Download an HLS VOD stream as a single MP4")]
struct Args {
    /// URL of the media playlist (must already be a variant, not a master playlist).
    manifest_url: String,

    /// Output directory for the finished MP4 and the task's temp directory.
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Display name; the output file is `<output_dir>/<name>.mp4`.
    #[arg(short, long, default_value = "output")]
    name: String,

    /// Number of concurrent segment fetches.
    #[arg(short, long, default_value_t = 8)]
    threads: usize,

    /// Extra HTTP header, repeatable: `-H "Referer: https://example.com"`.
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Opaque task id; defaults to the display name.
    #[arg(long)]
    task_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let exit_code = run(args).await;
    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    let headers = parse_headers(&args.headers);
    let task_id = args.task_id.clone().unwrap_or_else(|| args.name.clone());

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let engine = match Engine::new(EngineConfig::default(), events_tx) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            eprintln!("failed to start engine: {err}");
            return 1;
        }
    };

    let task_config = TaskConfig {
        task_id: task_id.clone(),
        manifest_url: args.manifest_url,
        display_name: args.name,
        output_dir: args.output_dir,
        thread_budget: args.threads,
        headers,
        created_at: chrono::Utc::now(),
    };

    if let Err(err) = engine.start_download(task_config) {
        eprintln!("failed to start download: {err}");
        return 1;
    }

    let cancel_engine = engine.clone();
    let cancel_task_id = task_id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_engine.cancel_download(&cancel_task_id);
        }
    });

    let mut last_status = Status::New.code();
    while let Some(event) = events_rx.recv().await {
        if let Ok(line) = serde_json::to_string(&event) {
            println!("{line}");
        }
        if let EngineEvent::DownloadProgress { status, .. } = &event {
            last_status = *status;
            if *status == Status::Cancelled.code() || *status == Status::MuxFailed.code() {
                break;
            }
        }
        if let EngineEvent::MergeVideo { status, .. } = &event {
            last_status = *status;
            break;
        }
    }

    match last_status {
        s if s == Status::Muxed.code() => 0,
        s if s == Status::MuxFailed.code() => 1,
        s if s == Status::Cancelled.code() => 130,
        _ => 1,
    }
}

fn parse_headers(raw: &[String]) -> HashMap<String, String> {
    raw.iter()
        .filter_map(|entry| entry.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

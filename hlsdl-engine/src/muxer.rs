//! C7: muxer driver. Shells out to ffmpeg to concat the finalized segments
//! into a single MP4, matching the teacher's ffmpeg engine driver:
//! `tokio::process::Command` via `process_utils::tokio_command` (for the
//! `CREATE_NO_WINDOW` flag on Windows), piped stdio, stderr drained on a
//! background task, and a graceful-stop-then-kill path on cancellation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

const STDERR_TAIL_BYTES: usize = 4096;

/// Probe whether `ffmpeg_binary` is runnable, mirroring the teacher's
/// `detect_version`: run `<binary> -version` and take its first stdout line.
pub async fn detect_ffmpeg(ffmpeg_binary: &str) -> Result<String> {
    let output = process_utils::tokio_command(ffmpeg_binary)
        .arg("-version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| EngineError::MuxerUnavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(EngineError::MuxerUnavailable(format!(
            "{ffmpeg_binary} -version exited with {:?}",
            output.status.code()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().to_string())
}

/// Run ffmpeg over `concat_list` to produce `output_path`. On failure,
/// returns [`EngineError::Muxer`] carrying the last `STDERR_TAIL_BYTES` of
/// stderr as diagnostic text.
pub async fn mux(
    ffmpeg_binary: &str,
    concat_list: &Path,
    output_path: &Path,
    token: &CancellationToken,
) -> Result<()> {
    let mut child = process_utils::tokio_command(ffmpeg_binary)
        .arg("-y")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(concat_list)
        .arg("-c")
        .arg("copy")
        .arg(output_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::MuxerUnavailable(e.to_string()))?;

    let stderr = child
        .stderr
        .take()
        .expect("stderr was piped at spawn time");
    let stderr_tail = tokio::spawn(drain_stderr_tail(stderr));

    let status = tokio::select! {
        status = child.wait() => status.map_err(EngineError::Io)?,
        _ = token.cancelled() => {
            stop_then_kill(&mut child).await;
            return Err(EngineError::Cancelled);
        }
    };

    let tail = stderr_tail.await.unwrap_or_default();

    if !status.success() {
        return Err(EngineError::Muxer {
            exit: status.code(),
            stderr_tail: tail,
        });
    }

    match tokio::fs::metadata(output_path).await {
        Ok(metadata) if metadata.len() > 0 => Ok(()),
        Ok(_) => Err(EngineError::Muxer {
            exit: status.code(),
            stderr_tail: format!("{tail}\n(output file is zero-length)"),
        }),
        Err(e) => Err(EngineError::Muxer {
            exit: status.code(),
            stderr_tail: format!("{tail}\n(output file missing: {e})"),
        }),
    }
}

async fn drain_stderr_tail(stderr: tokio::process::ChildStderr) -> String {
    let mut reader = BufReader::new(stderr).lines();
    let mut tail = String::new();
    while let Ok(Some(line)) = reader.next_line().await {
        tail.push_str(&line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_BYTES {
            let excess = tail.len() - STDERR_TAIL_BYTES;
            tail.drain(..excess);
        }
    }
    tail
}

/// On cancel, ask ffmpeg to stop cleanly (it reacts to a closed stdin or, on
/// platforms without signal support via tokio, simply gets a short grace
/// period) before escalating to a hard kill.
async fn stop_then_kill(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    let grace = tokio::time::sleep(std::time::Duration::from_millis(500));
    tokio::select! {
        _ = grace => {}
        _ = child.wait() => return,
    }
    let _ = child.kill().await;
}

/// Output path for a task's finished MP4: `<out>/<display_name>.mp4`.
pub fn output_path(output_dir: &Path, display_name: &str) -> PathBuf {
    output_dir.join(format!("{display_name}.mp4"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_appends_mp4_extension() {
        let path = output_path(Path::new("/tmp/out"), "my video");
        assert_eq!(path, PathBuf::from("/tmp/out/my video.mp4"));
    }
}

//! C4: per-task segment store and resume journal.
//!
//! Layout: `<out>/.m3u8dl-<taskId>/{seg-NNNNNN.ts, journal.log, concat.txt}`.
//! Durability protocol (§4.4): write to `seg-<i>.ts.part`, fsync, rename to
//! `seg-<i>.ts`, append a journal line, fsync the journal. The rename and the
//! journal append together are what make a segment "done"; neither alone does.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{EngineError, Result};

/// Known state of one segment, as recovered from disk at task start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    Done { bytes_written: u64 },
}

pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    /// Open (creating if absent) the store directory for `task_id` under `output_dir`.
    pub async fn open(output_dir: &Path, task_id: &str) -> Result<Self> {
        let dir = output_dir.join(format!(".m3u8dl-{task_id}"));
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("seg-{index:06}.ts"))
    }

    fn part_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("seg-{index:06}.ts.part"))
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join("journal.log")
    }

    fn concat_path(&self) -> PathBuf {
        self.dir.join("concat.txt")
    }

    /// §4.4 resume: replay the journal, re-validate every referenced file, and
    /// return the known state of every segment in `0..total`. Segments whose
    /// journal entry is missing, whose file is missing/size-mismatched, or
    /// that fail the validator all revert to `Pending`.
    pub async fn recover(&self, total: u32) -> Result<Vec<SegmentState>> {
        let mut states = vec![SegmentState::Pending; total as usize];

        let journal_text = match fs::read_to_string(self.journal_path()).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(states),
            Err(e) => return Err(EngineError::Io(e)),
        };

        for line in journal_text.lines() {
            let Some((index, size)) = parse_journal_line(line) else {
                continue;
            };
            if index >= total {
                continue;
            }
            let path = self.segment_path(index);
            let Ok(metadata) = fs::metadata(&path).await else {
                continue;
            };
            if metadata.len() != size {
                continue;
            }
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            if validate_segment(&bytes) {
                states[index as usize] = SegmentState::Done {
                    bytes_written: size,
                };
            }
        }

        Ok(states)
    }

    /// Write `data` as segment `index` using the full write protocol: `.part`
    /// write, fsync, rename, journal append, fsync journal. Validates the
    /// bytes before committing; an invalid segment is reported as a
    /// [`EngineError::Validation`] without touching the journal.
    pub async fn commit_segment(&self, index: u32, data: &[u8]) -> Result<u64> {
        if !validate_segment(data) {
            return Err(EngineError::Validation { index });
        }

        let part_path = self.part_path(index);
        {
            let mut file = File::create(&part_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }

        let final_path = self.segment_path(index);
        fs::rename(&part_path, &final_path).await?;

        let sha_prefix = sha1_prefix(data);
        self.append_journal_line(index, data.len() as u64, &sha_prefix)
            .await?;

        Ok(data.len() as u64)
    }

    async fn append_journal_line(&self, index: u32, size: u64, sha_prefix: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .await?;
        file.write_all(format!("{index} {size} {sha_prefix}\n").as_bytes())
            .await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Build `concat.txt` for the muxer, referencing every segment file by
    /// absolute path in index order.
    pub async fn write_concat_list(&self, total: u32) -> Result<PathBuf> {
        let mut contents = String::new();
        for index in 0..total {
            let path = self.segment_path(index);
            contents.push_str(&format!("file '{}'\n", path.display()));
        }
        let concat_path = self.concat_path();
        fs::write(&concat_path, contents).await?;
        Ok(concat_path)
    }

    /// Remove the entire temp directory: journal, concat list, and every
    /// segment file. Called on successful mux.
    pub async fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

fn parse_journal_line(line: &str) -> Option<(u32, u64)> {
    let mut parts = line.split_whitespace();
    let index = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    Some((index, size))
}

fn sha1_prefix(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

/// §4.4 validator: MPEG-TS sync bytes at 188-byte stride, or an ISO-BMFF box
/// header (`ftyp`/`moof`/`mdat`) at the start of the buffer.
pub fn validate_segment(data: &[u8]) -> bool {
    if data.len() >= 188 && is_mpeg_ts(data) {
        return true;
    }
    is_iso_bmff(data)
}

fn is_mpeg_ts(data: &[u8]) -> bool {
    const SYNC_BYTE: u8 = 0x47;
    let packets_to_check = (data.len() / 188).min(3);
    if packets_to_check == 0 {
        return false;
    }
    (0..packets_to_check).all(|i| data[i * 188] == SYNC_BYTE)
}

fn is_iso_bmff(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    matches!(&data[4..8], b"ftyp" | b"moof" | b"mdat")
}

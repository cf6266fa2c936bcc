//! Event surface emitted to whatever UI embeds the engine. Plain
//! `serde::Serialize` types sent over a per-task `UnboundedSender`, the same
//! event-bus shape the teacher uses for its progress callbacks.

use serde::Serialize;

/// One engine event for a given task. Field names and shapes follow the
/// wire contract in §6 exactly (`id`, `progress`, `speed`, `isCreatedTempDir`,
/// `isMerged`, `file`) since a UI collaborator deserializes these verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    CreateTempDirectory {
        id: String,
        #[serde(rename = "isCreatedTempDir")]
        is_created_temp_dir: bool,
        path: String,
    },
    DownloadProgress {
        id: String,
        progress: u8,
        speed: String,
        done_count: u32,
        total_count: u32,
        bytes_total: u64,
        status: u16,
    },
    StartMergeVideo {
        id: String,
    },
    MergeVideo {
        id: String,
        #[serde(rename = "isMerged")]
        is_merged: bool,
        file: Option<String>,
        status: u16,
    },
}

/// Formats a byte-per-second rate as the spec's `"NNN.N KB/s"` string.
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{:.1} KB/s", bytes_per_sec as f64 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_speed_as_kb_per_second_with_one_decimal() {
        assert_eq!(format_speed(0), "0.0 KB/s");
        assert_eq!(format_speed(1024), "1.0 KB/s");
        assert_eq!(format_speed(1536), "1.5 KB/s");
    }

    #[test]
    fn download_progress_serializes_wire_field_names() {
        let event = EngineEvent::DownloadProgress {
            id: "t1".into(),
            progress: 42,
            speed: format_speed(2048),
            done_count: 4,
            total_count: 10,
            bytes_total: 2048,
            status: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"id\":\"t1\""));
        assert!(json.contains("\"progress\":42"));
        assert!(json.contains("\"speed\":\"2.0 KB/s\""));
        assert!(!json.contains("task_id"));
        assert!(!json.contains("percent"));
    }

    #[test]
    fn create_temp_directory_uses_camel_case_flag() {
        let event = EngineEvent::CreateTempDirectory {
            id: "t1".into(),
            is_created_temp_dir: true,
            path: "/tmp/.m3u8dl-t1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"isCreatedTempDir\":true"));
    }

    #[test]
    fn merge_video_uses_camel_case_flag_and_file_field() {
        let event = EngineEvent::MergeVideo {
            id: "t1".into(),
            is_merged: true,
            file: Some("/out/video.mp4".into()),
            status: 5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"isMerged\":true"));
        assert!(json.contains("\"file\":\"/out/video.mp4\""));
    }
}

//! End-to-end scenario tests against a local mock HTTP server, standing in
//! for an origin server so these never touch the network.

use std::collections::HashMap;
use std::time::Duration;

use hlsdl_engine::task::Status;
use hlsdl_engine::{Engine, EngineConfig, EngineEvent, TaskConfig};
use tempfile::tempdir;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ts_segment_of_len(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len.max(188)];
    // The validator checks up to 3 packets at the 188-byte stride; stamp
    // every stride position it will look at, not just the first.
    for packet in 0..3 {
        let offset = packet * 188;
        if offset < data.len() {
            data[offset] = 0x47;
        }
    }
    data
}

async fn poll_until_terminal(engine: &Engine, task_id: &str, timeout: Duration) -> u16 {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (_, _, _, status) = engine.progress(task_id).expect("task must exist");
        if matches!(status, s if s == Status::Muxed.code()
            || s == Status::Cancelled.code()
            || s == Status::MuxFailed.code())
        {
            return status;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task {task_id} did not reach a terminal state in time (status={status})");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn s1_plain_vod_no_crypto() {
    let server = MockServer::start().await;
    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:9.009,\nseg0.ts\n#EXTINF:9.009,\nseg1.ts\n#EXTINF:3.003,\nseg2.ts\n#EXT-X-ENDLIST\n";
    Mock::given(method("GET"))
        .and(path("/stream.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;
    for (name, len) in [("seg0.ts", 1024), ("seg1.ts", 2048), ("seg2.ts", 1024)] {
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_segment_of_len(len)))
            .mount(&server)
            .await;
    }

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(EngineConfig::default(), tx).unwrap();

    engine
        .start_download(TaskConfig {
            task_id: "s1".into(),
            manifest_url: format!("{}/stream.m3u8", server.uri()),
            display_name: "s1-output".into(),
            output_dir: dir.path().to_path_buf(),
            thread_budget: 4,
            headers: HashMap::new(),
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    let mut percents = Vec::new();
    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(EngineEvent::DownloadProgress { progress, .. }) => percents.push(progress),
                Some(EngineEvent::MergeVideo { status, file, .. }) => {
                    if status == Status::Muxed.code() {
                        assert!(file.is_some());
                    }
                    return status;
                }
                Some(_) => {}
                None => panic!("event channel closed before completion"),
            }
        }
    })
    .await
    .expect("task timed out");

    assert_eq!(status, Status::Muxed.code());
    assert!(percents.contains(&33));
    assert!(percents.contains(&66));
    assert!(percents.contains(&100));
    assert!(!dir.path().join(".m3u8dl-s1").exists());
}

#[tokio::test]
async fn s2_aes128_explicit_iv() {
    let server = MockServer::start().await;
    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"k\",IV=0x000102030405060708090a0b0c0d0e0f\n\
#EXTINF:9.009,\nseg0.ts\n#EXT-X-ENDLIST\n";
    Mock::given(method("GET"))
        .and(path("/stream.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/k"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xAAu8; 16]))
        .mount(&server)
        .await;

    let key = [0xAAu8; 16];
    let iv: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
    let plaintext = ts_segment_of_len(512);
    let ciphertext = encrypt_for_test(&key, &iv, &plaintext);
    Mock::given(method("GET"))
        .and(path("/seg0.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ciphertext))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(EngineConfig::default(), tx).unwrap();
    engine
        .start_download(TaskConfig {
            task_id: "s2".into(),
            manifest_url: format!("{}/stream.m3u8", server.uri()),
            display_name: "s2-output".into(),
            output_dir: dir.path().to_path_buf(),
            thread_budget: 2,
            headers: HashMap::new(),
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(EngineEvent::MergeVideo { status, .. }) = rx.recv().await {
                return status;
            }
        }
    })
    .await
    .expect("task timed out");

    assert_eq!(status, Status::Muxed.code());
}

#[tokio::test]
async fn s3_aes128_implicit_iv_from_media_sequence() {
    let server = MockServer::start().await;
    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:5\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"k\"\n\
#EXTINF:9.009,\nseg0.ts\n#EXTINF:9.009,\nseg1.ts\n#EXT-X-ENDLIST\n";
    Mock::given(method("GET"))
        .and(path("/stream.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/k"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x11u8; 16]))
        .mount(&server)
        .await;

    let key = [0x11u8; 16];
    let mut iv0 = [0u8; 16];
    iv0[8..].copy_from_slice(&5u64.to_be_bytes());
    let mut iv1 = [0u8; 16];
    iv1[8..].copy_from_slice(&6u64.to_be_bytes());

    let plaintext = ts_segment_of_len(512);
    Mock::given(method("GET"))
        .and(path("/seg0.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(encrypt_for_test(&key, &iv0, &plaintext)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/seg1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(encrypt_for_test(&key, &iv1, &plaintext)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(EngineConfig::default(), tx).unwrap();
    engine
        .start_download(TaskConfig {
            task_id: "s3".into(),
            manifest_url: format!("{}/stream.m3u8", server.uri()),
            display_name: "s3-output".into(),
            output_dir: dir.path().to_path_buf(),
            thread_budget: 2,
            headers: HashMap::new(),
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(EngineEvent::MergeVideo { status, .. }) = rx.recv().await {
                return status;
            }
        }
    })
    .await
    .expect("task timed out");

    assert_eq!(status, Status::Muxed.code());
}

#[tokio::test]
async fn s4_transient_failure_then_success() {
    let server = MockServer::start().await;
    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:9.009,\nseg0.ts\n#EXTINF:9.009,\nseg1.ts\n#EXTINF:9.009,\nseg2.ts\n#EXT-X-ENDLIST\n";
    Mock::given(method("GET"))
        .and(path("/stream.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/seg0.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_segment_of_len(512)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/seg1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_segment_of_len(512)))
        .mount(&server)
        .await;

    // seg2 fails twice with 503 then succeeds, matching §9's S4 scenario.
    Mock::given(method("GET"))
        .and(path("/seg2.ts"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/seg2.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_segment_of_len(512)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut config = EngineConfig::default();
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(50);
    let engine = Engine::new(config, tx).unwrap();
    engine
        .start_download(TaskConfig {
            task_id: "s4".into(),
            manifest_url: format!("{}/stream.m3u8", server.uri()),
            display_name: "s4-output".into(),
            output_dir: dir.path().to_path_buf(),
            thread_budget: 1,
            headers: HashMap::new(),
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(EngineEvent::MergeVideo { status, .. }) = rx.recv().await {
                return status;
            }
        }
    })
    .await
    .expect("task timed out");

    assert_eq!(status, Status::Muxed.code());
}

#[tokio::test]
async fn s6_cancel_during_download_then_delete() {
    let server = MockServer::start().await;
    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:9.009,\nseg0.ts\n#EXTINF:9.009,\nseg1.ts\n#EXT-X-ENDLIST\n";
    Mock::given(method("GET"))
        .and(path("/stream.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;
    // Slow segments so the cancel lands mid-download rather than after completion.
    Mock::given(method("GET"))
        .and(path("/seg0.ts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(ts_segment_of_len(512))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/seg1.ts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(ts_segment_of_len(512))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let engine = Engine::new(EngineConfig::default(), tx).unwrap();
    engine
        .start_download(TaskConfig {
            task_id: "s6".into(),
            manifest_url: format!("{}/stream.m3u8", server.uri()),
            display_name: "s6-output".into(),
            output_dir: dir.path().to_path_buf(),
            thread_budget: 1,
            headers: HashMap::new(),
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel_download("s6").unwrap();

    let status = poll_until_terminal(&engine, "s6", Duration::from_secs(5)).await;
    assert_eq!(status, Status::Cancelled.code());
    assert!(dir.path().join(".m3u8dl-s6").exists());

    engine.delete_download("s6").await.unwrap();
    assert!(!dir.path().join(".m3u8dl-s6").exists());
}

/// A fatal pre-download error (here, a master playlist) must still produce a
/// terminal `download_progress` event (§6) rather than leaving a caller
/// blocked on `events_rx.recv()` forever with no further events coming.
#[tokio::test]
async fn fatal_manifest_error_emits_terminal_progress_instead_of_hanging() {
    let server = MockServer::start().await;
    let playlist = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1280000\nlow.m3u8\n";
    Mock::given(method("GET"))
        .and(path("/stream.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(EngineConfig::default(), tx).unwrap();
    engine
        .start_download(TaskConfig {
            task_id: "bad-manifest".into(),
            manifest_url: format!("{}/stream.m3u8", server.uri()),
            display_name: "bad-manifest-output".into(),
            output_dir: dir.path().to_path_buf(),
            thread_budget: 2,
            headers: HashMap::new(),
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(EngineEvent::DownloadProgress { status, .. }) => return status,
                Some(_) => {}
                None => panic!("event channel closed before a terminal event"),
            }
        }
    })
    .await
    .expect("terminal progress event must arrive promptly, not hang");

    assert_eq!(status, Status::MuxFailed.code());
}

/// *S5 — resume after kill.* Rather than racing a real process kill, this
/// pre-populates the segment store exactly the way a crash mid-run would
/// leave it (segment 0 durable on disk with its journal entry, segment 1
/// never attempted) and then starts a fresh task against the same id and
/// output directory, standing in for the restarted process. Only the
/// missing segment should be fetched.
#[tokio::test]
async fn s5_resume_after_kill_only_refetches_missing_segments() {
    use hlsdl_engine::store::SegmentStore;

    let server = MockServer::start().await;
    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:9.009,\nseg0.ts\n#EXTINF:9.009,\nseg1.ts\n#EXT-X-ENDLIST\n";
    Mock::given(method("GET"))
        .and(path("/stream.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;
    // No mock is registered for seg0.ts: if resume incorrectly re-fetches an
    // already-durable segment, that GET 404s and the task fails loudly
    // instead of silently passing.
    Mock::given(method("GET"))
        .and(path("/seg1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_segment_of_len(512)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    {
        // Simulate the state a crash right after segment 0's journal append
        // would leave behind.
        let store = SegmentStore::open(dir.path(), "s5").await.unwrap();
        store.commit_segment(0, &ts_segment_of_len(1024)).await.unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(EngineConfig::default(), tx).unwrap();
    engine
        .start_download(TaskConfig {
            task_id: "s5".into(),
            manifest_url: format!("{}/stream.m3u8", server.uri()),
            display_name: "s5-output".into(),
            output_dir: dir.path().to_path_buf(),
            thread_budget: 2,
            headers: HashMap::new(),
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(EngineEvent::MergeVideo { status, .. }) = rx.recv().await {
                return status;
            }
        }
    })
    .await
    .expect("task timed out");

    assert_eq!(status, Status::Muxed.code());
    assert!(!dir.path().join(".m3u8dl-s5").exists());
}

fn encrypt_for_test(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    use aes::Aes128;
    use cbc::cipher::block_padding::Pkcs7;
    use cbc::cipher::{BlockEncryptMut, KeyIvInit};
    type Enc = cbc::Encryptor<Aes128>;
    let mut encryptor = Enc::new(key.into(), iv.into());
    encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

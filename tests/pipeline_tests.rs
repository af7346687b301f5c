use label_client_lib::config::BinarySinkConfig;
use label_client_lib::error::AppError;
use label_client_lib::models::classify_types::Prediction;
use label_client_lib::models::wire_types::Packet;
use label_client_lib::pipeline::{LabelPipeline, PipelineOptions};
use label_client_lib::services::classifier::Labeler;
use label_client_lib::services::dispatch::binary::read_frame;
use label_client_lib::services::dispatch::BinaryDispatcher;
use label_client_lib::services::fs_service::ExtensionFilter;
use label_client_lib::services::pool::PoolConfig;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fake_labeler() -> Box<dyn Labeler> {
    Box::new(|path: &Path| -> Result<Vec<Prediction>, AppError> {
        let stem = path.file_stem().unwrap().to_string_lossy().to_string();
        if stem == "broken" || fs::metadata(path)?.len() == 0 {
            return Err(AppError::Inference("unreadable image".into()));
        }
        Ok(vec![
            Prediction { class_name: stem, confidence: 0.75 },
            Prediction { class_name: "background".into(), confidence: 0.25 },
        ])
    })
}

/// A pipeline sending to a local listener, plus the accepted server side.
fn connected_pipeline(root: &Path, watch: bool) -> (LabelPipeline, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let dispatcher = BinaryDispatcher::connect(&BinarySinkConfig {
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout_ms: 1000,
    });
    assert!(dispatcher.is_connected());
    let (conn, _) = listener.accept().unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let options = PipelineOptions {
        root: root.to_path_buf(),
        filter: ExtensionFilter::new(["jpg"]),
        watch,
        deduplicate: true,
        settle: Duration::from_secs(2),
        image_pool: PoolConfig::default(),
        network_pool: PoolConfig {
            workers: 2,
            ..PoolConfig::default()
        },
    };
    let pipeline = LabelPipeline::new(options, fake_labeler(), Arc::new(dispatcher)).unwrap();
    (pipeline, conn)
}

fn frame_path(packet: &Packet) -> PathBuf {
    let entries = &packet.payload.as_ref().unwrap().entry;
    PathBuf::from(&entries[0].path)
}

fn assert_entries_aligned(packet: &Packet) {
    let entries = &packet.payload.as_ref().unwrap().entry;
    assert_eq!(entries.len(), 2);
    for (pos, entry) in entries.iter().enumerate() {
        assert_eq!(entry.index as usize, pos);
        assert_eq!(entry.path, entries[0].path);
    }
    let stem = frame_path(packet)
        .file_stem()
        .unwrap()
        .to_string_lossy()
        .to_string();
    assert_eq!(entries[0].key, stem);
    assert_eq!(entries[0].probability, 0.75);
    assert_eq!(entries[1].key, "background");
    assert_eq!(entries[1].probability, 0.25);
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(path).unwrap()
}

#[test]
fn test_scan_sends_one_packet_per_matching_image() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.jpg"), b"x").unwrap();
    fs::write(dir.path().join("b.png"), b"x").unwrap();
    fs::create_dir(dir.path().join("nested")).unwrap();
    fs::write(dir.path().join("nested/c.jpg"), b"x").unwrap();

    let (pipeline, mut conn) = connected_pipeline(dir.path(), false);
    let summary = pipeline.start().unwrap();
    assert_eq!(summary.matched, 2);
    assert_eq!(summary.skipped, 1);

    let mut paths = BTreeSet::new();
    for _ in 0..2 {
        let packet = read_frame(&mut conn).unwrap().unwrap();
        assert_entries_aligned(&packet);
        paths.insert(frame_path(&packet));
    }
    pipeline.shutdown();

    let expected: BTreeSet<PathBuf> = [
        absolute(dir.path().join("a.jpg")),
        absolute(dir.path().join("nested/c.jpg")),
    ]
    .into_iter()
    .collect();
    assert_eq!(paths, expected);
    assert_eq!(pipeline.network_stats().completed, 2);
}

#[test]
fn test_file_created_after_start_is_sent_once() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("existing.jpg"), b"x").unwrap();

    let (pipeline, mut conn) = connected_pipeline(dir.path(), true);
    pipeline.start().unwrap();

    let first = read_frame(&mut conn).unwrap().unwrap();
    assert_eq!(frame_path(&first), absolute(dir.path().join("existing.jpg")));

    fs::create_dir(dir.path().join("later")).unwrap();
    // Give the watcher a moment to pick up the new directory.
    std::thread::sleep(Duration::from_millis(200));
    fs::write(dir.path().join("later/fresh.jpg"), b"x").unwrap();

    let second = read_frame(&mut conn).unwrap().unwrap();
    assert_entries_aligned(&second);
    assert_eq!(
        frame_path(&second),
        absolute(dir.path().join("later/fresh.jpg"))
    );

    conn.set_read_timeout(Some(Duration::from_millis(700)))
        .unwrap();
    assert!(read_frame(&mut conn).is_err());
    pipeline.shutdown();
}

#[test]
fn test_slowly_written_file_is_labeled_once_complete() {
    let dir = TempDir::new().unwrap();
    let (pipeline, mut conn) = connected_pipeline(dir.path(), true);
    pipeline.start().unwrap();

    let mut out = fs::File::create(dir.path().join("big.jpg")).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    out.write_all(&vec![7u8; 100_000]).unwrap();
    drop(out);

    let packet = read_frame(&mut conn).unwrap().unwrap();
    assert_entries_aligned(&packet);
    assert_eq!(frame_path(&packet), absolute(dir.path().join("big.jpg")));

    conn.set_read_timeout(Some(Duration::from_millis(700)))
        .unwrap();
    assert!(read_frame(&mut conn).is_err());
    pipeline.shutdown();
    assert_eq!(pipeline.image_stats().failed, 0);
}

#[test]
fn test_labeler_failure_sends_nothing_for_that_image() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("broken.jpg"), b"x").unwrap();
    fs::write(dir.path().join("fine.jpg"), b"x").unwrap();

    let (pipeline, mut conn) = connected_pipeline(dir.path(), false);
    pipeline.start().unwrap();
    pipeline.shutdown();

    let packet = read_frame(&mut conn).unwrap().unwrap();
    assert_eq!(frame_path(&packet), absolute(dir.path().join("fine.jpg")));

    conn.set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(read_frame(&mut conn).is_err());
    assert_eq!(pipeline.image_stats().failed, 1);
}

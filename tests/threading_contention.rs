use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use capture_node::testing::mocks::MockDriver;
use capture_node::{
    CaptureEngine, EngineConfig, PixelFormat, ReadError, StreamKey, StreamKind, StreamMode,
};
use tempfile::TempDir;

const FRAMES: u64 = 300;

#[test]
fn test_readers_never_see_partial_frames() {
    let dir = TempDir::new().unwrap();
    let driver = MockDriver::new();
    let device = driver.add_device("D1");
    let config = EngineConfig {
        idle_poll_ms: 1,
        lock_timeout_ms: 5,
        reap_interval_ms: 10,
        ..EngineConfig::at(dir.path())
    };
    let engine = Arc::new(CaptureEngine::with_config(&config, &driver).unwrap());
    let key = StreamKey::new(StreamKind::Depth, "contention");

    engine
        .enable_stream("D1", key.clone(), StreamMode::new(64, 48, PixelFormat::Z16, 30))
        .unwrap();
    engine.start_device("D1").unwrap();

    let start = Arc::new(Barrier::new(5));
    let done = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for reader_id in 0..4u64 {
        let engine = engine.clone();
        let key = key.clone();
        let start = start.clone();
        let done = done.clone();
        let reads = reads.clone();
        handles.push(std::thread::spawn(move || {
            start.wait();
            let mut previous = 0u64;
            while !done.load(Ordering::SeqCst) {
                let last = engine.last_timestamp("D1", &key).unwrap().unwrap_or(0);
                assert!(last >= previous, "last_timestamp went backwards");
                previous = last;

                let wanted = if reader_id % 2 == 0 { None } else { last.checked_sub(1) };
                match engine.get_frame("D1", &key, wanted.filter(|ts| *ts > 0)) {
                    Ok(frame) => {
                        assert_eq!(frame.len(), 8, "reader {} saw a partial frame", reader_id);
                        let ts = u64::from_le_bytes(frame[..].try_into().unwrap());
                        assert!(ts <= engine.last_timestamp("D1", &key).unwrap().unwrap_or(0));
                        reads.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        let read = err.as_read().cloned().expect("only read errors");
                        assert!(
                            matches!(read, ReadError::Unavailable { .. } | ReadError::NotYetWritten { .. }),
                            "unexpected {:?}",
                            read
                        );
                        std::thread::yield_now();
                    }
                }
            }
        }));
    }

    start.wait();
    for ts in 1..=FRAMES {
        device.push_frame(StreamKind::Depth, ts, ts.to_le_bytes().to_vec());
        if ts % 50 == 0 {
            std::thread::yield_now();
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.last_timestamp("D1", &key).unwrap() != Some(FRAMES) {
        assert!(Instant::now() < deadline, "writer did not drain the device");
        std::thread::sleep(Duration::from_millis(2));
    }
    done.store(true, Ordering::SeqCst);

    for handle in handles {
        handle.join().expect("reader should complete");
    }

    assert!(reads.load(Ordering::Relaxed) >= 1);
    assert_eq!(device.pending_frames(StreamKind::Depth), 0);
}

#[test]
fn test_status_and_toggling_under_contention() {
    let dir = TempDir::new().unwrap();
    let driver = MockDriver::new();
    let device = driver.add_device("D1");
    let config = EngineConfig {
        idle_poll_ms: 1,
        lock_timeout_ms: 5,
        reap_interval_ms: 5,
        ..EngineConfig::at(dir.path())
    };
    let engine = Arc::new(CaptureEngine::with_config(&config, &driver).unwrap());
    engine.start_device("D1").unwrap();

    let start = Arc::new(Barrier::new(3));
    let mut handles = Vec::new();

    {
        let engine = engine.clone();
        let start = start.clone();
        handles.push(std::thread::spawn(move || {
            start.wait();
            let key = StreamKey::new(StreamKind::Infrared, "toggle");
            let mode = StreamMode::new(64, 48, PixelFormat::Y8, 30);
            let mut enabled = 0usize;
            let deadline = Instant::now() + Duration::from_secs(10);
            while enabled < 10 && Instant::now() < deadline {
                if engine.enable_stream("D1", key.clone(), mode).is_ok() {
                    enabled += 1;
                    engine.disable_stream("D1", &key).unwrap();
                }
                std::thread::yield_now();
            }
            enabled
        }));
    }

    {
        let engine = engine.clone();
        let start = start.clone();
        handles.push(std::thread::spawn(move || {
            start.wait();
            for _ in 0..200 {
                let report = engine.status();
                assert!(report.device("D1").unwrap().connected);
                assert!(report.device("D1").unwrap().active_streams.len() <= 1);
            }
            0
        }));
    }

    start.wait();
    device.push_frame(StreamKind::Infrared, 1, vec![0u8; 4]);

    let results: Vec<usize> = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread should complete"))
        .collect();
    assert_eq!(results[0], 10, "every enable after a reap must succeed");
}

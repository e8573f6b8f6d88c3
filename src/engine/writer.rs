//! Per-stream capture loop: poll the device, persist the frame, publish
//! its timestamp.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::core::lock::{lock_mutex, lock_mutex_with_timeout};
use crate::core::{ComponentLogger, LogContext, StreamKey};
use crate::store::FrameStore;

use super::registry::DeviceHandle;

/// Timing and retry knobs shared by every writer of an engine.
#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    pub idle_poll: Duration,
    pub error_backoff: Duration,
    pub lock_timeout: Duration,
    pub max_write_failures: u32,
}

impl From<&EngineConfig> for WriterSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            idle_poll: config.idle_poll(),
            error_backoff: config.error_backoff(),
            lock_timeout: config.lock_timeout(),
            max_write_failures: config.max_write_failures,
        }
    }
}

impl Default for WriterSettings {
    fn default() -> Self {
        WriterSettings::from(&EngineConfig::default())
    }
}

/// Write progress of one stream, shared between its writer and readers.
///
/// `last_timestamp` only moves forward and is stored after the frame file
/// is in place, so every timestamp strictly below it is complete on disk.
/// It is meaningful only once `published` is set; zero is a valid frame
/// timestamp.
#[derive(Debug)]
pub struct WriteProgress {
    last_timestamp: AtomicU64,
    published: AtomicBool,
    floor: Option<u64>,
    stop_requested: AtomicBool,
    frames_written: AtomicU64,
    errors: AtomicU64,
    failure: Mutex<Option<String>>,
}

/// Point-in-time copy of the read-relevant part of [`WriteProgress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSnapshot {
    pub last_timestamp: Option<u64>,
    pub floor: Option<u64>,
}

impl WriteSnapshot {
    /// Newest timestamp known to be fully written.
    pub fn newest_complete(&self) -> Option<u64> {
        match (self.last_timestamp, self.floor) {
            (Some(last), Some(floor)) => Some(last.max(floor)),
            (last, floor) => last.or(floor),
        }
    }

    /// Whether an explicit request for `timestamp` may be served.
    pub fn is_complete(&self, timestamp: u64) -> bool {
        self.last_timestamp.is_some_and(|last| timestamp < last)
            || self.floor.is_some_and(|floor| timestamp <= floor)
    }
}

impl WriteProgress {
    /// `floor` is the newest timestamp already on disk when the stream was
    /// enabled, if any.
    pub fn new(floor: Option<u64>) -> Self {
        Self {
            last_timestamp: AtomicU64::new(0),
            published: AtomicBool::new(false),
            floor,
            stop_requested: AtomicBool::new(false),
            frames_written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            failure: Mutex::new(None),
        }
    }

    /// Newest published timestamp, `None` before the first frame.
    pub fn last_timestamp(&self) -> Option<u64> {
        if self.published.load(Ordering::Acquire) {
            Some(self.last_timestamp.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> WriteSnapshot {
        WriteSnapshot {
            last_timestamp: self.last_timestamp(),
            floor: self.floor,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn failure(&self) -> Option<String> {
        lock_mutex(&self.failure, "WriteProgress::failure").clone()
    }

    fn accepts(&self, timestamp: u64) -> bool {
        match self.snapshot().newest_complete() {
            Some(newest) => timestamp > newest,
            None => true,
        }
    }

    fn publish(&self, timestamp: u64) {
        self.last_timestamp.fetch_max(timestamp, Ordering::AcqRel);
        self.published.store(true, Ordering::Release);
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn fail(&self, reason: String) {
        *lock_mutex(&self.failure, "WriteProgress::fail") = Some(reason);
        self.request_stop();
    }
}

/// Raises the stop flag when the writer thread exits, including by panic,
/// which makes the state reapable.
struct StopOnExit(Arc<WriteProgress>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.request_stop();
    }
}

pub struct StreamWriter {
    device_id: String,
    key: StreamKey,
    handle: Arc<DeviceHandle>,
    store: Arc<dyn FrameStore>,
    progress: Arc<WriteProgress>,
    settings: WriterSettings,
}

impl ComponentLogger for StreamWriter {
    fn log_context(&self) -> LogContext {
        LogContext::new("Writer", &self.device_id).with_stream(&self.key)
    }
}

impl StreamWriter {
    pub fn new(
        device_id: &str,
        key: StreamKey,
        handle: Arc<DeviceHandle>,
        store: Arc<dyn FrameStore>,
        progress: Arc<WriteProgress>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            key,
            handle,
            store,
            progress,
            settings,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        let thread_name = format!("writer-{}-{}-{}", self.device_id, self.key.kind, self.key.name);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || self.run())
    }

    fn run(self) {
        let _stop_on_exit = StopOnExit(self.progress.clone());
        let lock_context = format!("writer {} {}", self.device_id, self.key);
        let mut write_failures = 0u32;

        self.info("writer started");

        while !self.progress.stop_requested() {
            let Some(mut device) = lock_mutex_with_timeout(
                self.handle.device(),
                &lock_context,
                self.settings.lock_timeout,
            ) else {
                continue;
            };

            let frame = match device.poll_frame(self.key.kind) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    drop(device);
                    std::thread::sleep(self.settings.idle_poll);
                    continue;
                }
                Err(err) => {
                    drop(device);
                    self.progress.record_error();
                    self.warn(&format!("poll failed: {}", err));
                    std::thread::sleep(self.settings.error_backoff);
                    continue;
                }
            };

            if !self.progress.accepts(frame.timestamp) {
                self.debug(&format!("dropping stale frame {}", frame.timestamp));
                continue;
            }

            match self
                .store
                .write(&self.device_id, &self.key, frame.timestamp, &frame.data)
            {
                Ok(()) => {
                    write_failures = 0;
                    self.progress.publish(frame.timestamp);
                }
                Err(err) => {
                    write_failures += 1;
                    self.progress.record_error();
                    if write_failures >= self.settings.max_write_failures {
                        self.error(&format!(
                            "giving up after {} failed writes: {}",
                            write_failures, err
                        ));
                        self.progress.fail(err.to_string());
                        break;
                    }
                    self.warn(&format!("write of frame {} failed: {}", frame.timestamp, err));
                }
            }
        }

        self.info(&format!(
            "writer stopped after {} frames (last={:?})",
            self.progress.frames_written(),
            self.progress.last_timestamp()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_without_frames() {
        let progress = WriteProgress::new(None);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.newest_complete(), None);
        assert!(!snapshot.is_complete(0));
        assert!(progress.accepts(0));
    }

    #[test]
    fn test_publish_is_monotonic() {
        let progress = WriteProgress::new(None);
        progress.publish(100);
        progress.publish(50);
        assert_eq!(progress.last_timestamp(), Some(100));
        assert_eq!(progress.frames_written(), 2);
        assert!(!progress.accepts(100));
        assert!(progress.accepts(101));
    }

    #[test]
    fn test_is_complete_is_strictly_below_last() {
        let progress = WriteProgress::new(None);
        progress.publish(100);
        let snapshot = progress.snapshot();
        assert!(snapshot.is_complete(50));
        assert!(snapshot.is_complete(99));
        assert!(!snapshot.is_complete(100));
        assert!(!snapshot.is_complete(150));
    }

    #[test]
    fn test_timestamp_zero_is_a_real_frame() {
        let progress = WriteProgress::new(None);
        assert_eq!(progress.last_timestamp(), None);
        assert!(progress.accepts(0));

        progress.publish(0);
        assert_eq!(progress.last_timestamp(), Some(0));
        assert_eq!(progress.snapshot().newest_complete(), Some(0));
        assert!(!progress.accepts(0), "a second frame at 0 is a duplicate");
        assert!(progress.accepts(1));
        assert!(!progress.snapshot().is_complete(0));

        progress.publish(1);
        assert!(progress.snapshot().is_complete(0));
    }

    #[test]
    fn test_floor_covers_earlier_recordings() {
        let progress = WriteProgress::new(Some(40));
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.newest_complete(), Some(40));
        assert!(snapshot.is_complete(40));
        assert!(!snapshot.is_complete(41));
        assert!(!progress.accepts(40));

        progress.publish(60);
        assert_eq!(progress.snapshot().newest_complete(), Some(60));
    }

    #[test]
    fn test_fail_records_reason_and_stops() {
        let progress = WriteProgress::new(None);
        progress.fail("disk full".into());
        assert!(progress.stop_requested());
        assert_eq!(progress.failure().as_deref(), Some("disk full"));
    }

    #[test]
    fn test_stop_on_exit_survives_panic() {
        let progress = Arc::new(WriteProgress::new(None));
        let shared = progress.clone();
        let result = std::thread::spawn(move || {
            let _guard = StopOnExit(shared);
            panic!("writer blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(progress.stop_requested());
    }
}

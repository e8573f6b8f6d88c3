use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::core::lock::lock_mutex;
use crate::core::{Frame, HardwareError, StoreError, StreamKey, StreamKind, StreamMode};
use crate::device::{CaptureDevice, DeviceDriver};
use crate::store::{FrameStore, FsFrameStore};

#[derive(Default)]
struct MockDeviceState {
    configured: HashMap<StreamKind, StreamMode>,
    queues: HashMap<StreamKind, VecDeque<Frame>>,
    modes: HashMap<StreamKind, Vec<StreamMode>>,
}

/// Shared state between a [`MockDevice`] owned by the engine and the test
/// that drives it.
#[derive(Default)]
struct MockShared {
    state: Mutex<MockDeviceState>,
    streaming: AtomicBool,
    polls: AtomicU64,
    failing_polls: AtomicU32,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
}

/// Test-side handle to a mock device: feeds frames and inspects calls.
#[derive(Clone)]
pub struct MockController {
    serial: String,
    shared: Arc<MockShared>,
}

impl MockController {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Queues a frame that the device hands out on a later poll.
    pub fn push_frame(&self, kind: StreamKind, timestamp: u64, data: impl Into<Bytes>) {
        lock_mutex(&self.shared.state, "MockController::push_frame")
            .queues
            .entry(kind)
            .or_default()
            .push_back(Frame::new(kind, timestamp, data));
    }

    pub fn pending_frames(&self, kind: StreamKind) -> usize {
        lock_mutex(&self.shared.state, "MockController::pending_frames")
            .queues
            .get(&kind)
            .map_or(0, VecDeque::len)
    }

    pub fn set_supported_modes(&self, kind: StreamKind, modes: Vec<StreamMode>) {
        lock_mutex(&self.shared.state, "MockController::set_supported_modes")
            .modes
            .insert(kind, modes);
    }

    pub fn configured_mode(&self, kind: StreamKind) -> Option<StreamMode> {
        lock_mutex(&self.shared.state, "MockController::configured_mode")
            .configured
            .get(&kind)
            .copied()
    }

    /// The next `count` polls fail with a hardware error.
    pub fn fail_next_polls(&self, count: u32) {
        self.shared.failing_polls.store(count, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u64 {
        self.shared.polls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.shared.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.shared.stop_calls.load(Ordering::SeqCst)
    }
}

pub struct MockDevice {
    serial: String,
    shared: Arc<MockShared>,
}

impl CaptureDevice for MockDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn name(&self) -> String {
        format!("Mock Camera {}", self.serial)
    }

    fn configure(&mut self, kind: StreamKind, mode: &StreamMode) -> Result<(), HardwareError> {
        lock_mutex(&self.shared.state, "MockDevice::configure")
            .configured
            .insert(kind, *mode);
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        self.shared.start_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        self.shared.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    fn poll_frame(&mut self, kind: StreamKind) -> Result<Option<Frame>, HardwareError> {
        self.shared.polls.fetch_add(1, Ordering::SeqCst);

        let failing = self.shared.failing_polls.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_polls.store(failing - 1, Ordering::SeqCst);
            return Err(HardwareError::failed("poll", &self.serial, "injected failure"));
        }

        if !self.is_streaming() {
            return Ok(None);
        }

        let mut state = lock_mutex(&self.shared.state, "MockDevice::poll_frame");
        if !state.configured.contains_key(&kind) {
            return Err(HardwareError::unsupported_stream(&self.serial, kind));
        }
        Ok(state.queues.get_mut(&kind).and_then(VecDeque::pop_front))
    }

    fn supported_modes(&self, kind: StreamKind) -> Vec<StreamMode> {
        lock_mutex(&self.shared.state, "MockDevice::supported_modes")
            .modes
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}

/// Driver over a fixed set of mock devices.
#[derive(Default)]
pub struct MockDriver {
    devices: Mutex<BTreeMap<String, Arc<MockShared>>>,
    unopenable: Mutex<HashSet<String>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new mock device and returns its controller.
    pub fn add_device(&self, serial: &str) -> MockController {
        let shared = Arc::new(MockShared::default());
        lock_mutex(&self.devices, "MockDriver::add_device").insert(serial.to_string(), shared.clone());
        MockController {
            serial: serial.to_string(),
            shared,
        }
    }

    /// Enumerated as connected, but `open` fails.
    pub fn add_unopenable_device(&self, serial: &str) {
        self.add_device(serial);
        lock_mutex(&self.unopenable, "MockDriver::add_unopenable_device").insert(serial.to_string());
    }
}

impl DeviceDriver for MockDriver {
    fn enumerate_connected(&self) -> Result<Vec<String>, HardwareError> {
        Ok(lock_mutex(&self.devices, "MockDriver::enumerate_connected")
            .keys()
            .cloned()
            .collect())
    }

    fn open(&self, serial: &str) -> Result<Box<dyn CaptureDevice>, HardwareError> {
        if lock_mutex(&self.unopenable, "MockDriver::open").contains(serial) {
            return Err(HardwareError::failed("open", serial, "device busy"));
        }
        let shared = lock_mutex(&self.devices, "MockDriver::open")
            .get(serial)
            .cloned()
            .ok_or_else(|| HardwareError::Disconnected {
                device: serial.to_string(),
            })?;
        Ok(Box::new(MockDevice {
            serial: serial.to_string(),
            shared,
        }))
    }
}

/// Filesystem store whose writes can be made to fail per stream, or to
/// stall for a fixed time.
pub struct FailingStore {
    inner: FsFrameStore,
    failing: Mutex<HashSet<(String, StreamKey)>>,
    failed_writes: AtomicU64,
    writes_started: AtomicU64,
    write_delay: Mutex<Duration>,
}

impl FailingStore {
    pub fn new(inner: FsFrameStore) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            failed_writes: AtomicU64::new(0),
            writes_started: AtomicU64::new(0),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Every later write sleeps for `delay` before touching the disk.
    pub fn set_write_delay(&self, delay: Duration) {
        *lock_mutex(&self.write_delay, "FailingStore::set_write_delay") = delay;
    }

    pub fn writes_started(&self) -> u64 {
        self.writes_started.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, device: &str, key: &StreamKey) {
        lock_mutex(&self.failing, "FailingStore::fail_writes")
            .insert((device.to_string(), key.clone()));
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::SeqCst)
    }
}

impl FrameStore for FailingStore {
    fn write(
        &self,
        device: &str,
        key: &StreamKey,
        timestamp: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        let delay = *lock_mutex(&self.write_delay, "FailingStore::write(delay)");
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let failing = lock_mutex(&self.failing, "FailingStore::write")
            .contains(&(device.to_string(), key.clone()));
        if failing {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::write(
                self.inner.frame_path(device, key, timestamp),
                std::io::Error::other("injected write failure"),
            ));
        }
        self.inner.write(device, key, timestamp, data)
    }

    fn read(&self, device: &str, key: &StreamKey, timestamp: u64) -> Result<Bytes, StoreError> {
        self.inner.read(device, key, timestamp)
    }

    fn exists(&self, device: &str, key: &StreamKey, timestamp: u64) -> bool {
        self.inner.exists(device, key, timestamp)
    }

    fn latest_timestamp(
        &self,
        device: &str,
        key: &StreamKey,
        at_or_before: Option<u64>,
    ) -> Result<Option<u64>, StoreError> {
        self.inner.latest_timestamp(device, key, at_or_before)
    }

    fn has_recording(&self, device: &str, key: &StreamKey) -> bool {
        self.inner.has_recording(device, key)
    }

    fn list_recorded_devices(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_recorded_devices()
    }

    fn list_recorded_streams(&self, device: &str) -> Result<Vec<StreamKey>, StoreError> {
        self.inner.list_recorded_streams(device)
    }

    fn prepare_device(&self, device: &str) -> Result<(), StoreError> {
        self.inner.prepare_device(device)
    }

    fn prepare_stream(&self, device: &str, key: &StreamKey) -> Result<(), StoreError> {
        self.inner.prepare_stream(device, key)
    }
}

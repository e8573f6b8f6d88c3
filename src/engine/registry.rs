//! Device registry: which devices exist, whether they are connected, and
//! which streams they are writing.
//!
//! Lock order is registry first, device second. Writers only ever take the
//! device lock, and no registry lock is held while waiting for a device
//! lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::core::lock::{lock_mutex, lock_read, lock_write};
use crate::core::{
    EngineError, EngineResult, HardwareError, RegistryError, StreamConfig, StreamKey, StreamKind,
    StreamMode,
};
use crate::device::{resolve_preset, CaptureDevice};
use crate::store::FrameStore;

use super::status::{DeviceStatus, StreamFault, StreamStatus, SupportedModes};
use super::writer::{StreamWriter, WriteProgress, WriteSnapshot, WriterSettings};

/// Owned handle of a connected device. The mutex is the device lock: every
/// hardware call goes through it.
pub struct DeviceHandle {
    serial: String,
    device: Mutex<Box<dyn CaptureDevice>>,
    streaming: AtomicBool,
}

impl DeviceHandle {
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self {
            serial: device.serial().to_string(),
            streaming: AtomicBool::new(device.is_streaming()),
            device: Mutex::new(device),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub(crate) fn device(&self) -> &Mutex<Box<dyn CaptureDevice>> {
        &self.device
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    fn context(&self, op: &str) -> String {
        format!("device {} {}", self.serial, op)
    }

    fn start(&self) -> Result<(), HardwareError> {
        let mut device = lock_mutex(&self.device, &self.context("start"));
        if !device.is_streaming() {
            device.start()?;
        }
        self.streaming.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&self) -> Result<bool, HardwareError> {
        let mut device = lock_mutex(&self.device, &self.context("stop"));
        let was_streaming = device.is_streaming();
        if was_streaming {
            device.stop()?;
        }
        self.streaming.store(false, Ordering::Relaxed);
        Ok(was_streaming)
    }
}

/// Registry record of one running (or finished, not yet reaped) writer.
pub(crate) struct StreamWriteState {
    progress: Arc<WriteProgress>,
    task: JoinHandle<()>,
}

pub(crate) struct DeviceEntry {
    handle: Option<Arc<DeviceHandle>>,
    name: Option<String>,
    modes: Vec<SupportedModes>,
    streams: BTreeMap<StreamKey, StreamWriteState>,
    /// Channels reserved by an `enable_stream` that is still configuring.
    pending: BTreeSet<StreamKind>,
    faults: BTreeMap<StreamKey, String>,
    session_keys: BTreeSet<StreamKey>,
}

impl DeviceEntry {
    pub(crate) fn disconnected() -> Self {
        Self {
            handle: None,
            name: None,
            modes: Vec::new(),
            streams: BTreeMap::new(),
            pending: BTreeSet::new(),
            faults: BTreeMap::new(),
            session_keys: BTreeSet::new(),
        }
    }

    pub(crate) fn attach(&mut self, device: Box<dyn CaptureDevice>) {
        self.name = Some(device.name());
        self.modes = StreamKind::ALL
            .iter()
            .map(|kind| SupportedModes {
                kind: *kind,
                modes: device.supported_modes(*kind),
            })
            .filter(|supported| !supported.modes.is_empty())
            .collect();
        self.handle = Some(Arc::new(DeviceHandle::new(device)));
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapOutcome {
    pub reaped: usize,
    pub panicked: usize,
}

pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, DeviceEntry>>,
    store: Arc<dyn FrameStore>,
    settings: WriterSettings,
    closed: AtomicBool,
}

impl DeviceRegistry {
    pub(crate) fn new(
        devices: BTreeMap<String, DeviceEntry>,
        store: Arc<dyn FrameStore>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            devices: RwLock::new(devices),
            store,
            settings,
            closed: AtomicBool::new(false),
        }
    }

    pub fn list_devices(&self) -> Vec<String> {
        lock_read(&self.devices, "list_devices").keys().cloned().collect()
    }

    pub fn device_status(&self, id: &str) -> Result<DeviceStatus, RegistryError> {
        let mut status = {
            let devices = lock_read(&self.devices, "device_status");
            let entry = devices.get(id).ok_or_else(|| unknown(id))?;
            Self::snapshot_entry(id, entry)
        };
        status.recordings = self.recordings(id);
        Ok(status)
    }

    pub fn all_status(&self) -> Vec<DeviceStatus> {
        let mut report: Vec<DeviceStatus> = {
            let devices = lock_read(&self.devices, "all_status");
            devices
                .iter()
                .map(|(id, entry)| Self::snapshot_entry(id, entry))
                .collect()
        };
        for status in &mut report {
            status.recordings = self.recordings(&status.id);
        }
        report
    }

    fn recordings(&self, id: &str) -> Vec<StreamKey> {
        self.store.list_recorded_streams(id).unwrap_or_else(|err| {
            log::warn!("cannot list recordings of '{}': {}", id, err);
            Vec::new()
        })
    }

    fn snapshot_entry(id: &str, entry: &DeviceEntry) -> DeviceStatus {
        DeviceStatus {
            id: id.to_string(),
            connected: entry.handle.is_some(),
            name: entry.name.clone(),
            streaming: entry.handle.as_ref().is_some_and(|h| h.is_streaming()),
            active_streams: entry
                .streams
                .iter()
                .map(|(key, state)| StreamStatus {
                    key: key.clone(),
                    last_timestamp: state.progress.last_timestamp(),
                    frames_written: state.progress.frames_written(),
                    errors: state.progress.errors(),
                    stopping: state.progress.stop_requested(),
                    failure: state.progress.failure(),
                })
                .collect(),
            faults: entry
                .faults
                .iter()
                .map(|(key, error)| StreamFault {
                    key: key.clone(),
                    error: error.clone(),
                })
                .collect(),
            supported_modes: entry.modes.clone(),
            recordings: Vec::new(),
        }
    }

    /// Reserves the channel under the registry lock, configures the device
    /// with only the device lock held, then re-takes the registry lock to
    /// spawn and insert the writer.
    pub fn enable_stream(
        &self,
        id: &str,
        key: StreamKey,
        config: StreamConfig,
    ) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let (handle, resumed) = {
            let mut devices = lock_write(&self.devices, "enable_stream");
            let entry = devices.get_mut(id).ok_or_else(|| unknown(id))?;
            if !key.has_valid_name() {
                return Err(RegistryError::InvalidName {
                    device: id.to_string(),
                    name: key.name,
                }
                .into());
            }
            let handle = entry
                .handle
                .clone()
                .ok_or_else(|| RegistryError::DeviceUnavailable {
                    device: id.to_string(),
                })?;

            // One writer per hardware channel, whatever name it records under.
            let busy = entry.pending.contains(&key.kind)
                || entry.streams.keys().any(|active| active.kind == key.kind);
            if busy {
                return Err(RegistryError::AlreadyActive {
                    device: id.to_string(),
                    key,
                }
                .into());
            }

            let resumed = entry.session_keys.contains(&key);
            if !resumed && self.store.has_recording(id, &key) {
                return Err(RegistryError::NameConflict {
                    device: id.to_string(),
                    key,
                }
                .into());
            }
            entry.pending.insert(key.kind);
            (handle, resumed)
        };

        let prepared = self.prepare_writer(id, &key, &handle, config, resumed);

        let mut devices = lock_write(&self.devices, "enable_stream(insert)");
        let entry = devices.get_mut(id).ok_or_else(|| unknown(id))?;
        entry.pending.remove(&key.kind);
        let (mode, floor) = prepared?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let progress = Arc::new(WriteProgress::new(floor));
        let writer = StreamWriter::new(
            id,
            key.clone(),
            handle,
            self.store.clone(),
            progress.clone(),
            self.settings,
        );
        let task = writer.spawn().map_err(EngineError::Spawn)?;

        log::info!("enabled {} on '{}' with {}", key, id, mode);
        entry.faults.remove(&key);
        entry.session_keys.insert(key.clone());
        entry.streams.insert(key, StreamWriteState { progress, task });
        Ok(())
    }

    /// Resolves and applies the mode and creates the destination. Runs
    /// without the registry lock.
    fn prepare_writer(
        &self,
        id: &str,
        key: &StreamKey,
        handle: &DeviceHandle,
        config: StreamConfig,
        resumed: bool,
    ) -> EngineResult<(StreamMode, Option<u64>)> {
        let floor = if resumed {
            self.store.latest_timestamp(id, key, None)?
        } else {
            None
        };

        let mode = {
            let mut device = lock_mutex(handle.device(), &handle.context("configure"));
            let mode = resolve_mode(&**device, key.kind, config)?;
            device.configure(key.kind, &mode)?;
            mode
        };
        self.store.prepare_stream(id, key)?;
        Ok((mode, floor))
    }

    /// Flags the writer of `key` to stop. Never waits for it.
    pub fn disable_stream(&self, id: &str, key: &StreamKey) -> Result<(), RegistryError> {
        let devices = lock_read(&self.devices, "disable_stream");
        let entry = devices.get(id).ok_or_else(|| unknown(id))?;
        let state = entry
            .streams
            .get(key)
            .ok_or_else(|| RegistryError::NotActive {
                device: id.to_string(),
                key: key.clone(),
            })?;

        if !state.progress.stop_requested() {
            log::info!("stop requested for {} on '{}'", key, id);
            state.progress.request_stop();
        }
        Ok(())
    }

    fn connected_handle(&self, id: &str, context: &str) -> Result<Arc<DeviceHandle>, RegistryError> {
        let devices = lock_read(&self.devices, context);
        let entry = devices.get(id).ok_or_else(|| unknown(id))?;
        entry
            .handle
            .clone()
            .ok_or_else(|| RegistryError::DeviceUnavailable {
                device: id.to_string(),
            })
    }

    pub fn start_device(&self, id: &str) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        let handle = self.connected_handle(id, "start_device")?;
        handle.start()?;
        log::info!("device '{}' started", id);
        Ok(())
    }

    /// Flags every writer of the device and stops the hardware. Returns the
    /// number of streams that were flagged.
    pub fn stop_device(&self, id: &str) -> EngineResult<usize> {
        let (handle, flagged) = {
            let devices = lock_read(&self.devices, "stop_device");
            let entry = devices.get(id).ok_or_else(|| unknown(id))?;
            let handle = entry
                .handle
                .clone()
                .ok_or_else(|| RegistryError::DeviceUnavailable {
                    device: id.to_string(),
                })?;
            let mut flagged = 0;
            for state in entry.streams.values() {
                if !state.progress.stop_requested() {
                    state.progress.request_stop();
                    flagged += 1;
                }
            }
            (handle, flagged)
        };

        if handle.stop()? {
            log::info!("device '{}' stopped, {} stream(s) flagged", id, flagged);
        }
        Ok(flagged)
    }

    pub fn write_snapshot(
        &self,
        id: &str,
        key: &StreamKey,
    ) -> Result<Option<WriteSnapshot>, RegistryError> {
        let devices = lock_read(&self.devices, "write_snapshot");
        let entry = devices.get(id).ok_or_else(|| unknown(id))?;
        Ok(entry.streams.get(key).map(|state| state.progress.snapshot()))
    }

    /// Removes and joins writers that were asked to stop and have exited.
    pub fn reap_finished(&self) -> ReapOutcome {
        let finished: Vec<(String, StreamKey, StreamWriteState)> = {
            let mut devices = lock_write(&self.devices, "reap_finished");
            let mut finished = Vec::new();
            for (id, entry) in devices.iter_mut() {
                let done: Vec<StreamKey> = entry
                    .streams
                    .iter()
                    .filter(|(_, state)| state.progress.stop_requested() && state.task.is_finished())
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in done {
                    if let Some(state) = entry.streams.remove(&key) {
                        if let Some(failure) = state.progress.failure() {
                            entry.faults.insert(key.clone(), failure);
                        }
                        finished.push((id.clone(), key, state));
                    }
                }
            }
            finished
        };

        let mut outcome = ReapOutcome::default();
        let mut panicked = Vec::new();
        for (id, key, state) in finished {
            match state.task.join() {
                Ok(()) => {
                    log::debug!("reaped writer {} on '{}'", key, id);
                    outcome.reaped += 1;
                }
                Err(_) => {
                    log::error!("writer {} on '{}' panicked", key, id);
                    outcome.panicked += 1;
                    panicked.push((id, key));
                }
            }
        }

        if !panicked.is_empty() {
            let mut devices = lock_write(&self.devices, "reap_finished(faults)");
            for (id, key) in panicked {
                if let Some(entry) = devices.get_mut(&id) {
                    entry.faults.insert(key, "writer panicked".to_string());
                }
            }
        }
        outcome
    }

    /// Stops and joins every writer. Returns the number that panicked.
    pub(crate) fn shutdown_writers(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let states: Vec<(String, StreamKey, StreamWriteState)> = {
            let mut devices = lock_write(&self.devices, "shutdown_writers");
            let mut states = Vec::new();
            for (id, entry) in devices.iter_mut() {
                for (key, state) in std::mem::take(&mut entry.streams) {
                    state.progress.request_stop();
                    states.push((id.clone(), key, state));
                }
            }
            states
        };

        let mut panicked = 0;
        for (id, key, state) in states {
            if state.task.join().is_err() {
                log::error!("writer {} on '{}' panicked during shutdown", key, id);
                panicked += 1;
            }
        }
        panicked
    }

    pub(crate) fn stop_all_devices(&self) {
        let handles: Vec<Arc<DeviceHandle>> = {
            let devices = lock_read(&self.devices, "stop_all_devices");
            devices
                .values()
                .filter_map(|entry| entry.handle.clone())
                .collect()
        };

        for handle in handles {
            match handle.stop() {
                Ok(true) => log::info!("device '{}' stopped", handle.serial()),
                Ok(false) => {}
                Err(err) => log::warn!("failed to stop device '{}': {}", handle.serial(), err),
            }
        }
    }
}

fn unknown(id: &str) -> RegistryError {
    RegistryError::UnknownDevice {
        device: id.to_string(),
    }
}

fn resolve_mode(
    device: &dyn CaptureDevice,
    kind: StreamKind,
    config: StreamConfig,
) -> Result<StreamMode, HardwareError> {
    match config {
        StreamConfig::Mode(mode) => Ok(mode),
        StreamConfig::Preset(preset) => {
            resolve_preset(&device.supported_modes(kind), preset).ok_or_else(|| {
                HardwareError::Unsupported {
                    device: device.serial().to_string(),
                    what: format!("preset {:?} on stream '{}'", preset, kind),
                }
            })
        }
    }
}

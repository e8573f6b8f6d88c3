//! The capture engine: device registry, writer threads, the overwatch
//! reaper, and the frame read path.

pub mod overwatch;
pub mod registry;
pub mod status;
pub mod writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::config::EngineConfig;
use crate::core::{
    utc_ms_now, EngineError, EngineResult, InitError, ReadError, StreamConfig, StreamKey,
};
use crate::device::DeviceDriver;
use crate::store::{FrameStore, FsFrameStore};

use overwatch::Overwatch;
use registry::{DeviceEntry, DeviceRegistry};

pub use registry::ReapOutcome;
pub use status::{DeviceStatus, StatusReport, StreamFault, StreamStatus, SupportedModes};
pub use writer::{WriteSnapshot, WriterSettings};

pub struct CaptureEngine {
    storage_root: PathBuf,
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn FrameStore>,
    overwatch: Option<Overwatch>,
    shut_down: bool,
}

impl CaptureEngine {
    /// Engine with default settings recording below `storage_root`.
    pub fn new(
        storage_root: impl Into<PathBuf>,
        driver: &dyn DeviceDriver,
    ) -> Result<Self, InitError> {
        Self::with_config(&EngineConfig::at(storage_root), driver)
    }

    pub fn with_config(config: &EngineConfig, driver: &dyn DeviceDriver) -> Result<Self, InitError> {
        let store = FsFrameStore::new(&config.storage_root).with_fsync(config.fsync);
        Self::with_store(config, driver, Arc::new(store))
    }

    /// Builds the device registry from the union of recorded devices in
    /// `store` and the devices `driver` reports as connected.
    pub fn with_store(
        config: &EngineConfig,
        driver: &dyn DeviceDriver,
        store: Arc<dyn FrameStore>,
    ) -> Result<Self, InitError> {
        let storage_root = config.storage_root.clone();
        if !storage_root.is_dir() {
            return Err(InitError::NotADirectory { path: storage_root });
        }

        let mut devices: BTreeMap<String, DeviceEntry> = BTreeMap::new();
        for id in store.list_recorded_devices()? {
            log::info!("found recordings for device '{}'", id);
            devices.insert(id, DeviceEntry::disconnected());
        }

        for serial in driver.enumerate_connected()? {
            let device = match driver.open(&serial) {
                Ok(device) => device,
                Err(err) => {
                    log::warn!("cannot open connected device '{}': {}", serial, err);
                    devices
                        .entry(serial)
                        .or_insert_with(DeviceEntry::disconnected);
                    continue;
                }
            };
            log::info!("found connected device '{}' ({})", serial, device.name());
            store.prepare_device(&serial)?;
            devices
                .entry(serial)
                .or_insert_with(DeviceEntry::disconnected)
                .attach(device);
        }

        let registry = Arc::new(DeviceRegistry::new(
            devices,
            store.clone(),
            WriterSettings::from(config),
        ));
        let overwatch =
            Overwatch::spawn(registry.clone(), config.reap_interval()).map_err(InitError::Spawn)?;

        Ok(Self {
            storage_root,
            registry,
            store,
            overwatch: Some(overwatch),
            shut_down: false,
        })
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Every known device serial, sorted.
    pub fn list_devices(&self) -> Vec<String> {
        self.registry.list_devices()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            generated_at_ms: utc_ms_now(),
            storage_root: self.storage_root.clone(),
            devices: self.registry.all_status(),
        }
    }

    pub fn device_status(&self, id: &str) -> EngineResult<DeviceStatus> {
        Ok(self.registry.device_status(id)?)
    }

    /// Configures the stream on the device and starts its writer thread.
    /// Returns without waiting for the first frame.
    pub fn enable_stream(
        &self,
        id: &str,
        key: StreamKey,
        config: impl Into<StreamConfig>,
    ) -> EngineResult<()> {
        self.registry.enable_stream(id, key, config.into())
    }

    /// Asks the writer of `key` to stop. The writer is joined later by the
    /// overwatch thread.
    pub fn disable_stream(&self, id: &str, key: &StreamKey) -> EngineResult<()> {
        Ok(self.registry.disable_stream(id, key)?)
    }

    pub fn start_device(&self, id: &str) -> EngineResult<()> {
        self.registry.start_device(id)
    }

    /// Flags every writer on the device and stops the hardware. Returns the
    /// number of streams flagged.
    pub fn stop_device(&self, id: &str) -> EngineResult<usize> {
        self.registry.stop_device(id)
    }

    /// Last published timestamp of an active writer.
    pub fn last_timestamp(&self, id: &str, key: &StreamKey) -> EngineResult<Option<u64>> {
        Ok(self
            .registry
            .write_snapshot(id, key)?
            .and_then(|snapshot| snapshot.last_timestamp))
    }

    /// Runs one overwatch cycle on the calling thread.
    pub fn reap_finished(&self) -> ReapOutcome {
        self.registry.reap_finished()
    }

    /// Frame `timestamp` of `key`, or the newest complete frame when
    /// `timestamp` is `None`.
    ///
    /// While a writer is active only timestamps strictly older than its
    /// last published one are served.
    pub fn get_frame(
        &self,
        id: &str,
        key: &StreamKey,
        timestamp: Option<u64>,
    ) -> EngineResult<Bytes> {
        let writing = self.registry.write_snapshot(id, key)?;

        let timestamp = match timestamp {
            Some(timestamp) => {
                if writing.is_some_and(|snapshot| !snapshot.is_complete(timestamp)) {
                    return Err(ReadError::NotYetWritten {
                        device: id.to_string(),
                        key: key.clone(),
                        timestamp,
                    }
                    .into());
                }
                timestamp
            }
            None => {
                let bound = match writing {
                    Some(snapshot) => match snapshot.newest_complete() {
                        Some(newest) => Some(newest),
                        None => return Err(unavailable(id, key)),
                    },
                    None => None,
                };
                self.store
                    .latest_timestamp(id, key, bound)?
                    .ok_or_else(|| unavailable(id, key))?
            }
        };

        self.read_frame(id, key, timestamp)
    }

    fn read_frame(&self, id: &str, key: &StreamKey, timestamp: u64) -> EngineResult<Bytes> {
        let corrupt = |reason: String| -> EngineError {
            ReadError::Corrupt {
                device: id.to_string(),
                key: key.clone(),
                timestamp,
                reason,
            }
            .into()
        };

        match self.store.read(id, key, timestamp) {
            Ok(data) if data.is_empty() => Err(corrupt("frame file is empty".to_string())),
            Ok(data) => Ok(data),
            Err(err) if err.is_not_found() => Err(corrupt("frame file is missing".to_string())),
            Err(err) => Err(corrupt(err.to_string())),
        }
    }

    /// Stops the overwatch thread, stops and joins every writer, then stops
    /// all streaming devices. Safe to call more than once.
    pub fn shutdown(&mut self) -> EngineResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        if let Some(mut overwatch) = self.overwatch.take() {
            if !overwatch.stop() {
                log::error!("overwatch thread panicked");
            }
        }

        let panicked = self.registry.shutdown_writers();
        self.registry.stop_all_devices();
        log::info!("capture engine shut down");

        if panicked > 0 {
            return Err(EngineError::WriterPanicked { count: panicked });
        }
        Ok(())
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("engine shutdown failed: {}", err);
        }
    }
}

fn unavailable(id: &str, key: &StreamKey) -> EngineError {
    ReadError::Unavailable {
        device: id.to_string(),
        key: key.clone(),
    }
    .into()
}

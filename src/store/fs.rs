//! Directory-tree frame store: `<root>/<device>/<kind>/<name>/<timestamp>`.
//!
//! Frames are written to a hidden `.<timestamp>.partial` file and renamed
//! into place, so a file under its final name is always complete.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::FrameStore;
use crate::core::{StoreError, StreamKey, StreamKind};

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct FsFrameStore {
    root: PathBuf,
    fsync: bool,
}

impl FsFrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fsync: false,
        }
    }

    /// Flush every frame to stable storage before it becomes visible.
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device_dir(&self, device: &str) -> PathBuf {
        self.root.join(device)
    }

    pub fn stream_dir(&self, device: &str, key: &StreamKey) -> PathBuf {
        self.root.join(device).join(key.kind.as_str()).join(&key.name)
    }

    pub fn frame_path(&self, device: &str, key: &StreamKey, timestamp: u64) -> PathBuf {
        self.stream_dir(device, key).join(timestamp.to_string())
    }

    fn partial_path(&self, device: &str, key: &StreamKey, timestamp: u64) -> PathBuf {
        self.stream_dir(device, key)
            .join(format!(".{}{}", timestamp, PARTIAL_SUFFIX))
    }

    /// All complete timestamps for `key`, ascending.
    pub fn list_timestamps(&self, device: &str, key: &StreamKey) -> Result<Vec<u64>, StoreError> {
        let dir = self.stream_dir(device, key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::scan(dir, err)),
        };

        let mut timestamps: Vec<u64> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u64>().ok())
            .collect();
        timestamps.sort_unstable();
        Ok(timestamps)
    }

    fn subdirectories(dir: &Path) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(dir).map_err(|err| StoreError::scan(dir, err))?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }

    fn write_partial(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(data)?;
        if self.fsync {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl FrameStore for FsFrameStore {
    fn write(
        &self,
        device: &str,
        key: &StreamKey,
        timestamp: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let partial = self.partial_path(device, key, timestamp);
        let target = self.frame_path(device, key, timestamp);

        let written = match self.write_partial(&partial, data) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.prepare_stream(device, key)?;
                self.write_partial(&partial, data)
            }
            other => other,
        };
        if let Err(err) = written {
            let _ = fs::remove_file(&partial);
            return Err(StoreError::write(partial, err));
        }

        fs::rename(&partial, &target).map_err(|err| {
            let _ = fs::remove_file(&partial);
            StoreError::write(target.clone(), err)
        })
    }

    fn read(&self, device: &str, key: &StreamKey, timestamp: u64) -> Result<Bytes, StoreError> {
        let path = self.frame_path(device, key, timestamp);
        fs::read(&path)
            .map(Bytes::from)
            .map_err(|err| StoreError::read(path, err))
    }

    fn exists(&self, device: &str, key: &StreamKey, timestamp: u64) -> bool {
        self.frame_path(device, key, timestamp).is_file()
    }

    fn latest_timestamp(
        &self,
        device: &str,
        key: &StreamKey,
        at_or_before: Option<u64>,
    ) -> Result<Option<u64>, StoreError> {
        let timestamps = self.list_timestamps(device, key)?;
        Ok(match at_or_before {
            Some(bound) => timestamps.into_iter().rev().find(|ts| *ts <= bound),
            None => timestamps.last().copied(),
        })
    }

    fn has_recording(&self, device: &str, key: &StreamKey) -> bool {
        self.stream_dir(device, key).exists()
    }

    fn list_recorded_devices(&self) -> Result<Vec<String>, StoreError> {
        Self::subdirectories(&self.root)
    }

    fn list_recorded_streams(&self, device: &str) -> Result<Vec<StreamKey>, StoreError> {
        let device_dir = self.device_dir(device);
        if !device_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for kind_name in Self::subdirectories(&device_dir)? {
            let kind = match kind_name.parse::<StreamKind>() {
                Ok(kind) => kind,
                Err(_) => {
                    log::debug!(
                        "ignoring unknown stream directory {:?}",
                        device_dir.join(&kind_name)
                    );
                    continue;
                }
            };
            for name in Self::subdirectories(&device_dir.join(&kind_name))? {
                keys.push(StreamKey::new(kind, name));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn prepare_device(&self, device: &str) -> Result<(), StoreError> {
        let dir = self.device_dir(device);
        fs::create_dir_all(&dir).map_err(|err| StoreError::write(dir, err))
    }

    fn prepare_stream(&self, device: &str, key: &StreamKey) -> Result<(), StoreError> {
        let dir = self.stream_dir(device, key);
        fs::create_dir_all(&dir).map_err(|err| StoreError::write(dir, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn color() -> StreamKey {
        StreamKey::new(StreamKind::Color, "rgb")
    }

    #[test]
    fn test_write_then_read() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FsFrameStore::new(temp_dir.path());

        store.write("D1", &color(), 42, b"pixels")?;

        assert!(store.exists("D1", &color(), 42));
        assert_eq!(store.read("D1", &color(), 42)?, Bytes::from_static(b"pixels"));
        assert!(temp_dir.path().join("D1/color/rgb/42").is_file());
        Ok(())
    }

    #[test]
    fn test_partial_files_are_invisible() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FsFrameStore::new(temp_dir.path());
        store.prepare_stream("D1", &color())?;
        fs::write(store.partial_path("D1", &color(), 9), b"half")?;
        store.write("D1", &color(), 3, b"whole")?;

        assert!(!store.exists("D1", &color(), 9));
        assert_eq!(store.list_timestamps("D1", &color())?, vec![3]);
        assert_eq!(store.latest_timestamp("D1", &color(), None)?, Some(3));
        Ok(())
    }

    #[test]
    fn test_latest_timestamp_respects_bound() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FsFrameStore::new(temp_dir.path()).with_fsync(true);
        for ts in [10, 20, 30] {
            store.write("D1", &color(), ts, &[ts as u8])?;
        }

        assert_eq!(store.latest_timestamp("D1", &color(), Some(25))?, Some(20));
        assert_eq!(store.latest_timestamp("D1", &color(), Some(30))?, Some(30));
        assert_eq!(store.latest_timestamp("D1", &color(), Some(5))?, None);
        assert_eq!(
            store.latest_timestamp("D9", &color(), None)?,
            None,
            "unknown device has no frames"
        );
        Ok(())
    }

    #[test]
    fn test_listings() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FsFrameStore::new(temp_dir.path());
        store.prepare_device("B")?;
        store.prepare_stream("A", &StreamKey::new(StreamKind::Depth, "near"))?;
        store.prepare_stream("A", &color())?;
        fs::create_dir_all(temp_dir.path().join("A/thermal/x"))?;
        fs::create_dir_all(temp_dir.path().join(".hidden"))?;

        assert_eq!(store.list_recorded_devices()?, vec!["A", "B"]);
        assert_eq!(
            store.list_recorded_streams("A")?,
            vec![StreamKey::new(StreamKind::Depth, "near"), color()]
        );
        assert!(store.list_recorded_streams("B")?.is_empty());
        assert!(store.list_recorded_streams("missing")?.is_empty());
        assert!(store.has_recording("A", &color()));
        assert!(!store.has_recording("B", &color()));
        Ok(())
    }

    #[test]
    fn test_read_missing_frame_is_not_found() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FsFrameStore::new(temp_dir.path());
        let err = store.read("D1", &color(), 1).unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }
}

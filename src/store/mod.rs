//! Timestamp-indexed persistence of raw frame payloads.

pub mod fs;

use bytes::Bytes;

use crate::core::{StoreError, StreamKey};

pub use fs::FsFrameStore;

/// Sink and source of frame blobs keyed by device, stream and timestamp.
///
/// `write` must make the frame visible atomically: once `exists` reports a
/// timestamp, `read` returns the complete payload.
pub trait FrameStore: Send + Sync {
    fn write(
        &self,
        device: &str,
        key: &StreamKey,
        timestamp: u64,
        data: &[u8],
    ) -> Result<(), StoreError>;

    fn read(&self, device: &str, key: &StreamKey, timestamp: u64) -> Result<Bytes, StoreError>;

    fn exists(&self, device: &str, key: &StreamKey, timestamp: u64) -> bool;

    /// Newest stored timestamp, optionally bounded from above.
    fn latest_timestamp(
        &self,
        device: &str,
        key: &StreamKey,
        at_or_before: Option<u64>,
    ) -> Result<Option<u64>, StoreError>;

    /// Whether the destination for `key` already exists.
    fn has_recording(&self, device: &str, key: &StreamKey) -> bool;

    fn list_recorded_devices(&self) -> Result<Vec<String>, StoreError>;

    fn list_recorded_streams(&self, device: &str) -> Result<Vec<StreamKey>, StoreError>;

    fn prepare_device(&self, device: &str) -> Result<(), StoreError>;

    fn prepare_stream(&self, device: &str, key: &StreamKey) -> Result<(), StoreError>;
}

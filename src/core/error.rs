use std::path::PathBuf;

use thiserror::Error;

use super::{StreamKey, StreamKind};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("storage root {path:?} does not exist or is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("device enumeration failed: {0}")]
    Driver(#[from] HardwareError),
    #[error("frame store setup failed: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn overwatch thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device '{device}' is not known")]
    UnknownDevice { device: String },
    #[error("device '{device}' is not connected")]
    DeviceUnavailable { device: String },
    #[error("stream {key} on device '{device}' already has a writer")]
    AlreadyActive { device: String, key: StreamKey },
    #[error("stream {key} on device '{device}' is not being written")]
    NotActive { device: String, key: StreamKey },
    #[error("stream {key} on device '{device}' already holds recorded data")]
    NameConflict { device: String, key: StreamKey },
    #[error("stream name '{name}' on device '{device}' is not a single visible path segment")]
    InvalidName { device: String, name: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("frame {timestamp} of {key} on '{device}' is not written yet")]
    NotYetWritten {
        device: String,
        key: StreamKey,
        timestamp: u64,
    },
    #[error("no frame available for {key} on '{device}'")]
    Unavailable { device: String, key: StreamKey },
    #[error("frame {timestamp} of {key} on '{device}' is unreadable: {reason}")]
    Corrupt {
        device: String,
        key: StreamKey,
        timestamp: u64,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to scan {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub fn scan(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Scan {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        let source = match self {
            StoreError::Read { source, .. }
            | StoreError::Write { source, .. }
            | StoreError::Scan { source, .. } => source,
        };
        source.kind() == std::io::ErrorKind::NotFound
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("{op} failed on device '{device}': {message}")]
    Failed {
        op: &'static str,
        device: String,
        message: String,
    },
    #[error("device '{device}' does not support {what}")]
    Unsupported { device: String, what: String },
    #[error("device '{device}' is disconnected")]
    Disconnected { device: String },
}

impl HardwareError {
    pub fn failed(op: &'static str, device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            op,
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn unsupported_stream(device: impl Into<String>, kind: StreamKind) -> Self {
        Self::Unsupported {
            device: device.into(),
            what: format!("stream '{}'", kind),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error("failed to spawn writer thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine is shut down")]
    ShutDown,
    #[error("{count} writer thread(s) panicked during shutdown")]
    WriterPanicked { count: usize },
}

impl EngineError {
    pub fn as_registry(&self) -> Option<&RegistryError> {
        match self {
            EngineError::Registry(err) => Some(err),
            _ => None,
        }
    }

    pub fn as_read(&self) -> Option<&ReadError> {
        match self {
            EngineError::Read(err) => Some(err),
            _ => None,
        }
    }
}

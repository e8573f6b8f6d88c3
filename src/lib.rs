// src/lib.rs
pub mod config;
pub mod core;
pub mod device;
pub mod engine;
pub mod store;

pub mod testing {
    pub mod mocks;
}

// Re-export the most important types
pub use config::{EngineConfig, ReportFormat, StreamPlan};
pub use core::timestamp::utc_ms_now;
pub use core::{
    ComponentLogger, EngineError, EngineResult, Frame, HardwareError, InitError, LogContext,
    PixelFormat, ReadError, RegistryError, StoreError, StreamConfig, StreamKey, StreamKind,
    StreamMode, StreamPreset,
};
pub use device::{CaptureDevice, DeviceDriver, SyntheticDriver};
pub use engine::{CaptureEngine, DeviceStatus, StatusReport};
pub use store::{FrameStore, FsFrameStore};

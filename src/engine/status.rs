use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::core::{format_utc_ms, StreamKey, StreamKind, StreamMode};

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub key: StreamKey,
    /// `None` until the first frame is published.
    pub last_timestamp: Option<u64>,
    pub frames_written: u64,
    pub errors: u64,
    /// Stop was requested; the writer is waiting to be reaped.
    pub stopping: bool,
    pub failure: Option<String>,
}

/// Terminal error of a writer that has already been reaped.
#[derive(Debug, Clone, Serialize)]
pub struct StreamFault {
    pub key: StreamKey,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupportedModes {
    pub kind: StreamKind,
    pub modes: Vec<StreamMode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub connected: bool,
    pub name: Option<String>,
    pub streaming: bool,
    pub active_streams: Vec<StreamStatus>,
    pub faults: Vec<StreamFault>,
    pub supported_modes: Vec<SupportedModes>,
    pub recordings: Vec<StreamKey>,
}

impl DeviceStatus {
    pub fn active_keys(&self) -> Vec<StreamKey> {
        self.active_streams.iter().map(|s| s.key.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at_ms: u64,
    pub storage_root: PathBuf,
    pub devices: Vec<DeviceStatus>,
}

impl StatusReport {
    pub fn device(&self, id: &str) -> Option<&DeviceStatus> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.id)?;
        if !self.connected {
            writeln!(f, "  Connected: no")?;
        } else {
            writeln!(f, "  Connected: yes")?;
            if let Some(name) = &self.name {
                writeln!(f, "  Device: {}", name)?;
            }
            writeln!(f, "  Streaming: {}", if self.streaming { "yes" } else { "no" })?;
            if !self.supported_modes.is_empty() {
                writeln!(f, "  Supported streams:")?;
                for supported in &self.supported_modes {
                    writeln!(
                        f,
                        "    {} - {} mode(s):",
                        supported.kind,
                        supported.modes.len()
                    )?;
                    for mode in &supported.modes {
                        writeln!(f, "      {}", mode)?;
                    }
                }
            }
        }

        if !self.active_streams.is_empty() {
            writeln!(f, "  Writing:")?;
            for stream in &self.active_streams {
                write!(f, "    {} last=", stream.key)?;
                match stream.last_timestamp {
                    Some(ts) => write!(f, "{}", ts)?,
                    None => write!(f, "-")?,
                }
                write!(
                    f,
                    " frames={} errors={}",
                    stream.frames_written, stream.errors
                )?;
                if stream.stopping {
                    write!(f, " (stopping)")?;
                }
                if let Some(failure) = &stream.failure {
                    write!(f, " failed: {}", failure)?;
                }
                writeln!(f)?;
            }
        }

        for fault in &self.faults {
            writeln!(f, "  Fault: {} {}", fault.key, fault.error)?;
        }

        writeln!(f, "  Available playback:")?;
        if self.recordings.is_empty() {
            writeln!(f, "    (none)")?;
        }
        for key in &self.recordings {
            writeln!(f, "    {}", key)?;
        }
        Ok(())
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Status at {}", format_utc_ms(self.generated_at_ms))?;
        writeln!(f, "Storage: {}", self.storage_root.display())?;
        for device in &self.devices {
            write!(f, "{}", device)?;
        }
        Ok(())
    }
}

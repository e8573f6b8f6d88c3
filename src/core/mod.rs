pub mod error;
pub mod lock;
pub mod logging;
pub mod timestamp;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use error::{
    EngineError, EngineResult, HardwareError, InitError, ReadError, RegistryError, StoreError,
};
pub use logging::{ComponentLogger, LogContext};
pub use timestamp::*;

/// One hardware channel of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Depth,
    Color,
    Infrared,
    Infrared2,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Depth,
        StreamKind::Color,
        StreamKind::Infrared,
        StreamKind::Infrared2,
    ];

    /// Directory name used below a device's recording folder.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Depth => "depth",
            StreamKind::Color => "color",
            StreamKind::Infrared => "infrared",
            StreamKind::Infrared2 => "infrared2",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown stream kind '{}'", s))
    }
}

/// Identifies one recorded channel of a device: the hardware stream plus the
/// logical name its frames are filed under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub kind: StreamKind,
    pub name: String,
}

impl StreamKey {
    pub fn new(kind: StreamKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// The name becomes one directory below the kind folder, so it must be a
    /// single visible path segment.
    pub fn has_valid_name(&self) -> bool {
        let name = self.name.as_str();
        !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0'])
            && name.trim() == name
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Any,
    Z16,
    Disparity16,
    Yuyv,
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    Y8,
    Y16,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` when the format does not
    /// fix a size.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Any => None,
            PixelFormat::Y8 => Some(1),
            PixelFormat::Z16 | PixelFormat::Disparity16 | PixelFormat::Yuyv | PixelFormat::Y16 => {
                Some(2)
            }
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => Some(3),
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => Some(4),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Any => "any",
            PixelFormat::Z16 => "z16",
            PixelFormat::Disparity16 => "disparity16",
            PixelFormat::Yuyv => "yuyv",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Bgr8 => "bgr8",
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Bgra8 => "bgra8",
            PixelFormat::Y8 => "y8",
            PixelFormat::Y16 => "y16",
        };
        f.write_str(name)
    }
}

/// Width, height, pixel format and frame rate a stream can be enabled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamMode {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub framerate: u32,
}

impl StreamMode {
    pub fn new(width: u32, height: u32, format: PixelFormat, framerate: u32) -> Self {
        Self {
            width,
            height,
            format,
            framerate,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} @ {}Hz {}",
            self.width, self.height, self.framerate, self.format
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPreset {
    BestQuality,
    LargestImage,
    HighestFramerate,
}

/// How a stream should be configured when it is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamConfig {
    Mode(StreamMode),
    Preset(StreamPreset),
}

impl From<StreamMode> for StreamConfig {
    fn from(mode: StreamMode) -> Self {
        StreamConfig::Mode(mode)
    }
}

impl From<StreamPreset> for StreamConfig {
    fn from(preset: StreamPreset) -> Self {
        StreamConfig::Preset(preset)
    }
}

/// A captured frame as handed over by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub timestamp: u64,
    pub data: Bytes,
}

impl Frame {
    pub fn new(kind: StreamKind, timestamp: u64, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            timestamp,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_round_trips_through_str() {
        for kind in StreamKind::ALL {
            let parsed: StreamKind = kind.as_str().parse().expect("parse kind");
            assert_eq!(parsed, kind);
        }
        assert_eq!("COLOR".parse::<StreamKind>().unwrap(), StreamKind::Color);
        assert!("thermal".parse::<StreamKind>().is_err());
    }

    #[test]
    fn test_stream_key_display() {
        let key = StreamKey::new(StreamKind::Depth, "front");
        assert_eq!(key.to_string(), "depth/front");
    }

    #[test]
    fn test_stream_key_names_stay_one_segment() {
        assert!(StreamKey::new(StreamKind::Color, "rgb-2").has_valid_name());
        for bad in ["", ".hidden", "..", "../up", "a/b", "a\\b", " padded"] {
            assert!(
                !StreamKey::new(StreamKind::Color, bad).has_valid_name(),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_stream_keys_order_by_kind_then_name() {
        let mut keys = vec![
            StreamKey::new(StreamKind::Color, "b"),
            StreamKey::new(StreamKind::Depth, "z"),
            StreamKey::new(StreamKind::Color, "a"),
        ];
        keys.sort();
        assert_eq!(keys[0], StreamKey::new(StreamKind::Depth, "z"));
        assert_eq!(keys[1], StreamKey::new(StreamKind::Color, "a"));
    }

    #[test]
    fn test_stream_mode_area_and_display() {
        let mode = StreamMode::new(640, 480, PixelFormat::Z16, 30);
        assert_eq!(mode.area(), 307_200);
        assert_eq!(mode.to_string(), "640x480 @ 30Hz z16");
        assert_eq!(PixelFormat::Rgb8.bytes_per_pixel(), Some(3));
        assert_eq!(PixelFormat::Any.bytes_per_pixel(), None);
    }
}

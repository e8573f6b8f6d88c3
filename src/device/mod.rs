//! Capability interface to the capture hardware.
//!
//! The engine never talks to a driver SDK directly. A [`DeviceDriver`]
//! enumerates and opens devices, and every opened device is an owned
//! [`CaptureDevice`] that the registry keeps behind its per-device lock.

pub mod synthetic;

use crate::core::{Frame, HardwareError, StreamKind, StreamMode, StreamPreset};

pub use synthetic::SyntheticDriver;

pub trait DeviceDriver: Send + Sync {
    /// Serials of the devices connected right now.
    fn enumerate_connected(&self) -> Result<Vec<String>, HardwareError>;

    fn open(&self, serial: &str) -> Result<Box<dyn CaptureDevice>, HardwareError>;
}

/// One opened capture device. Calls are serialized by the caller; an
/// implementation does not need to be `Sync`.
pub trait CaptureDevice: Send {
    fn serial(&self) -> &str;

    /// Human readable model name.
    fn name(&self) -> String;

    fn configure(&mut self, kind: StreamKind, mode: &StreamMode) -> Result<(), HardwareError>;

    fn start(&mut self) -> Result<(), HardwareError>;

    fn stop(&mut self) -> Result<(), HardwareError>;

    fn is_streaming(&self) -> bool;

    /// Next frame for `kind` if one is ready. Must not block for longer
    /// than one frame interval.
    fn poll_frame(&mut self, kind: StreamKind) -> Result<Option<Frame>, HardwareError>;

    fn supported_modes(&self, _kind: StreamKind) -> Vec<StreamMode> {
        Vec::new()
    }
}

const BEST_QUALITY_MIN_RATE: u32 = 30;

fn largest<'a>(modes: impl Iterator<Item = &'a StreamMode>) -> Option<StreamMode> {
    modes.max_by_key(|m| (m.area(), m.framerate)).copied()
}

/// Picks a concrete mode for `preset` out of the modes a device advertises.
pub fn resolve_preset(modes: &[StreamMode], preset: StreamPreset) -> Option<StreamMode> {
    match preset {
        StreamPreset::LargestImage => largest(modes.iter()),
        StreamPreset::HighestFramerate => modes
            .iter()
            .max_by_key(|m| (m.framerate, m.area()))
            .copied(),
        StreamPreset::BestQuality => {
            largest(modes.iter().filter(|m| m.framerate >= BEST_QUALITY_MIN_RATE))
                .or_else(|| largest(modes.iter()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PixelFormat;

    fn modes() -> Vec<StreamMode> {
        vec![
            StreamMode::new(640, 480, PixelFormat::Rgb8, 30),
            StreamMode::new(640, 480, PixelFormat::Rgb8, 60),
            StreamMode::new(1920, 1080, PixelFormat::Rgb8, 15),
            StreamMode::new(320, 240, PixelFormat::Rgb8, 90),
        ]
    }

    #[test]
    fn test_largest_image() {
        let mode = resolve_preset(&modes(), StreamPreset::LargestImage).unwrap();
        assert_eq!((mode.width, mode.framerate), (1920, 15));
    }

    #[test]
    fn test_highest_framerate() {
        let mode = resolve_preset(&modes(), StreamPreset::HighestFramerate).unwrap();
        assert_eq!((mode.width, mode.framerate), (320, 90));
    }

    #[test]
    fn test_best_quality_prefers_realtime_rates() {
        let mode = resolve_preset(&modes(), StreamPreset::BestQuality).unwrap();
        assert_eq!((mode.width, mode.framerate), (640, 60));

        let slow = [StreamMode::new(1280, 720, PixelFormat::Y8, 6)];
        assert_eq!(
            resolve_preset(&slow, StreamPreset::BestQuality),
            Some(slow[0])
        );
    }

    #[test]
    fn test_no_modes() {
        assert_eq!(resolve_preset(&[], StreamPreset::LargestImage), None);
    }
}

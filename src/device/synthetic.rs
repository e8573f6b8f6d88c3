//! Software-only capture devices producing deterministic test patterns at
//! the configured frame rate. Used by the daemon when no hardware driver is
//! linked in.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use super::{CaptureDevice, DeviceDriver};
use crate::core::timestamp::utc_ms_now;
use crate::core::{Frame, HardwareError, PixelFormat, StreamKind, StreamMode};

pub struct SyntheticDriver {
    serials: Vec<String>,
}

impl SyntheticDriver {
    pub fn new<I, S>(serials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            serials: serials.into_iter().map(Into::into).collect(),
        }
    }
}

impl DeviceDriver for SyntheticDriver {
    fn enumerate_connected(&self) -> Result<Vec<String>, HardwareError> {
        Ok(self.serials.clone())
    }

    fn open(&self, serial: &str) -> Result<Box<dyn CaptureDevice>, HardwareError> {
        if !self.serials.iter().any(|s| s == serial) {
            return Err(HardwareError::Disconnected {
                device: serial.to_string(),
            });
        }
        Ok(Box::new(SyntheticDevice::new(serial)))
    }
}

struct SyntheticStream {
    mode: StreamMode,
    interval: Duration,
    next_due: Instant,
    sequence: u64,
}

pub struct SyntheticDevice {
    serial: String,
    streams: HashMap<StreamKind, SyntheticStream>,
    streaming: bool,
    last_timestamp: u64,
}

impl SyntheticDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            streams: HashMap::new(),
            streaming: false,
            last_timestamp: 0,
        }
    }

    fn render(kind: StreamKind, mode: &StreamMode, sequence: u64) -> Vec<u8> {
        let width = mode.width as usize;
        let height = mode.height as usize;
        let bpp = mode.format.bytes_per_pixel().unwrap_or(1);
        let mut data = vec![0u8; width * height * bpp];

        match kind {
            StreamKind::Depth => {
                // Sloped plane drifting away one millimetre per frame.
                for (i, px) in data.chunks_exact_mut(2).enumerate() {
                    let (x, y) = ((i % width) as u64, (i / width) as u64);
                    let depth = 500 + (x + y + sequence) % 3500;
                    LittleEndian::write_u16(px, depth as u16);
                }
            }
            _ => {
                for (i, px) in data.chunks_exact_mut(bpp).enumerate() {
                    let (x, y) = (i % width, i / width);
                    for (c, byte) in px.iter_mut().enumerate() {
                        *byte = ((x + y * (c + 1)) as u64 + sequence) as u8;
                    }
                }
            }
        }
        data
    }
}

impl CaptureDevice for SyntheticDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn name(&self) -> String {
        "Synthetic Depth Camera".to_string()
    }

    fn configure(&mut self, kind: StreamKind, mode: &StreamMode) -> Result<(), HardwareError> {
        if self.streaming {
            return Err(HardwareError::failed(
                "configure",
                &self.serial,
                "cannot reconfigure while streaming",
            ));
        }
        if mode.framerate == 0 || mode.width == 0 || mode.height == 0 {
            return Err(HardwareError::Unsupported {
                device: self.serial.clone(),
                what: format!("mode {}", mode),
            });
        }

        let interval = Duration::from_secs(1) / mode.framerate;
        self.streams.insert(
            kind,
            SyntheticStream {
                mode: *mode,
                interval,
                next_due: Instant::now(),
                sequence: 0,
            },
        );
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        if self.streams.is_empty() {
            return Err(HardwareError::failed(
                "start",
                &self.serial,
                "no stream configured",
            ));
        }
        let now = Instant::now();
        for stream in self.streams.values_mut() {
            stream.next_due = now;
        }
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        self.streaming = false;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn poll_frame(&mut self, kind: StreamKind) -> Result<Option<Frame>, HardwareError> {
        if !self.streaming {
            return Ok(None);
        }
        let stream = self
            .streams
            .get_mut(&kind)
            .ok_or_else(|| HardwareError::unsupported_stream(&self.serial, kind))?;

        let now = Instant::now();
        if now < stream.next_due {
            return Ok(None);
        }
        stream.next_due += stream.interval;
        if stream.next_due < now {
            // Fell behind; skip the missed frames instead of bursting.
            stream.next_due = now + stream.interval;
        }
        stream.sequence += 1;

        let data = Self::render(kind, &stream.mode, stream.sequence);
        let timestamp = utc_ms_now().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        Ok(Some(Frame::new(kind, timestamp, data)))
    }

    fn supported_modes(&self, kind: StreamKind) -> Vec<StreamMode> {
        match kind {
            StreamKind::Depth => vec![
                StreamMode::new(320, 240, PixelFormat::Z16, 30),
                StreamMode::new(640, 480, PixelFormat::Z16, 30),
                StreamMode::new(640, 480, PixelFormat::Z16, 60),
            ],
            StreamKind::Color => vec![
                StreamMode::new(640, 480, PixelFormat::Rgb8, 30),
                StreamMode::new(640, 480, PixelFormat::Rgb8, 60),
                StreamMode::new(1920, 1080, PixelFormat::Rgb8, 15),
            ],
            StreamKind::Infrared | StreamKind::Infrared2 => vec![
                StreamMode::new(640, 480, PixelFormat::Y8, 30),
                StreamMode::new(640, 480, PixelFormat::Y8, 60),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_opens_only_known_serials() {
        let driver = SyntheticDriver::new(["SIM-1"]);
        assert_eq!(driver.enumerate_connected().unwrap(), vec!["SIM-1".to_string()]);
        assert!(driver.open("SIM-1").is_ok());
        assert!(matches!(
            driver.open("SIM-2"),
            Err(HardwareError::Disconnected { .. })
        ));
    }

    #[test]
    fn test_no_frames_before_start() {
        let mut device = SyntheticDevice::new("SIM-1");
        device
            .configure(StreamKind::Depth, &StreamMode::new(4, 2, PixelFormat::Z16, 30))
            .unwrap();
        assert_eq!(device.poll_frame(StreamKind::Depth).unwrap(), None);
    }

    #[test]
    fn test_depth_frame_layout_and_monotonic_timestamps() {
        let mut device = SyntheticDevice::new("SIM-1");
        device
            .configure(StreamKind::Depth, &StreamMode::new(4, 2, PixelFormat::Z16, 1000))
            .unwrap();
        device.start().unwrap();

        let first = device.poll_frame(StreamKind::Depth).unwrap().expect("frame due");
        assert_eq!(first.data.len(), 4 * 2 * 2);
        assert!(LittleEndian::read_u16(&first.data[..2]) >= 500);

        std::thread::sleep(Duration::from_millis(2));
        let second = device.poll_frame(StreamKind::Depth).unwrap().expect("frame due");
        assert!(second.timestamp > first.timestamp);
    }

    #[test]
    fn test_unconfigured_stream_is_an_error() {
        let mut device = SyntheticDevice::new("SIM-1");
        device
            .configure(StreamKind::Color, &StreamMode::new(2, 2, PixelFormat::Rgb8, 30))
            .unwrap();
        device.start().unwrap();
        assert!(device.poll_frame(StreamKind::Depth).is_err());
    }

    #[test]
    fn test_reconfigure_while_streaming_is_rejected() {
        let mut device = SyntheticDevice::new("SIM-1");
        let mode = StreamMode::new(2, 2, PixelFormat::Rgb8, 30);
        device.configure(StreamKind::Color, &mode).unwrap();
        device.start().unwrap();
        assert!(device.configure(StreamKind::Depth, &mode).is_err());
        device.stop().unwrap();
        assert!(device.configure(StreamKind::Depth, &mode).is_ok());
    }
}

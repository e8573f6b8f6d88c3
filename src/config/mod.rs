use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::core::{StreamConfig, StreamKey, StreamKind, StreamMode, StreamPreset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Text,
    Json,
}

/// A stream the daemon enables on startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamPlan {
    pub device: String,
    pub kind: StreamKind,
    pub name: String,
    #[serde(default)]
    pub mode: Option<StreamMode>,
    #[serde(default)]
    pub preset: Option<StreamPreset>,
    #[serde(default = "default_true")]
    pub autostart: bool,
}

fn default_true() -> bool {
    true
}

impl StreamPlan {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.kind, self.name.clone())
    }

    pub fn stream_config(&self) -> StreamConfig {
        match (self.mode, self.preset) {
            (Some(mode), _) => StreamConfig::Mode(mode),
            (None, Some(preset)) => StreamConfig::Preset(preset),
            (None, None) => StreamConfig::Preset(StreamPreset::BestQuality),
        }
    }

    fn validate(&self, index: usize) -> anyhow::Result<()> {
        if self.device.trim().is_empty() {
            bail!("streams[{}]: device must not be empty", index);
        }
        if !self.key().has_valid_name() {
            bail!(
                "streams[{}]: name '{}' must be a single non-hidden path segment",
                index,
                self.name
            );
        }
        if self.mode.is_some() && self.preset.is_some() {
            bail!("streams[{}]: set either mode or preset, not both", index);
        }
        if let Some(mode) = &self.mode {
            if mode.width == 0 || mode.height == 0 || mode.framerate == 0 {
                bail!("streams[{}]: mode {} has a zero dimension or rate", index, mode);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage_root: PathBuf,
    /// Sleep between polls when a device has no frame ready.
    pub idle_poll_ms: u64,
    /// Sleep after a failed poll before retrying.
    pub error_backoff_ms: u64,
    /// Longest a writer waits for its device lock before re-checking stop.
    pub lock_timeout_ms: u64,
    pub reap_interval_ms: u64,
    /// Consecutive store write failures after which a writer gives up.
    pub max_write_failures: u32,
    pub fsync: bool,

    pub synthetic_devices: Vec<String>,
    pub streams: Vec<StreamPlan>,
    pub status_interval_ms: u64,
    pub report_format: ReportFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("frames"),
            idle_poll_ms: 2,
            error_backoff_ms: 20,
            lock_timeout_ms: 50,
            reap_interval_ms: 100,
            max_write_failures: 3,
            fsync: false,
            synthetic_devices: Vec::new(),
            streams: Vec::new(),
            status_interval_ms: 5_000,
            report_format: ReportFormat::Text,
        }
    }
}

impl EngineConfig {
    pub fn at(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate().context("config validation failed")?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            bail!("storage_root must not be empty");
        }
        if self.lock_timeout_ms == 0 {
            bail!("lock_timeout_ms must be > 0");
        }
        if self.reap_interval_ms == 0 {
            bail!("reap_interval_ms must be > 0");
        }
        if self.max_write_failures == 0 {
            bail!("max_write_failures must be >= 1");
        }

        let mut seen = HashSet::new();
        for (index, plan) in self.streams.iter().enumerate() {
            plan.validate(index)?;
            if !seen.insert((plan.device.as_str(), plan.kind)) {
                bail!(
                    "streams[{}]: {} on '{}' is planned more than once",
                    index,
                    plan.kind,
                    plan.device
                );
            }
        }
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PixelFormat;

    const SAMPLE: &str = r#"
storage_root = "/var/lib/capture"
reap_interval_ms = 250
synthetic_devices = ["SIM-0001"]
report_format = "json"

[[streams]]
device = "SIM-0001"
kind = "depth"
name = "front"
mode = { width = 640, height = 480, format = "z16", framerate = 30 }

[[streams]]
device = "SIM-0001"
kind = "color"
name = "front"
preset = "highest_framerate"
autostart = false
"#;

    #[test]
    fn test_parse_sample() {
        let config: EngineConfig = toml::from_str(SAMPLE).expect("parse sample");
        config.validate().expect("sample is valid");

        assert_eq!(config.storage_root, PathBuf::from("/var/lib/capture"));
        assert_eq!(config.reap_interval(), Duration::from_millis(250));
        assert_eq!(config.idle_poll_ms, 2, "unset keys fall back to defaults");
        assert_eq!(config.report_format, ReportFormat::Json);
        assert_eq!(config.streams.len(), 2);

        let depth = &config.streams[0];
        assert!(depth.autostart);
        assert_eq!(
            depth.stream_config(),
            StreamConfig::Mode(StreamMode::new(640, 480, PixelFormat::Z16, 30))
        );
        assert_eq!(
            config.streams[1].stream_config(),
            StreamConfig::Preset(StreamPreset::HighestFramerate)
        );
        assert!(!config.streams[1].autostart);
    }

    #[test]
    fn test_plan_without_mode_uses_best_quality() {
        let plan = StreamPlan {
            device: "D1".into(),
            kind: StreamKind::Infrared,
            name: "ir".into(),
            mode: None,
            preset: None,
            autostart: true,
        };
        assert_eq!(
            plan.stream_config(),
            StreamConfig::Preset(StreamPreset::BestQuality)
        );
        assert_eq!(plan.key(), StreamKey::new(StreamKind::Infrared, "ir"));
    }

    #[test]
    fn test_rejects_bad_names_and_duplicates() {
        let mut config: EngineConfig = toml::from_str(SAMPLE).unwrap();
        config.streams[1].name = "../escape".into();
        assert!(config.validate().is_err());

        let mut config: EngineConfig = toml::from_str(SAMPLE).unwrap();
        config.streams[1].kind = StreamKind::Depth;
        assert!(config.validate().is_err());

        let mut config: EngineConfig = toml::from_str(SAMPLE).unwrap();
        config.streams[0].preset = Some(StreamPreset::LargestImage);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let mut config = EngineConfig::default();
        config.reap_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_write_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() -> anyhow::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let path = temp_dir.path().join("capture.toml");
        let config: EngineConfig = toml::from_str(SAMPLE)?;
        config.save(&path)?;

        let loaded = EngineConfig::load(&path)?;
        assert_eq!(loaded.streams.len(), 2);
        assert_eq!(loaded.synthetic_devices, vec!["SIM-0001".to_string()]);
        Ok(())
    }
}

//! Configuration management for beammon

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Width and height of a display region or output buffer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Video acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Interval between acquisition ticks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a single poll may wait for a frame before timing out
    #[serde(default = "default_grab_timeout_ms")]
    pub grab_timeout_ms: u64,
    /// Use the built-in synthetic camera instead of a V4L2 device
    #[serde(default)]
    pub emulate: bool,
}

fn default_poll_interval_ms() -> u64 {
    30
}

fn default_grab_timeout_ms() -> u64 {
    5000
}

impl VideoConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            poll_interval_ms: default_poll_interval_ms(),
            grab_timeout_ms: default_grab_timeout_ms(),
            emulate: false,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8092,
        }
    }
}

/// Size of the rectified output, fixed for the lifetime of the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RectifyConfig {
    pub width: u32,
    pub height: u32,
}

impl RectifyConfig {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl Default for RectifyConfig {
    fn default() -> Self {
        Self {
            width: 300,
            height: 200,
        }
    }
}

/// Target areas the three display regions are fitted into
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub raw: Size,
    pub rectified: Size,
    pub captured: Size,
    /// JPEG quality for preview encoding
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_jpeg_quality() -> u8 {
    80
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            raw: Size::new(800, 600),
            rectified: Size::new(400, 280),
            captured: Size::new(400, 280),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Video recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub directory: PathBuf,
    /// Frame rate written into the container header
    pub fps: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("recordings"),
            fps: 30,
        }
    }
}

/// Camera hardware settings applied at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Initial gain; left untouched when absent
    #[serde(default)]
    pub gain: Option<i64>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub rectify: RectifyConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub camera: CameraConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sizes_and_timing() {
        let config = Config::default();
        assert_eq!(config.rectify.size(), Size::new(300, 200));
        assert_eq!(config.video.poll_interval(), Duration::from_millis(30));
        assert_eq!(config.video.grab_timeout(), Duration::from_millis(5000));
        assert!(config.camera.gain.is_none());
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rectify]
            width = 640
            height = 480
            "#,
        )
        .unwrap();
        assert_eq!(config.rectify.size(), Size::new(640, 480));
        assert_eq!(config.video.device, "/dev/video0");
        assert_eq!(config.display.raw, Size::new(800, 600));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.camera.gain = Some(42);
        config.video.emulate = true;

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.camera.gain, Some(42));
        assert!(parsed.video.emulate);
        assert_eq!(parsed.display.captured, config.display.captured);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let video = VideoConfig {
            poll_interval_ms: 0,
            ..VideoConfig::default()
        };
        assert_eq!(video.poll_interval(), Duration::from_millis(1));
    }
}

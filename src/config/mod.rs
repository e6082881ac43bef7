//! Configuration management for the display coordinator

use crate::display::DisplayInfo;
use crate::session::VsyncLimits;
use crate::types::{DisplayId, DisplayMode, PixelFormat, VirtconMode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator limits and policies
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Panels the headless engine simulates
    #[serde(default = "default_displays")]
    pub displays: Vec<DisplayConfig>,

    /// Headless engine capabilities
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Live layers allowed across all sessions
    #[serde(default = "default_max_layers")]
    pub max_layers: usize,

    /// Unacknowledged vsyncs before a cookie is requested
    #[serde(default = "default_vsync_ack_watermark")]
    pub vsync_ack_watermark: u64,

    /// Unacknowledged vsyncs before delivery stops
    #[serde(default = "default_max_unacked_vsyncs")]
    pub max_unacked_vsyncs: u64,

    /// Vsyncs held back while delivery is stopped
    #[serde(default = "default_vsync_buffer_size")]
    pub vsync_buffer_size: usize,

    /// Initial virtual console ownership policy
    #[serde(default)]
    pub virtcon_mode: VirtconMode,
}

impl CoordinatorConfig {
    pub fn vsync_limits(&self) -> VsyncLimits {
        VsyncLimits {
            ack_watermark: self.vsync_ack_watermark,
            max_unacked: self.max_unacked_vsyncs,
            buffer_size: self.vsync_buffer_size,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_layers: default_max_layers(),
            vsync_ack_watermark: default_vsync_ack_watermark(),
            max_unacked_vsyncs: default_max_unacked_vsyncs(),
            vsync_buffer_size: default_vsync_buffer_size(),
            virtcon_mode: VirtconMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Display id reported at hotplug
    pub id: u64,

    /// Screen width in pixels
    pub width: u32,

    /// Screen height in pixels
    pub height: u32,

    /// Refresh rate in Hz
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: u32,

    #[serde(default = "default_pixel_formats")]
    pub pixel_formats: Vec<PixelFormat>,

    #[serde(default = "default_pixel_formats")]
    pub cursor_formats: Vec<PixelFormat>,
}

impl DisplayConfig {
    pub fn info(&self) -> DisplayInfo {
        DisplayInfo {
            id: DisplayId(self.id),
            modes: vec![DisplayMode {
                width: self.width,
                height: self.height,
                refresh_rate_millihertz: self.refresh_rate.saturating_mul(1000),
            }],
            pixel_formats: self.pixel_formats.clone(),
            cursor_formats: self.cursor_formats.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whether the engine can capture the composited output
    #[serde(default)]
    pub capture_supported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter, overridden by DISPLAY_COORDINATOR_LOG
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            displays: default_displays(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.coordinator.max_layers == 0 {
            return Err("max_layers must be non-zero".into());
        }

        if self.coordinator.vsync_ack_watermark == 0 {
            return Err("vsync_ack_watermark must be non-zero".into());
        }

        if self.coordinator.vsync_ack_watermark > self.coordinator.max_unacked_vsyncs {
            return Err("vsync_ack_watermark cannot exceed max_unacked_vsyncs".into());
        }

        if self.coordinator.vsync_buffer_size == 0 {
            return Err("vsync_buffer_size must be non-zero".into());
        }

        let mut ids = HashSet::new();
        for display in &self.displays {
            if display.width == 0 || display.height == 0 {
                return Err(format!("Display {} dimensions must be non-zero", display.id).into());
            }
            if display.refresh_rate == 0 {
                return Err(format!("Display {} refresh rate must be non-zero", display.id).into());
            }
            if display.pixel_formats.is_empty() {
                return Err(format!("Display {} needs at least one pixel format", display.id).into());
            }
            if !ids.insert(display.id) {
                return Err(format!("Display id {} configured twice", display.id).into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::types::VirtconMode;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.coordinator.vsync_ack_watermark, 300);
        assert_eq!(cfg.coordinator.max_unacked_vsyncs, 600);
        assert_eq!(cfg.coordinator.vsync_buffer_size, 10);
        assert_eq!(cfg.displays.len(), 1);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [coordinator]
            virtcon_mode = "fallback"

            [[displays]]
            id = 7
            width = 800
            height = 600

            [engine]
            capture_supported = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.coordinator.virtcon_mode, VirtconMode::Fallback);
        assert_eq!(cfg.coordinator.max_layers, 65536);
        assert_eq!(cfg.displays[0].refresh_rate, 60);
        assert_eq!(cfg.displays[0].info().modes[0].refresh_rate_millihertz, 60_000);
        assert!(cfg.engine.capture_supported);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_vsync_limits() {
        let mut cfg = Config::default();
        cfg.coordinator.vsync_ack_watermark = 700;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_displays() {
        let mut cfg = Config::default();
        let display = cfg.displays[0].clone();
        cfg.displays.push(display);
        assert!(cfg.validate().is_err());
    }
}

fn default_max_layers() -> usize { 65536 }
fn default_vsync_ack_watermark() -> u64 { 300 }
fn default_max_unacked_vsyncs() -> u64 { 600 }
fn default_vsync_buffer_size() -> usize { 10 }
fn default_refresh_rate() -> u32 { 60 }

fn default_pixel_formats() -> Vec<PixelFormat> {
    vec![PixelFormat::Argb8888, PixelFormat::Xrgb8888]
}

fn default_displays() -> Vec<DisplayConfig> {
    vec![DisplayConfig {
        id: 1,
        width: 1920,
        height: 1080,
        refresh_rate: default_refresh_rate(),
        pixel_formats: default_pixel_formats(),
        cursor_formats: default_pixel_formats(),
    }]
}

fn default_log_level() -> String {
    "info".to_string()
}

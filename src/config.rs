// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backends::camera::buffer_pool::PoolRequest;
use crate::backends::camera::frame_loop::{CaptureSettings, ErrorPolicy};
use crate::backends::camera::types::{PixelFormat, SnapshotLayout};
use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_BUFFER_COUNT, DEFAULT_DEVICE, DEFAULT_FPS,
    DEFAULT_HEIGHT, DEFAULT_MAX_FRAMES, DEFAULT_WIDTH, MAX_BUFFER_COUNT, MAX_DIMENSION, MAX_FPS,
    MIN_BUFFER_COUNT, frame_interval,
};
use crate::errors::{CaptureError, CaptureResult};

/// Capture settings persisted as JSON
///
/// Missing fields fall back to their defaults, so a config file only needs
/// the values that differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture device node
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Number of mmap buffers (2..=4)
    #[serde(alias = "buffers")]
    pub buffer_count: u32,
    /// Target capture rate
    pub fps: u32,
    /// Session length in frames; `null` runs until interrupted
    pub max_frames: Option<u64>,
    pub layout: SnapshotLayout,
    pub error_policy: ErrorPolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            pixel_format: PixelFormat::default(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            fps: DEFAULT_FPS,
            max_frames: Some(DEFAULT_MAX_FRAMES),
            layout: SnapshotLayout::default(),
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl CaptureConfig {
    /// `$XDG_CONFIG_HOME/camrelay/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Read and validate a config file
    pub fn load(path: &Path) -> CaptureResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CaptureError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| CaptureError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        info!(path = %path.display(), "Loaded capture configuration");
        Ok(config)
    }

    /// Load `path`, or the default location when `path` is None
    ///
    /// A missing file at the default location is not an error; an explicit
    /// path must exist.
    pub fn load_or_default(path: Option<&Path>) -> CaptureResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                debug!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Write the config as pretty-printed JSON, creating parent directories
    pub fn save(&self, path: &Path) -> CaptureResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CaptureError::Config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| CaptureError::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, text)
            .map_err(|e| CaptureError::Config(format!("cannot write {}: {}", path.display(), e)))
    }

    /// Check value ranges and the layout/format combination
    pub fn validate(&self) -> CaptureResult<()> {
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            return Err(CaptureError::InvalidConfig(format!(
                "buffer_count must be between {} and {}, got {}",
                MIN_BUFFER_COUNT, MAX_BUFFER_COUNT, self.buffer_count
            )));
        }
        if !(1..=MAX_FPS).contains(&self.fps) {
            return Err(CaptureError::InvalidConfig(format!(
                "fps must be between 1 and {}, got {}",
                MAX_FPS, self.fps
            )));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(1..=MAX_DIMENSION).contains(&value) {
                return Err(CaptureError::InvalidConfig(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_DIMENSION, value
                )));
            }
        }
        if !self.layout.supports(self.pixel_format) {
            return Err(CaptureError::InvalidConfig(format!(
                "{} layout requires a packed YUV 4:2:2 format, got {}",
                self.layout, self.pixel_format
            )));
        }
        Ok(())
    }

    pub fn pool_request(&self) -> PoolRequest {
        PoolRequest {
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            buffer_count: self.buffer_count,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            frame_interval: frame_interval(self.fps),
            max_frames: self.max_frames,
            layout: self.layout,
            error_policy: self.error_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAX_CONSECUTIVE_FAILURES;
    use std::time::Duration;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CaptureConfig = serde_json::from_str(r#"{"device": "/dev/video2"}"#).unwrap();
        assert_eq!(config.device, PathBuf::from("/dev/video2"));
        assert_eq!(config.width, DEFAULT_WIDTH);
        assert_eq!(config.pixel_format, PixelFormat::Uyvy);
        assert_eq!(config.max_frames, Some(DEFAULT_MAX_FRAMES));
    }

    #[test]
    fn test_error_policy_json() {
        let json = r#"{
            "pixel_format": "YUYV",
            "buffers": 3,
            "max_frames": null,
            "layout": "rgba",
            "error_policy": {"mode": "skip_frames", "max_consecutive": 4}
        }"#;
        let config: CaptureConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pixel_format, PixelFormat::Yuyv);
        assert_eq!(config.buffer_count, 3);
        assert_eq!(config.max_frames, None);
        assert_eq!(
            config.error_policy,
            ErrorPolicy::SkipFrames { max_consecutive: 4 }
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_skip_policy_budget_defaults() {
        let json = r#"{"error_policy": {"mode": "skip_frames"}}"#;
        let config: CaptureConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.error_policy,
            ErrorPolicy::SkipFrames {
                max_consecutive: DEFAULT_MAX_CONSECUTIVE_FAILURES
            }
        );
    }

    #[test]
    fn test_validate_ranges() {
        let bad = [
            CaptureConfig {
                buffer_count: 1,
                ..Default::default()
            },
            CaptureConfig {
                buffer_count: 5,
                ..Default::default()
            },
            CaptureConfig {
                fps: 0,
                ..Default::default()
            },
            CaptureConfig {
                width: 0,
                ..Default::default()
            },
            CaptureConfig {
                height: MAX_DIMENSION + 1,
                ..Default::default()
            },
            CaptureConfig {
                pixel_format: PixelFormat::Rgb24,
                layout: SnapshotLayout::Rgba,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(CaptureError::InvalidConfig(_))),
                "{:?} should be rejected",
                config
            );
        }
        CaptureConfig::default().validate().unwrap();
    }

    #[test]
    fn test_capture_settings_from_fps() {
        let config = CaptureConfig {
            fps: 25,
            ..Default::default()
        };
        assert_eq!(config.capture_settings().frame_interval, Duration::from_millis(40));
    }
}

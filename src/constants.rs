// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Default capture device node
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// Default capture resolution
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

/// Upper bound on either frame dimension
pub const MAX_DIMENSION: u32 = 8192;

/// Buffer pool size limits (inclusive)
pub const MIN_BUFFER_COUNT: u32 = 2;
pub const MAX_BUFFER_COUNT: u32 = 4;
pub const DEFAULT_BUFFER_COUNT: u32 = 2;

/// Capture cadence: one frame every 20 ms
pub const DEFAULT_FPS: u32 = 50;
pub const MAX_FPS: u32 = 240;

/// Default session length, about 8 minutes at the default rate
pub const DEFAULT_MAX_FRAMES: u64 = 25_000;

/// Consecutive frame failures tolerated by the skip policy when the config
/// does not say
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Log one line every this many frames
pub const FRAME_LOG_INTERVAL: u64 = 60;

/// Config file name under the user's config directory
pub const CONFIG_DIR_NAME: &str = "camrelay";
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Interval between frames for a target rate
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(fps.max(1)))
}

// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 device discovery
//!
//! Used by the `list` and `info` commands. Opening a node here never changes
//! its state; only VIDIOC_QUERYCAP is issued.

use std::path::{Path, PathBuf};

use tracing::debug;
use v4l::Device;

use super::types::DeviceCapabilities;

/// A V4L2 node and what its driver reports about it
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: PathBuf,
    /// `path` with symlinks resolved
    pub real_path: PathBuf,
    pub caps: DeviceCapabilities,
}

impl DeviceInfo {
    pub fn card(&self) -> &str {
        &self.caps.card
    }

    pub fn driver(&self) -> &str {
        &self.caps.driver
    }

    /// True if the node can be used by the buffer pool
    pub fn is_capture_device(&self) -> bool {
        self.caps.supports_capture() && self.caps.supports_streaming()
    }
}

/// Query a single node
///
/// Returns None if the node cannot be opened or does not answer
/// VIDIOC_QUERYCAP.
pub fn query_device_info(path: &Path) -> Option<DeviceInfo> {
    let device = Device::with_path(path).ok()?;
    let caps = device
        .query_caps()
        .inspect_err(|e| debug!(path = %path.display(), error = %e, "VIDIOC_QUERYCAP failed"))
        .ok()
        .map(DeviceCapabilities::from)?;

    // Get real path by resolving symlinks
    let real_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    debug!(path = %path.display(), driver = %caps.driver, card = %caps.card, "Queried V4L2 device");
    Some(DeviceInfo {
        path: path.to_path_buf(),
        real_path,
        caps,
    })
}

/// Scan `/dev/video*` for nodes that support streaming capture
///
/// Sorted by node number.
pub fn list_capture_devices() -> Vec<DeviceInfo> {
    let entries = match std::fs::read_dir("/dev") {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "Cannot read /dev");
            return Vec::new();
        }
    };

    let mut nodes: Vec<(u32, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let number = video_node_number(&name.to_string_lossy())?;
            Some((number, entry.path()))
        })
        .collect();
    nodes.sort_by_key(|(number, _)| *number);

    nodes
        .into_iter()
        .filter_map(|(_, path)| query_device_info(&path))
        .filter(DeviceInfo::is_capture_device)
        .collect()
}

/// `video12` -> 12
fn video_node_number(name: &str) -> Option<u32> {
    name.strip_prefix("video")?.parse().ok()
}

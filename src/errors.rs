// SPDX-License-Identifier: GPL-3.0-only

//! Error types for device capture and frame relaying
//!
//! Initialization errors (`DeviceUnavailable`, `UnsupportedCapability`,
//! `FormatNegotiationFailed`, `BufferAllocationFailed`) are always fatal and
//! are only returned after the device has been fully rolled back. `IoFailure`
//! is the steady-state error surfaced per call; what to do about it is up to
//! the caller.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backends::camera::types::FrameSnapshot;

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Errors raised by the buffer pool and the capture loop
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The device node could not be opened
    #[error("Cannot open capture device {}: {source}", path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The device lacks a camera input, video capture or streaming I/O
    #[error("Unsupported device capability: {0}")]
    UnsupportedCapability(String),

    /// The device rejected or altered the requested format
    #[error("Format negotiation failed: {0}")]
    FormatNegotiationFailed(String),

    /// The device granted too few buffers or a buffer could not be mapped
    #[error("Buffer allocation failed: {0}")]
    BufferAllocationFailed(String),

    /// A steady-state device operation failed
    #[error("{operation} failed: {source}")]
    IoFailure {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// Buffer checkout protocol was violated (double release, release without acquire, ...)
    #[error("Buffer protocol violation: {0}")]
    BufferProtocol(String),

    /// Requested settings are out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CaptureError {
    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        CaptureError::IoFailure { operation, source }
    }

    /// True for errors raised while constructing a pool
    pub fn is_initialization_error(&self) -> bool {
        matches!(
            self,
            CaptureError::DeviceUnavailable { .. }
                | CaptureError::UnsupportedCapability(_)
                | CaptureError::FormatNegotiationFailed(_)
                | CaptureError::BufferAllocationFailed(_)
        )
    }
}

/// Errors raised by the frame relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// The other side went away; a rejected frame is handed back to the producer
    #[error("Frame relay closed")]
    Closed(Option<FrameSnapshot>),
}

// SPDX-License-Identifier: GPL-3.0-only

//! camrelay - V4L2 mmap capture with a single-slot frame relay
//!
//! This library captures raw frames from a V4L2 device through a small pool
//! of memory-mapped buffers and hands owned copies to one consumer thread.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Capture device abstraction, buffer pool and capture loop
//! - [`relay`]: Capacity-one rendezvous between capture and consumer
//! - [`media`]: Pixel format conversion
//! - [`config`]: User configuration handling
//! - [`errors`]: Error types
//!
//! # Example
//!
//! ```ignore
//! let config = CaptureConfig::load_or_default(None)?;
//! let pool = DeviceBufferPool::initialize(V4l2Device::default(), &config.pool_request())?;
//! let (publisher, subscriber) = relay::channel();
//! let session = CaptureSession::new(
//!     pool,
//!     publisher,
//!     config.capture_settings(),
//!     CancellationToken::new(),
//! )?;
//! let mut controller = CaptureLoopController::spawn("capture", session)?;
//! while let Ok(frame) = subscriber.take() {
//!     // consume frame.data
//! }
//! controller.join();
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod media;
pub mod relay;

// Re-export commonly used types
pub use backends::camera::{
    CancellationToken, CaptureDriver, CaptureLoopController, CaptureSession, CaptureSettings,
    DeviceBufferPool, ErrorPolicy, FrameSnapshot, PixelFormat, PoolRequest, SessionExit,
    SessionSummary, SnapshotLayout, V4l2Device,
};
pub use backends::virtual_camera::{VirtualCaptureDevice, VirtualDeviceConfig};
pub use config::CaptureConfig;
pub use errors::{CaptureError, CaptureResult, RelayError};
pub use relay::{FramePublisher, FrameSubscriber, RelayCloser};

// SPDX-License-Identifier: GPL-3.0-only

//! Capture device abstraction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐        ┌─────────────────────┐
//! │   CaptureSession    │──────► │     FramePublisher  │ ──► consumer thread
//! └──────────┬──────────┘        └─────────────────────┘
//!            │ acquire / copy / release
//!            ▼
//! ┌─────────────────────┐
//! │  DeviceBufferPool   │  ← ownership tags, rollback, teardown
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ CaptureDriver Trait │  ← ioctl-level surface
//! └──────────┬──────────┘
//!       ┌────┴─────┐
//!       ▼          ▼
//!   V4l2Device  VirtualCaptureDevice
//! ```

pub mod buffer_pool;
pub mod frame_loop;
pub mod types;
pub mod v4l2_device;
pub mod v4l2_utils;

pub use buffer_pool::{AcquiredFrame, DeviceBufferPool, PoolRequest, PoolState, StopSummary};
pub use frame_loop::{
    CancellationToken, CaptureLoopController, CaptureSession, CaptureSettings, ErrorPolicy,
    SessionExit, SessionSummary,
};
pub use types::*;
pub use v4l2_device::V4l2Device;

use std::io;
use std::path::Path;

/// A device buffer mapped into the process address space
///
/// Dropping the region unmaps it.
pub trait MappedRegion: Send {
    /// The whole mapped buffer
    fn as_slice(&self) -> &[u8];
}

/// Kernel video capture driver surface
///
/// Mirrors the V4L2 calls needed for MMAP streaming. Implementations hold the
/// open handle; the [`DeviceBufferPool`] owns the implementation and is the
/// only caller.
pub trait CaptureDriver: Send {
    type Region: MappedRegion;

    // ===== Handle =====

    /// Open the device node
    fn open(&mut self, path: &Path) -> io::Result<()>;

    /// Close the device node (no-op when already closed)
    fn close(&mut self);

    fn is_open(&self) -> bool;

    // ===== Negotiation =====

    /// VIDIOC_QUERYCAP
    fn query_capabilities(&mut self) -> io::Result<DeviceCapabilities>;

    /// Enumerate input 0, check it is a camera and select it
    fn select_camera_input(&mut self) -> io::Result<()>;

    /// VIDIOC_S_FMT
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<()>;

    /// VIDIOC_G_FMT
    fn get_format(&mut self) -> io::Result<FrameFormat>;

    // ===== Buffers =====

    /// VIDIOC_REQBUFS; returns the number of buffers actually granted
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// VIDIOC_QUERYBUF
    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor>;

    /// mmap the buffer described by `descriptor`
    fn map_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<Self::Region>;

    /// VIDIOC_QBUF
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// VIDIOC_DQBUF; blocks until the device has filled a buffer
    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;

    // ===== Streaming =====

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;
}

// SPDX-License-Identifier: GPL-3.0-only

//! Virtual capture device
//!
//! An in-process stand-in for a V4L2 capture node. Buffers live on the heap
//! instead of in driver memory, and every failure a real driver can produce
//! during negotiation or streaming can be switched on through
//! [`VirtualDeviceConfig`]. Used by the test-suite and by `camrelay capture
//! --virtual` for dry runs without hardware.
//!
//! # Frame contents
//!
//! Each dequeued buffer is filled with the low byte of its driver sequence
//! number, and the first four bytes hold the full sequence (little-endian), so
//! consumers can check ordering with [`VirtualCaptureDevice::sequence_of`].
//! Row padding, when configured, holds [`ROW_PADDING_BYTE`].

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::backends::camera::types::*;
use crate::backends::camera::{CaptureDriver, MappedRegion};

/// Written into row padding so it can be told apart from pixels
pub const ROW_PADDING_BYTE: u8 = 0xEE;

/// Failure injection and behavior knobs for [`VirtualCaptureDevice`]
#[derive(Debug, Clone)]
pub struct VirtualDeviceConfig {
    /// Capability bits reported by VIDIOC_QUERYCAP
    pub capabilities: u32,
    /// Whether input 0 is a camera input
    pub has_camera_input: bool,
    /// Format the device picks regardless of the request
    pub forced_format: Option<FormatRequest>,
    /// Maximum number of buffers the device grants
    pub max_buffers: Option<u32>,
    pub fail_open: bool,
    /// mmap of this buffer index fails
    pub fail_map_at: Option<u32>,
    pub fail_stream_on: bool,
    pub fail_stream_off: bool,
    /// VIDIOC_DQBUF fails once this many frames were delivered
    pub fail_dequeue_after: Option<u64>,
    /// VIDIOC_DQBUF fails for exactly these (1-based) dequeue attempts
    pub fail_dequeue_attempts: Vec<u64>,
    /// VIDIOC_QBUF fails once this many queue calls succeeded
    pub fail_queue_after: Option<u64>,
    /// bytesused reported for every frame (defaults to the buffer length)
    pub bytes_used: Option<u32>,
    /// Extra bytes at the end of every row, reported through bytesperline
    pub row_padding: u32,
    /// Simulated exposure time per frame
    pub frame_delay: Option<Duration>,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            capabilities: V4L2_CAP_VIDEO_CAPTURE | V4L2_CAP_STREAMING,
            has_camera_input: true,
            forced_format: None,
            max_buffers: None,
            fail_open: false,
            fail_map_at: None,
            fail_stream_on: false,
            fail_stream_off: false,
            fail_dequeue_after: None,
            fail_dequeue_attempts: Vec::new(),
            fail_queue_after: None,
            bytes_used: None,
            row_padding: 0,
            frame_delay: None,
        }
    }
}

#[derive(Default)]
struct StatsInner {
    open: AtomicBool,
    opens: AtomicU32,
    closes: AtomicU32,
    streaming: AtomicBool,
    live_mappings: AtomicUsize,
    total_mappings: AtomicUsize,
    queued: AtomicU64,
    dequeued: AtomicU64,
}

/// Counters shared with a [`VirtualCaptureDevice`]
///
/// Stays readable after the device has been moved into a pool.
#[derive(Clone, Default)]
pub struct VirtualDeviceStats {
    inner: Arc<StatsInner>,
}

impl VirtualDeviceStats {
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u32 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    /// Buffers currently mapped
    pub fn live_mappings(&self) -> usize {
        self.inner.live_mappings.load(Ordering::SeqCst)
    }

    /// Buffers mapped over the device's lifetime
    pub fn total_mappings(&self) -> usize {
        self.inner.total_mappings.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> u64 {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn dequeued(&self) -> u64 {
        self.inner.dequeued.load(Ordering::SeqCst)
    }
}

/// Heap memory standing in for a driver buffer
///
/// Written by the device only while the buffer is queued; the pool's
/// ownership tags guarantee no slice into it is alive at that point.
struct SharedBuffer {
    bytes: UnsafeCell<Box<[u8]>>,
}

unsafe impl Sync for SharedBuffer {}
unsafe impl Send for SharedBuffer {}

impl SharedBuffer {
    fn new(len: usize) -> Self {
        Self {
            bytes: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    /// SAFETY: caller must ensure no `as_slice` view of this buffer is alive
    unsafe fn fill(&self, sequence: u32, format: &FrameFormat) {
        let bytes = unsafe { &mut *self.bytes.get() };
        bytes.fill(sequence as u8);
        if let (Some(row), Some(stride)) = (format.row_bytes(), format.stride())
            && stride > row
        {
            for line in bytes.chunks_mut(stride) {
                if let Some(padding) = line.get_mut(row..) {
                    padding.fill(ROW_PADDING_BYTE);
                }
            }
        }
        let header = sequence.to_le_bytes();
        let n = header.len().min(bytes.len());
        bytes[..n].copy_from_slice(&header[..n]);
    }

    fn len(&self) -> usize {
        unsafe { (*self.bytes.get()).len() }
    }
}

/// Mapping of one virtual buffer
pub struct VirtualRegion {
    buffer: Arc<SharedBuffer>,
    stats: VirtualDeviceStats,
}

impl MappedRegion for VirtualRegion {
    fn as_slice(&self) -> &[u8] {
        unsafe { &*self.buffer.bytes.get() }
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        self.stats.inner.live_mappings.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process capture device
pub struct VirtualCaptureDevice {
    config: VirtualDeviceConfig,
    stats: VirtualDeviceStats,
    open: bool,
    streaming: bool,
    format: FrameFormat,
    buffers: Vec<Arc<SharedBuffer>>,
    queue: VecDeque<u32>,
    sequence: u32,
    dequeue_attempts: u64,
    queue_calls: u64,
}

impl VirtualCaptureDevice {
    pub fn new(config: VirtualDeviceConfig) -> Self {
        let format = frame_format(
            &FormatRequest {
                width: crate::constants::DEFAULT_WIDTH,
                height: crate::constants::DEFAULT_HEIGHT,
                pixel_format: PixelFormat::Uyvy,
            },
            config.row_padding,
        );
        Self {
            config,
            stats: VirtualDeviceStats::default(),
            open: false,
            streaming: false,
            format,
            buffers: Vec::new(),
            queue: VecDeque::new(),
            sequence: 0,
            dequeue_attempts: 0,
            queue_calls: 0,
        }
    }

    /// Handle to the shared counters
    pub fn stats(&self) -> VirtualDeviceStats {
        self.stats.clone()
    }

    /// Driver sequence number stamped into a frame produced by this device
    pub fn sequence_of(frame: &[u8]) -> Option<u32> {
        let header: [u8; 4] = frame.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(header))
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "device is not open"))
        }
    }
}

fn frame_format(request: &FormatRequest, row_padding: u32) -> FrameFormat {
    let bpp = request.pixel_format.bytes_per_pixel() as u32;
    let bytes_per_line = request.width * bpp + row_padding;
    FrameFormat {
        width: request.width,
        height: request.height,
        fourcc: request.pixel_format.as_u32(),
        bytes_per_line,
        size_image: bytes_per_line * request.height,
    }
}

fn einval(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

impl CaptureDriver for VirtualCaptureDevice {
    type Region = VirtualRegion;

    fn open(&mut self, path: &Path) -> io::Result<()> {
        if self.config.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such device: {}", path.display()),
            ));
        }
        debug!(path = %path.display(), "Opened virtual capture device");
        self.open = true;
        self.stats.inner.open.store(true, Ordering::SeqCst);
        self.stats.inner.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.streaming = false;
        self.queue.clear();
        self.buffers.clear();
        self.stats.inner.open.store(false, Ordering::SeqCst);
        self.stats.inner.streaming.store(false, Ordering::SeqCst);
        self.stats.inner.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn query_capabilities(&mut self) -> io::Result<DeviceCapabilities> {
        self.ensure_open()?;
        Ok(DeviceCapabilities {
            driver: "camrelay-virtual".to_string(),
            card: "Virtual Camera".to_string(),
            bus_info: "platform:virtual".to_string(),
            capabilities: self.config.capabilities,
            device_caps: 0,
        })
    }

    fn select_camera_input(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        if self.config.has_camera_input {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "input 0 is not a camera input",
            ))
        }
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<()> {
        self.ensure_open()?;
        if self.streaming || !self.buffers.is_empty() {
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "buffers allocated"));
        }
        let chosen = self.config.forced_format.unwrap_or(*request);
        self.format = frame_format(&chosen, self.config.row_padding);
        Ok(())
    }

    fn get_format(&mut self) -> io::Result<FrameFormat> {
        self.ensure_open()?;
        Ok(self.format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.ensure_open()?;
        if self.streaming {
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "device is streaming"));
        }

        self.queue.clear();
        self.buffers.clear();
        if count == 0 {
            return Ok(0);
        }

        let granted = self.config.max_buffers.map_or(count, |max| count.min(max));
        let len = self.format.size_image as usize;
        self.buffers = (0..granted)
            .map(|_| Arc::new(SharedBuffer::new(len)))
            .collect();
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        self.ensure_open()?;
        let buffer = self
            .buffers
            .get(index as usize)
            .ok_or_else(|| einval(format!("no buffer {}", index)))?;
        Ok(BufferDescriptor {
            index,
            offset: index * self.format.size_image,
            length: buffer.len() as u32,
        })
    }

    fn map_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<VirtualRegion> {
        self.ensure_open()?;
        if self.config.fail_map_at == Some(descriptor.index) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let buffer = self
            .buffers
            .get(descriptor.index as usize)
            .cloned()
            .ok_or_else(|| einval(format!("no buffer {}", descriptor.index)))?;

        self.stats.inner.live_mappings.fetch_add(1, Ordering::SeqCst);
        self.stats.inner.total_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(VirtualRegion {
            buffer,
            stats: self.stats.clone(),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        self.ensure_open()?;
        if let Some(limit) = self.config.fail_queue_after
            && self.queue_calls >= limit
        {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if index as usize >= self.buffers.len() {
            return Err(einval(format!("no buffer {}", index)));
        }
        if self.queue.contains(&index) {
            return Err(einval(format!("buffer {} already queued", index)));
        }

        self.queue.push_back(index);
        self.queue_calls += 1;
        self.stats.inner.queued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        self.ensure_open()?;
        if !self.streaming {
            return Err(einval("device is not streaming"));
        }

        self.dequeue_attempts += 1;
        if self.config.fail_dequeue_attempts.contains(&self.dequeue_attempts) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if let Some(limit) = self.config.fail_dequeue_after
            && self.stats.dequeued() >= limit
        {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }

        if let Some(delay) = self.config.frame_delay {
            std::thread::sleep(delay);
        }

        let index = self
            .queue
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no buffer queued"))?;

        self.sequence = self.sequence.wrapping_add(1);
        let buffer = &self.buffers[index as usize];
        // SAFETY: the buffer was queued until now, so the pool holds no view of it
        unsafe { buffer.fill(self.sequence, &self.format) };
        self.stats.inner.dequeued.fetch_add(1, Ordering::SeqCst);

        let bytes_used = self
            .config
            .bytes_used
            .unwrap_or(buffer.len() as u32)
            .min(buffer.len() as u32);
        Ok(DequeuedBuffer {
            index,
            bytes_used,
            sequence: self.sequence,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        if self.config.fail_stream_on {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        self.streaming = true;
        self.stats.inner.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        if self.config.fail_stream_off {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.streaming = false;
        self.queue.clear();
        self.stats.inner.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }
}

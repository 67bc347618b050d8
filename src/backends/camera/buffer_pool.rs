// SPDX-License-Identifier: GPL-3.0-only

//! Device buffer pool
//!
//! Owns the capture device handle and a fixed set of memory-mapped frame
//! buffers. Every buffer carries an explicit ownership tag:
//!
//! - `DriverOwned`: queued in the driver, the device may write it at any time
//! - `UserOwned`: dequeued and checked out to the caller
//!
//! At most one buffer is `UserOwned` at a time. The pool checks the protocol
//! itself and reports violations as [`CaptureError::BufferProtocol`] instead of
//! trusting the caller.
//!
//! Construction is all-or-nothing: if any step of [`DeviceBufferPool::initialize`]
//! fails, every mapped buffer is unmapped and the handle is closed before the
//! error is returned.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::types::*;
use super::{CaptureDriver, MappedRegion};
use crate::constants::{MAX_BUFFER_COUNT, MIN_BUFFER_COUNT};
use crate::errors::{CaptureError, CaptureResult};

/// Parameters for opening a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRequest {
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub buffer_count: u32,
}

impl PoolRequest {
    fn format(&self) -> FormatRequest {
        FormatRequest {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
        }
    }
}

/// Lifecycle state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Buffers mapped and queued, device not streaming yet
    Ready,
    /// Device is streaming
    Streaming,
    /// Buffers unmapped and handle closed
    Stopped,
}

/// Outcome of tearing a pool down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopSummary {
    /// VIDIOC_STREAMOFF failed; teardown continued regardless
    pub stream_off_failed: bool,
    /// Number of buffers unmapped
    pub unmapped_buffers: usize,
}

/// A buffer checked out by [`DeviceBufferPool::acquire_frame`]
///
/// The view borrows the pool, so it cannot outlive the matching
/// [`DeviceBufferPool::release_frame`].
#[derive(Debug)]
pub struct AcquiredFrame<'a> {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
    pub data: &'a [u8],
}

struct BufferSlot<R> {
    index: u32,
    region: R,
    ownership: BufferOwnership,
}

/// Fixed set of memory-mapped capture buffers on one device
pub struct DeviceBufferPool<D: CaptureDriver> {
    driver: D,
    path: PathBuf,
    format: FrameFormat,
    pixel_format: PixelFormat,
    slots: Vec<BufferSlot<D::Region>>,
    checked_out: Option<u32>,
    state: PoolState,
}

impl<D: CaptureDriver> DeviceBufferPool<D> {
    /// Open the device, negotiate the format and map `buffer_count` buffers
    ///
    /// All buffers start `DriverOwned` (queued). On any failure the device is
    /// rolled back completely and no pool is returned.
    pub fn initialize(mut driver: D, request: &PoolRequest) -> CaptureResult<Self> {
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&request.buffer_count) {
            return Err(CaptureError::InvalidConfig(format!(
                "buffer count {} outside {}..={}",
                request.buffer_count, MIN_BUFFER_COUNT, MAX_BUFFER_COUNT
            )));
        }

        info!(
            device = %request.device.display(),
            width = request.width,
            height = request.height,
            pixel_format = %request.pixel_format,
            buffers = request.buffer_count,
            "Opening capture device"
        );

        driver
            .open(&request.device)
            .map_err(|source| CaptureError::DeviceUnavailable {
                path: request.device.clone(),
                source,
            })?;

        // Slots mapped so far are dropped (unmapped) when setup returns early,
        // before the handle is closed below.
        match Self::setup(&mut driver, request) {
            Ok((format, slots)) => {
                info!(
                    device = %request.device.display(),
                    format = %format,
                    buffers = slots.len(),
                    "Capture device initialized"
                );
                Ok(Self {
                    driver,
                    path: request.device.clone(),
                    format,
                    pixel_format: request.pixel_format,
                    slots,
                    checked_out: None,
                    state: PoolState::Ready,
                })
            }
            Err(e) => {
                warn!(
                    device = %request.device.display(),
                    error = %e,
                    "Capture device initialization failed"
                );
                release_driver_buffers(&mut driver);
                driver.close();
                Err(e)
            }
        }
    }

    fn setup(
        driver: &mut D,
        request: &PoolRequest,
    ) -> CaptureResult<(FrameFormat, Vec<BufferSlot<D::Region>>)> {
        debug!("Selecting camera input");
        driver.select_camera_input().map_err(|e| {
            CaptureError::UnsupportedCapability(format!("no usable camera input: {}", e))
        })?;

        debug!("Querying device capabilities");
        let caps = driver.query_capabilities().map_err(|e| {
            CaptureError::UnsupportedCapability(format!("capability query failed: {}", e))
        })?;
        debug!(
            driver = %caps.driver,
            card = %caps.card,
            bus = %caps.bus_info,
            "Device capabilities"
        );

        if !caps.supports_capture() {
            return Err(CaptureError::UnsupportedCapability(format!(
                "{} does not support video capture",
                caps.card
            )));
        }
        if !caps.supports_streaming() {
            return Err(CaptureError::UnsupportedCapability(format!(
                "{} does not support streaming I/O",
                caps.card
            )));
        }

        let format = negotiate_format(driver, &request.format())?;

        let granted = driver.request_buffers(request.buffer_count).map_err(|e| {
            CaptureError::BufferAllocationFailed(format!("VIDIOC_REQBUFS failed: {}", e))
        })?;
        if granted == 0 || granted < request.buffer_count {
            return Err(CaptureError::BufferAllocationFailed(format!(
                "requested {} buffers, device granted {}",
                request.buffer_count, granted
            )));
        }

        let mut slots = Vec::with_capacity(request.buffer_count as usize);
        for index in 0..request.buffer_count {
            let descriptor = driver.query_buffer(index).map_err(|e| {
                CaptureError::BufferAllocationFailed(format!(
                    "query of buffer {} failed: {}",
                    index, e
                ))
            })?;
            if descriptor.length == 0 {
                return Err(CaptureError::BufferAllocationFailed(format!(
                    "buffer {} has zero length",
                    index
                )));
            }

            let region = driver.map_buffer(&descriptor).map_err(|e| {
                CaptureError::BufferAllocationFailed(format!(
                    "mmap of buffer {} failed: {}",
                    index, e
                ))
            })?;
            // Keep the mapping tracked before queueing so a queue failure still unmaps it
            slots.push(BufferSlot {
                index,
                region,
                ownership: BufferOwnership::UserOwned,
            });

            driver.queue_buffer(index).map_err(|e| {
                CaptureError::BufferAllocationFailed(format!(
                    "queue of buffer {} failed: {}",
                    index, e
                ))
            })?;
            if let Some(slot) = slots.last_mut() {
                slot.ownership = BufferOwnership::DriverOwned;
            }

            debug!(
                index,
                offset = descriptor.offset,
                length = descriptor.length,
                "Mapped capture buffer"
            );
        }

        Ok((format, slots))
    }

    /// Start streaming
    ///
    /// On failure the pool is torn down (buffers unmapped, handle closed) and
    /// the error is returned without retrying.
    pub fn start(&mut self) -> CaptureResult<()> {
        if self.state != PoolState::Ready {
            return Err(CaptureError::BufferProtocol(format!(
                "start() called on a pool in state {:?}",
                self.state
            )));
        }

        if let Err(e) = self.driver.stream_on() {
            warn!(
                device = %self.path.display(),
                error = %e,
                "VIDIOC_STREAMON failed, closing device"
            );
            self.teardown(false);
            return Err(CaptureError::io("VIDIOC_STREAMON", e));
        }

        info!(device = %self.path.display(), "Capture streaming started");
        self.state = PoolState::Streaming;
        Ok(())
    }

    /// Block until the device fills a buffer and check it out
    ///
    /// Only one buffer may be checked out at a time. A buffer the driver
    /// returns out of turn is re-queued and reported as `BufferProtocol`;
    /// the pool stays usable.
    pub fn acquire_frame(&mut self) -> CaptureResult<AcquiredFrame<'_>> {
        if self.state != PoolState::Streaming {
            return Err(CaptureError::BufferProtocol(format!(
                "acquire_frame() called on a pool in state {:?}",
                self.state
            )));
        }
        if let Some(index) = self.checked_out {
            return Err(CaptureError::BufferProtocol(format!(
                "buffer {} is still checked out",
                index
            )));
        }

        let dequeued = self
            .driver
            .dequeue_buffer()
            .map_err(|e| CaptureError::io("VIDIOC_DQBUF", e))?;

        let expected = self
            .slots
            .get(dequeued.index as usize)
            .is_some_and(|slot| slot.ownership == BufferOwnership::DriverOwned);
        if !expected {
            return Err(self.requeue_stray(dequeued.index));
        }

        let slot = &mut self.slots[dequeued.index as usize];
        slot.ownership = BufferOwnership::UserOwned;
        self.checked_out = Some(slot.index);

        let mapped = slot.region.as_slice();
        // Some drivers leave bytesused at zero for fixed-size formats
        let bytes_used = match dequeued.bytes_used as usize {
            0 => mapped.len(),
            n => n.min(mapped.len()),
        };

        Ok(AcquiredFrame {
            index: slot.index,
            bytes_used,
            sequence: dequeued.sequence,
            data: &mapped[..bytes_used],
        })
    }

    /// Hand a dequeued buffer the pool does not expect straight back to the
    /// driver, so it stays in rotation
    ///
    /// Nothing is checked out afterwards. If the re-queue itself fails the
    /// driver has one buffer fewer to fill.
    fn requeue_stray(&mut self, index: u32) -> CaptureError {
        let detail = match self.ownership(index) {
            Some(_) => "which is not queued",
            None => "which the pool does not know",
        };

        match self.driver.queue_buffer(index) {
            Ok(()) => {
                if let Some(slot) = self.slots.get_mut(index as usize) {
                    slot.ownership = BufferOwnership::DriverOwned;
                }
                warn!(index, "Driver returned an unexpected buffer, re-queued it");
            }
            Err(e) => {
                warn!(
                    index,
                    error = %e,
                    "Could not re-queue unexpected buffer, it is out of rotation"
                );
            }
        }

        CaptureError::BufferProtocol(format!("driver returned buffer {} {}", index, detail))
    }

    /// Give a checked-out buffer back to the driver
    ///
    /// `index` must be the buffer returned by the last `acquire_frame`. If the
    /// re-queue fails the buffer stays checked out so the call can be retried.
    pub fn release_frame(&mut self, index: u32) -> CaptureResult<()> {
        match self.checked_out {
            Some(current) if current == index => {}
            Some(current) => {
                return Err(CaptureError::BufferProtocol(format!(
                    "release of buffer {} but buffer {} is checked out",
                    index, current
                )));
            }
            None => {
                let detail = match self.ownership(index) {
                    Some(_) => "release without matching acquire (double release?)",
                    None => "release of unknown buffer",
                };
                return Err(CaptureError::BufferProtocol(format!(
                    "buffer {}: {}",
                    index, detail
                )));
            }
        }

        self.driver
            .queue_buffer(index)
            .map_err(|e| CaptureError::io("VIDIOC_QBUF", e))?;

        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.ownership = BufferOwnership::DriverOwned;
        }
        self.checked_out = None;
        Ok(())
    }

    /// Stop streaming, unmap every buffer and close the handle
    ///
    /// A failing VIDIOC_STREAMOFF is logged and reported in the summary but
    /// does not stop the teardown.
    pub fn stop(mut self) -> StopSummary {
        self.teardown(true)
    }

    fn teardown(&mut self, stream_off: bool) -> StopSummary {
        if self.state == PoolState::Stopped {
            return StopSummary::default();
        }

        let mut summary = StopSummary::default();
        if stream_off && self.state == PoolState::Streaming {
            if let Err(e) = self.driver.stream_off() {
                warn!(
                    device = %self.path.display(),
                    error = %e,
                    "VIDIOC_STREAMOFF failed, releasing buffers anyway"
                );
                summary.stream_off_failed = true;
            }
        }

        if let Some(index) = self.checked_out.take() {
            debug!(index, "Unmapping buffer that was still checked out");
        }

        summary.unmapped_buffers = self.slots.len();
        self.slots.clear();
        release_driver_buffers(&mut self.driver);
        self.driver.close();
        self.state = PoolState::Stopped;

        info!(
            device = %self.path.display(),
            unmapped = summary.unmapped_buffers,
            "Capture device closed"
        );
        summary
    }

    // ===== Observers =====

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn device_path(&self) -> &Path {
        &self.path
    }

    /// Negotiated device format
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Packed frame size for the negotiated format
    pub fn frame_size(&self) -> usize {
        self.format.width as usize
            * self.format.height as usize
            * self.pixel_format.bytes_per_pixel()
    }

    pub fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    pub fn ownership(&self, index: u32) -> Option<BufferOwnership> {
        self.slots.get(index as usize).map(|s| s.ownership)
    }

    /// Ownership tag of every buffer, indexed by buffer index
    pub fn ownership_table(&self) -> Vec<BufferOwnership> {
        self.slots.iter().map(|s| s.ownership).collect()
    }

    /// Index of the buffer currently checked out, if any
    pub fn checked_out(&self) -> Option<u32> {
        self.checked_out
    }
}

impl<D: CaptureDriver> Drop for DeviceBufferPool<D> {
    fn drop(&mut self) {
        if self.state != PoolState::Stopped {
            warn!(
                device = %self.path.display(),
                "DeviceBufferPool dropped without stop(), tearing down"
            );
            self.teardown(true);
        }
    }
}

/// Set the format, then read back what the device actually chose
fn negotiate_format<D: CaptureDriver>(
    driver: &mut D,
    request: &FormatRequest,
) -> CaptureResult<FrameFormat> {
    debug!(
        width = request.width,
        height = request.height,
        pixel_format = %request.pixel_format,
        "Setting capture format"
    );
    driver.set_format(request).map_err(|e| {
        CaptureError::FormatNegotiationFailed(format!(
            "device rejected {}x{} {}: {}",
            request.width, request.height, request.pixel_format, e
        ))
    })?;

    let format = driver.get_format().map_err(|e| {
        CaptureError::FormatNegotiationFailed(format!("could not read back format: {}", e))
    })?;
    debug!(
        width = format.width,
        height = format.height,
        bytes_per_line = format.bytes_per_line,
        size_image = format.size_image,
        "Negotiated capture format"
    );

    if format.width != request.width
        || format.height != request.height
        || format.fourcc != request.pixel_format.as_u32()
    {
        return Err(CaptureError::FormatNegotiationFailed(format!(
            "requested {}x{} {}, device chose {}",
            request.width, request.height, request.pixel_format, format
        )));
    }

    // The FourCC matched above, so the row geometry is known
    let (Some(row), Some(stride), Some(needed)) =
        (format.row_bytes(), format.stride(), format.min_image_size())
    else {
        return Err(CaptureError::FormatNegotiationFailed(format!(
            "unknown pixel format in {}",
            format
        )));
    };
    if stride < row {
        return Err(CaptureError::FormatNegotiationFailed(format!(
            "device row stride {} is shorter than a {} byte row",
            stride, row
        )));
    }
    if (format.size_image as usize) < needed {
        return Err(CaptureError::FormatNegotiationFailed(format!(
            "device frame size {} is smaller than {} bytes",
            format.size_image, needed
        )));
    }
    if stride != row {
        debug!(stride, row, "Device pads rows, snapshots will be repacked");
    }

    Ok(format)
}

/// Free driver-side buffers; only valid once every mapping is gone
fn release_driver_buffers<D: CaptureDriver>(driver: &mut D) {
    if !driver.is_open() {
        return;
    }
    if let Err(e) = driver.request_buffers(0) {
        debug!(error = %e, "Releasing driver buffers failed");
    }
}

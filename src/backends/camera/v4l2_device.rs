// SPDX-License-Identifier: GPL-3.0-only

//! Kernel V4L2 capture device
//!
//! Capabilities and format negotiation go through `v4l::Device` and its
//! [`Capture`] trait. Buffer management uses the crate's ioctl and mmap
//! wrappers directly: `v4l::io::mmap::Stream` re-queues buffers on its own,
//! which would take ownership tracking away from the buffer pool.

use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::ptr::{self, NonNull};

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::format::FieldOrder;
use v4l::memory::Memory;
use v4l::v4l_sys::{V4L2_INPUT_TYPE_CAMERA, v4l2_buffer, v4l2_input, v4l2_requestbuffers};
use v4l::v4l2::{self, vidioc};
use v4l::video::Capture;
use v4l::{Capabilities, Device, Format};

use super::types::*;
use super::{CaptureDriver, MappedRegion};

/// Issue an ioctl that `v4l::Device` has no typed wrapper for
fn xioctl<T>(device: &Device, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    unsafe { v4l2::ioctl(device.handle().fd(), request, arg as *mut T as *mut c_void) }
}

impl From<Capabilities> for DeviceCapabilities {
    fn from(caps: Capabilities) -> Self {
        // v4l already reports the opened node's set (device_caps)
        Self {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            capabilities: caps.capabilities.bits(),
            device_caps: 0,
        }
    }
}

/// Extract a null-terminated string from a fixed-size byte array
fn extract_name(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).to_string()
}

/// Memory-mapped device buffer, unmapped on drop
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain shared memory; access is serialized by the pool's
// ownership tags.
unsafe impl Send for MmapRegion {}

impl MappedRegion for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast(), self.len) } {
            warn!(len = self.len, error = %e, "munmap of capture buffer failed");
        }
    }
}

/// V4L2 device node opened for MMAP streaming
#[derive(Default)]
pub struct V4l2Device {
    device: Option<Device>,
}

impl V4l2Device {
    pub fn new() -> Self {
        Self::default()
    }

    fn device(&self) -> io::Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device is not open"))
    }

    fn capture_buffer(index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        }
    }

    fn set_streaming(&mut self, request: vidioc::_IOC_TYPE) -> io::Result<()> {
        let device = self.device()?;
        let mut buf_type = Type::VideoCapture as u32;
        xioctl(device, request, &mut buf_type)
    }
}

impl CaptureDriver for V4l2Device {
    type Region = MmapRegion;

    fn open(&mut self, path: &Path) -> io::Result<()> {
        let device = Device::with_path(path)?;
        debug!(path = %path.display(), fd = device.handle().fd(), "Opened V4L2 device");
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            debug!(fd = device.handle().fd(), "Closing V4L2 device");
        }
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn query_capabilities(&mut self) -> io::Result<DeviceCapabilities> {
        Ok(self.device()?.query_caps()?.into())
    }

    fn select_camera_input(&mut self) -> io::Result<()> {
        let device = self.device()?;

        let mut input = v4l2_input {
            index: 0,
            ..unsafe { mem::zeroed() }
        };
        xioctl(device, vidioc::VIDIOC_ENUMINPUT, &mut input)?;

        if input.type_ != V4L2_INPUT_TYPE_CAMERA {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!(
                    "input 0 ({}) is not a camera input (type {})",
                    extract_name(&input.name),
                    input.type_
                ),
            ));
        }

        let mut index: c_int = 0;
        xioctl(device, vidioc::VIDIOC_S_INPUT, &mut index)
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<()> {
        let format = Format {
            field_order: FieldOrder::Progressive,
            ..Format::new(request.width, request.height, request.pixel_format.fourcc())
        };
        let chosen = self.device()?.set_format(&format)?;
        debug!(
            width = chosen.width,
            height = chosen.height,
            fourcc = %chosen.fourcc,
            "VIDIOC_S_FMT answered"
        );
        Ok(())
    }

    fn get_format(&mut self) -> io::Result<FrameFormat> {
        let format = self.device()?.format()?;
        Ok(FrameFormat {
            width: format.width,
            height: format.height,
            fourcc: format.fourcc.into(),
            bytes_per_line: format.stride,
            size_image: format.size,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let device = self.device()?;

        let mut request = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        xioctl(device, vidioc::VIDIOC_REQBUFS, &mut request)?;
        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        let device = self.device()?;

        let mut buf = Self::capture_buffer(index);
        xioctl(device, vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferDescriptor {
            index: buf.index,
            offset: unsafe { buf.m.offset },
            length: buf.length,
        })
    }

    fn map_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<MmapRegion> {
        let device = self.device()?;
        let len = descriptor.length as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("buffer {} has zero length", descriptor.index),
            ));
        }

        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                device.handle().fd(),
                descriptor.offset as libc::off_t,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(MmapRegion { ptr, len })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let device = self.device()?;
        let mut buf = Self::capture_buffer(index);
        xioctl(device, vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let device = self.device()?;
        let mut buf = Self::capture_buffer(0);

        // v4l opens nodes non-blocking; wait for a filled buffer first
        loop {
            let ready = device
                .handle()
                .poll(libc::POLLIN, -1)
                .and_then(|_| xioctl(device, vidioc::VIDIOC_DQBUF, &mut buf));
            match ready {
                Ok(()) => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.set_streaming(vidioc::VIDIOC_STREAMON)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.set_streaming(vidioc::VIDIOC_STREAMOFF)
    }
}

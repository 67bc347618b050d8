// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the device buffer pool against the virtual device

use camrelay::backends::camera::types::{
    BufferDescriptor, BufferOwnership, DequeuedBuffer, DeviceCapabilities, FormatRequest,
    FrameFormat, V4L2_CAP_STREAMING, V4L2_CAP_VIDEO_CAPTURE,
};
use camrelay::backends::camera::{PoolRequest, PoolState};
use camrelay::backends::virtual_camera::{ROW_PADDING_BYTE, VirtualRegion};
use camrelay::{
    CaptureDriver, CaptureError, DeviceBufferPool, PixelFormat, VirtualCaptureDevice,
    VirtualDeviceConfig,
};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

fn request(width: u32, height: u32, buffer_count: u32) -> PoolRequest {
    PoolRequest {
        device: PathBuf::from("/dev/video-virtual"),
        width,
        height,
        pixel_format: PixelFormat::Uyvy,
        buffer_count,
    }
}

fn assert_partition(pool: &DeviceBufferPool<VirtualCaptureDevice>) {
    let table = pool.ownership_table();
    let user_owned: Vec<usize> = table
        .iter()
        .enumerate()
        .filter(|(_, o)| **o == BufferOwnership::UserOwned)
        .map(|(i, _)| i)
        .collect();
    assert!(user_owned.len() <= 1, "more than one buffer checked out: {:?}", table);
    assert_eq!(
        user_owned.first().map(|i| *i as u32),
        pool.checked_out(),
        "checked-out index disagrees with ownership tags"
    );
}

#[test]
fn test_hundred_frames_keep_ownership_invariant() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig::default());
    let stats = device.stats();
    let mut pool = DeviceBufferPool::initialize(device, &request(640, 480, 2)).unwrap();
    pool.start().unwrap();
    assert_eq!(pool.state(), PoolState::Streaming);

    let mut last_sequence = 0;
    for _ in 0..100 {
        assert_partition(&pool);
        let frame = pool.acquire_frame().unwrap();
        let (index, sequence) = (frame.index, frame.sequence);
        assert_eq!(frame.bytes_used, 640 * 480 * 2);
        assert_eq!(VirtualCaptureDevice::sequence_of(frame.data), Some(sequence));
        assert!(sequence > last_sequence);
        last_sequence = sequence;

        assert_partition(&pool);
        pool.release_frame(index).unwrap();
    }
    assert_partition(&pool);
    assert_eq!(stats.dequeued(), 100);

    let summary = pool.stop();
    assert!(!summary.stream_off_failed);
    assert_eq!(summary.unmapped_buffers, 2);
    assert_eq!(stats.live_mappings(), 0);
    assert!(!stats.is_open());
}

#[test]
fn test_init_and_stop_leave_no_mappings() {
    for buffers in 2..=4 {
        let device = VirtualCaptureDevice::new(VirtualDeviceConfig::default());
        let stats = device.stats();
        let mut pool = DeviceBufferPool::initialize(device, &request(320, 240, buffers)).unwrap();
        assert_eq!(pool.buffer_count(), buffers as usize);
        assert_eq!(stats.live_mappings(), buffers as usize);

        pool.start().unwrap();
        let index = pool.acquire_frame().unwrap().index;
        pool.release_frame(index).unwrap();
        pool.stop();

        assert_eq!(stats.live_mappings(), 0, "leaked mappings with {} buffers", buffers);
        assert_eq!(stats.total_mappings(), buffers as usize);
        assert_eq!(stats.opens(), 1);
        assert_eq!(stats.closes(), 1);
        assert!(!stats.is_open());
        assert!(!stats.is_streaming());
    }
}

#[test]
fn test_stop_with_buffer_checked_out() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig::default());
    let stats = device.stats();
    let mut pool = DeviceBufferPool::initialize(device, &request(64, 48, 3)).unwrap();
    pool.start().unwrap();
    let _ = pool.acquire_frame().unwrap().index;

    let summary = pool.stop();
    assert_eq!(summary.unmapped_buffers, 3);
    assert_eq!(stats.live_mappings(), 0);
    assert!(!stats.is_open());
}

#[test]
fn test_missing_capture_capability() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        capabilities: V4L2_CAP_STREAMING,
        ..Default::default()
    });
    let stats = device.stats();
    let err = DeviceBufferPool::initialize(device, &request(640, 480, 2))
        .err()
        .unwrap();

    assert!(matches!(err, CaptureError::UnsupportedCapability(_)), "{err}");
    assert!(err.is_initialization_error());
    assert_eq!(stats.opens(), 1);
    assert!(!stats.is_open());
    assert_eq!(stats.total_mappings(), 0);
}

#[test]
fn test_missing_streaming_capability() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        capabilities: V4L2_CAP_VIDEO_CAPTURE,
        ..Default::default()
    });
    let stats = device.stats();
    let err = DeviceBufferPool::initialize(device, &request(640, 480, 2))
        .err()
        .unwrap();
    assert!(matches!(err, CaptureError::UnsupportedCapability(_)));
    assert!(!stats.is_open());
}

#[test]
fn test_no_camera_input() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        has_camera_input: false,
        ..Default::default()
    });
    let stats = device.stats();
    let err = DeviceBufferPool::initialize(device, &request(640, 480, 2))
        .err()
        .unwrap();
    assert!(matches!(err, CaptureError::UnsupportedCapability(_)));
    assert!(!stats.is_open());
}

#[test]
fn test_open_failure() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        fail_open: true,
        ..Default::default()
    });
    let stats = device.stats();
    let err = DeviceBufferPool::initialize(device, &request(640, 480, 2))
        .err()
        .unwrap();
    match err {
        CaptureError::DeviceUnavailable { path, .. } => {
            assert_eq!(path, PathBuf::from("/dev/video-virtual"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(stats.opens(), 0);
}

#[test]
fn test_short_buffer_grant() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        max_buffers: Some(1),
        ..Default::default()
    });
    let stats = device.stats();
    let err = DeviceBufferPool::initialize(device, &request(640, 480, 2))
        .err()
        .unwrap();

    assert!(matches!(err, CaptureError::BufferAllocationFailed(_)), "{err}");
    assert_eq!(stats.live_mappings(), 0);
    assert!(!stats.is_open());
}

#[test]
fn test_mmap_failure_unmaps_earlier_buffers() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        fail_map_at: Some(2),
        ..Default::default()
    });
    let stats = device.stats();
    let err = DeviceBufferPool::initialize(device, &request(64, 48, 4))
        .err()
        .unwrap();

    assert!(matches!(err, CaptureError::BufferAllocationFailed(_)));
    // Buffers 0 and 1 were mapped before the failure
    assert_eq!(stats.total_mappings(), 2);
    assert_eq!(stats.live_mappings(), 0);
    assert!(!stats.is_open());
}

#[test]
fn test_altered_format_is_rejected() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        forced_format: Some(FormatRequest {
            width: 320,
            height: 240,
            pixel_format: PixelFormat::Uyvy,
        }),
        ..Default::default()
    });
    let stats = device.stats();
    let err = DeviceBufferPool::initialize(device, &request(640, 480, 2))
        .err()
        .unwrap();

    let message = err.to_string();
    assert!(matches!(err, CaptureError::FormatNegotiationFailed(_)));
    assert!(message.contains("640x480"), "{message}");
    assert!(message.contains("320x240"), "{message}");
    assert!(!stats.is_open());
}

#[test]
fn test_substituted_pixel_format_is_rejected() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        forced_format: Some(FormatRequest {
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Yuyv,
        }),
        ..Default::default()
    });
    let err = DeviceBufferPool::initialize(device, &request(640, 480, 2))
        .err()
        .unwrap();
    assert!(matches!(err, CaptureError::FormatNegotiationFailed(_)));
}

#[test]
fn test_stream_on_failure_closes_device() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        fail_stream_on: true,
        ..Default::default()
    });
    let stats = device.stats();
    let mut pool = DeviceBufferPool::initialize(device, &request(64, 48, 2)).unwrap();

    let err = pool.start().unwrap_err();
    assert!(matches!(err, CaptureError::IoFailure { operation: "VIDIOC_STREAMON", .. }));
    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(stats.live_mappings(), 0);
    assert!(!stats.is_open());

    // Nothing left to release
    assert_eq!(pool.stop().unmapped_buffers, 0);
    assert_eq!(stats.closes(), 1);
}

#[test]
fn test_stream_off_failure_still_releases() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        fail_stream_off: true,
        ..Default::default()
    });
    let stats = device.stats();
    let mut pool = DeviceBufferPool::initialize(device, &request(64, 48, 2)).unwrap();
    pool.start().unwrap();

    let summary = pool.stop();
    assert!(summary.stream_off_failed);
    assert_eq!(summary.unmapped_buffers, 2);
    assert_eq!(stats.live_mappings(), 0);
    assert!(!stats.is_open());
}

#[test]
fn test_failed_requeue_keeps_buffer_checked_out() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        // Two queue calls during initialization, the third is the release
        fail_queue_after: Some(2),
        ..Default::default()
    });
    let mut pool = DeviceBufferPool::initialize(device, &request(64, 48, 2)).unwrap();
    pool.start().unwrap();

    let index = pool.acquire_frame().unwrap().index;
    let err = pool.release_frame(index).unwrap_err();
    assert!(matches!(err, CaptureError::IoFailure { operation: "VIDIOC_QBUF", .. }));
    assert_eq!(pool.checked_out(), Some(index));
    assert_eq!(pool.ownership(index), Some(BufferOwnership::UserOwned));
    pool.stop();
}

#[test]
fn test_dequeue_failure_is_io_failure() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        fail_dequeue_after: Some(1),
        ..Default::default()
    });
    let mut pool = DeviceBufferPool::initialize(device, &request(64, 48, 2)).unwrap();
    pool.start().unwrap();

    let index = pool.acquire_frame().unwrap().index;
    pool.release_frame(index).unwrap();
    let err = pool.acquire_frame().err().unwrap();
    assert!(matches!(err, CaptureError::IoFailure { operation: "VIDIOC_DQBUF", .. }));
    assert!(!err.is_initialization_error());
    // The failed dequeue did not check anything out
    assert_eq!(pool.checked_out(), None);
    pool.stop();
}

#[test]
fn test_zero_bytes_used_means_whole_buffer() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        bytes_used: Some(0),
        ..Default::default()
    });
    let mut pool = DeviceBufferPool::initialize(device, &request(64, 48, 2)).unwrap();
    pool.start().unwrap();
    let frame = pool.acquire_frame().unwrap();
    assert_eq!(frame.data.len(), 64 * 48 * 2);
    let index = frame.index;
    pool.release_frame(index).unwrap();
    pool.stop();
}

#[test]
fn test_padded_rows_are_accepted() {
    let device = VirtualCaptureDevice::new(VirtualDeviceConfig {
        row_padding: 32,
        ..Default::default()
    });
    let mut pool = DeviceBufferPool::initialize(device, &request(64, 48, 2)).unwrap();
    assert_eq!(pool.format().bytes_per_line, 64 * 2 + 32);
    // Packed size, not the padded buffer size
    assert_eq!(pool.frame_size(), 64 * 48 * 2);
    pool.start().unwrap();

    let frame = pool.acquire_frame().unwrap();
    assert_eq!(frame.data.len(), (64 * 2 + 32) * 48);
    assert_eq!(frame.data[64 * 2], ROW_PADDING_BYTE);
    let index = frame.index;
    pool.release_frame(index).unwrap();
    pool.stop();
}

/// Driver misbehavior layered over the virtual device
#[derive(Debug, Clone, Copy)]
enum Quirk {
    /// bytesperline is reported shorter than one row of pixels
    NarrowStride,
    /// The nth dequeue reports its buffer under an index the pool never mapped
    StrayIndexAt(u64),
}

const STRAY_OFFSET: u32 = 100;

struct QuirkyDevice {
    inner: VirtualCaptureDevice,
    quirk: Quirk,
    dequeues: u64,
}

impl QuirkyDevice {
    fn new(inner: VirtualCaptureDevice, quirk: Quirk) -> Self {
        Self {
            inner,
            quirk,
            dequeues: 0,
        }
    }
}

impl CaptureDriver for QuirkyDevice {
    type Region = VirtualRegion;

    fn open(&mut self, path: &Path) -> io::Result<()> {
        self.inner.open(path)
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn query_capabilities(&mut self) -> io::Result<DeviceCapabilities> {
        self.inner.query_capabilities()
    }

    fn select_camera_input(&mut self) -> io::Result<()> {
        self.inner.select_camera_input()
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<()> {
        self.inner.set_format(request)
    }

    fn get_format(&mut self) -> io::Result<FrameFormat> {
        let mut format = self.inner.get_format()?;
        if let Quirk::NarrowStride = self.quirk {
            format.bytes_per_line -= 2;
        }
        Ok(format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.inner.request_buffers(count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        self.inner.query_buffer(index)
    }

    fn map_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<VirtualRegion> {
        self.inner.map_buffer(descriptor)
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        self.inner.queue_buffer(index % STRAY_OFFSET)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buffer = self.inner.dequeue_buffer()?;
        self.dequeues += 1;
        if let Quirk::StrayIndexAt(n) = self.quirk
            && n == self.dequeues
        {
            buffer.index += STRAY_OFFSET;
        }
        Ok(buffer)
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.inner.stream_on()
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.inner.stream_off()
    }
}

#[test]
fn test_stride_shorter_than_row_is_rejected() {
    let inner = VirtualCaptureDevice::new(VirtualDeviceConfig::default());
    let stats = inner.stats();
    let device = QuirkyDevice::new(inner, Quirk::NarrowStride);
    let err = DeviceBufferPool::initialize(device, &request(64, 48, 2))
        .err()
        .unwrap();

    assert!(matches!(err, CaptureError::FormatNegotiationFailed(_)), "{err}");
    assert!(err.to_string().contains("stride"), "{err}");
    assert_eq!(stats.total_mappings(), 0);
    assert!(!stats.is_open());
}

#[test]
fn test_stray_buffer_is_requeued() {
    let inner = VirtualCaptureDevice::new(VirtualDeviceConfig::default());
    let stats = inner.stats();
    let device = QuirkyDevice::new(inner, Quirk::StrayIndexAt(3));
    let mut pool = DeviceBufferPool::initialize(device, &request(64, 48, 2)).unwrap();
    pool.start().unwrap();

    for _ in 0..2 {
        let index = pool.acquire_frame().unwrap().index;
        pool.release_frame(index).unwrap();
    }

    let err = pool.acquire_frame().err().unwrap();
    assert!(matches!(err, CaptureError::BufferProtocol(_)), "{err}");
    assert_eq!(pool.checked_out(), None);
    assert_eq!(pool.ownership_table(), vec![BufferOwnership::DriverOwned; 2]);

    // Both buffers are still in rotation
    let mut seen = HashSet::new();
    for _ in 0..4 {
        let index = pool.acquire_frame().unwrap().index;
        seen.insert(index);
        pool.release_frame(index).unwrap();
    }
    assert_eq!(seen.len(), 2);
    // Initial queue, two releases, the stray buffer, four more releases
    assert_eq!(stats.queued(), 2 + 2 + 1 + 4);
    pool.stop();
}

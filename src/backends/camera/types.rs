// SPDX-License-Identifier: GPL-3.0-only
// Shared types for the capture device abstraction

//! Shared types for capture backends

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use v4l::FourCC;

/// V4L2 capability flag for single-planar video capture
pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
/// V4L2 capability flag for streaming I/O (mmap/userptr/dmabuf)
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
/// Set when `device_caps` is filled in by the driver
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

/// Pixel formats the pool knows how to size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, U0 Y0 V0 Y1
    #[default]
    Uyvy,
    /// Packed YUV 4:2:2, Y0 U0 Y1 V0
    Yuyv,
    /// 8-bit greyscale
    Grey,
    /// 24-bit RGB
    Rgb24,
    /// 32-bit RGBX
    Rgb32,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 5] = [
        PixelFormat::Uyvy,
        PixelFormat::Yuyv,
        PixelFormat::Grey,
        PixelFormat::Rgb24,
        PixelFormat::Rgb32,
    ];

    /// V4L2 FourCC code for this format
    pub fn fourcc(&self) -> FourCC {
        match self {
            PixelFormat::Uyvy => FourCC::new(b"UYVY"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Grey => FourCC::new(b"GREY"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Rgb32 => FourCC::new(b"RGB4"),
        }
    }

    /// Look up a format by its FourCC
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == fourcc)
    }

    /// Raw `pixelformat` value as passed through the V4L2 ioctls
    pub fn as_u32(&self) -> u32 {
        u32::from(self.fourcc())
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::from_fourcc(FourCC::from(raw))
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Uyvy | PixelFormat::Yuyv => 2,
            PixelFormat::Grey => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgb32 => 4,
        }
    }

    /// True for the packed 4:2:2 formats that can be expanded to RGBA
    pub fn is_packed_yuv422(&self) -> bool {
        matches!(self, PixelFormat::Uyvy | PixelFormat::Yuyv)
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fourcc())
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let format = match upper.as_str() {
            "UYVY" => PixelFormat::Uyvy,
            "YUYV" | "YUY2" => PixelFormat::Yuyv,
            "GREY" | "GRAY" | "Y8" => PixelFormat::Grey,
            "RGB3" | "RGB24" => PixelFormat::Rgb24,
            "RGB4" | "RGB32" => PixelFormat::Rgb32,
            other => return Err(format!("unknown pixel format '{}'", other)),
        };
        Ok(format)
    }
}

/// Format requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// Format as reported back by the device after negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    /// Raw FourCC; may name a format this crate does not know
    pub fourcc: u32,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl FrameFormat {
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_u32(self.fourcc)
    }

    /// Tightly packed frame size (`width * height * bytes_per_pixel`)
    pub fn packed_frame_size(&self) -> Option<usize> {
        self.pixel_format()
            .map(|pf| self.width as usize * self.height as usize * pf.bytes_per_pixel())
    }

    /// Pixel bytes in one row, without padding
    pub fn row_bytes(&self) -> Option<usize> {
        self.pixel_format()
            .map(|pf| self.width as usize * pf.bytes_per_pixel())
    }

    /// Distance in bytes between the starts of two rows
    ///
    /// A driver that leaves `bytesperline` at zero packs its rows.
    pub fn stride(&self) -> Option<usize> {
        let row = self.row_bytes()?;
        Some(match self.bytes_per_line {
            0 => row,
            n => n as usize,
        })
    }

    /// Smallest buffer that holds every row at this stride
    pub fn min_image_size(&self) -> Option<usize> {
        let row = self.row_bytes()?;
        let stride = self.stride()?;
        Some(match self.height as usize {
            0 => 0,
            h => stride * (h - 1) + row,
        })
    }
}

impl std::fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} {}",
            self.width,
            self.height,
            FourCC::from(self.fourcc)
        )
    }
}

/// Device capabilities from VIDIOC_QUERYCAP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capabilities: u32,
    pub device_caps: u32,
}

impl DeviceCapabilities {
    /// Capabilities of the opened node (falls back to the physical device set)
    pub fn effective(&self) -> u32 {
        if self.capabilities & V4L2_CAP_DEVICE_CAPS != 0 && self.device_caps != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }

    pub fn supports_capture(&self) -> bool {
        self.effective() & V4L2_CAP_VIDEO_CAPTURE != 0
    }

    pub fn supports_streaming(&self) -> bool {
        self.effective() & V4L2_CAP_STREAMING != 0
    }
}

/// Location of one device buffer inside the device's mmap space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// A buffer handed back by VIDIOC_DQBUF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
}

/// Who may touch a buffer's memory right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwnership {
    /// Queued in the driver, may be written by the device at any time
    DriverOwned,
    /// Dequeued and checked out to the application
    UserOwned,
}

/// Pixel layout of the bytes handed to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotLayout {
    /// Bytes exactly as the device produced them
    #[default]
    Native,
    /// Packed 4:2:2 expanded to 8-bit RGBA
    Rgba,
}

impl SnapshotLayout {
    /// Bytes per pixel in a snapshot taken from a device delivering `source`
    pub fn bytes_per_pixel(&self, source: PixelFormat) -> usize {
        match self {
            SnapshotLayout::Native => source.bytes_per_pixel(),
            SnapshotLayout::Rgba => 4,
        }
    }

    /// Whether frames in `source` format can be delivered in this layout
    pub fn supports(&self, source: PixelFormat) -> bool {
        match self {
            SnapshotLayout::Native => true,
            SnapshotLayout::Rgba => source.is_packed_yuv422(),
        }
    }
}

impl std::fmt::Display for SnapshotLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotLayout::Native => write!(f, "native"),
            SnapshotLayout::Rgba => write!(f, "rgba"),
        }
    }
}

impl std::str::FromStr for SnapshotLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "raw" => Ok(SnapshotLayout::Native),
            "rgba" => Ok(SnapshotLayout::Rgba),
            other => Err(format!("unknown snapshot layout '{}' (expected native or rgba)", other)),
        }
    }
}

/// An owned copy of one captured frame
///
/// Buffer memory may be overwritten as soon as the buffer goes back to the
/// driver, so frames always leave the pool as snapshots.
#[derive(Clone)]
pub struct FrameSnapshot {
    pub width: u32,
    pub height: u32,
    /// Format the device delivered
    pub pixel_format: PixelFormat,
    pub layout: SnapshotLayout,
    /// Fixed-size pixel data
    pub data: Arc<[u8]>,
    /// Capture loop frame counter (starts at 1)
    pub frame_number: u64,
    /// Driver sequence number
    pub sequence: u32,
    pub captured_at: Instant,
}

impl FrameSnapshot {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for FrameSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSnapshot")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("layout", &self.layout)
            .field("bytes", &self.data.len())
            .field("frame_number", &self.frame_number)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl AsRef<[u8]> for FrameSnapshot {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_roundtrip_through_raw_value() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_u32(format.as_u32()), Some(format));
        }
        // 'U' 'Y' 'V' 'Y' little-endian
        assert_eq!(PixelFormat::Uyvy.as_u32(), 0x5956_5955);
    }

    #[test]
    fn test_parse_pixel_format() {
        assert_eq!("uyvy".parse::<PixelFormat>(), Ok(PixelFormat::Uyvy));
        assert_eq!("YUY2".parse::<PixelFormat>(), Ok(PixelFormat::Yuyv));
        assert!("MJPG".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_device_caps_preferred_when_flagged() {
        let caps = DeviceCapabilities {
            capabilities: V4L2_CAP_VIDEO_CAPTURE | V4L2_CAP_STREAMING | V4L2_CAP_DEVICE_CAPS,
            device_caps: V4L2_CAP_STREAMING,
            ..Default::default()
        };
        assert!(!caps.supports_capture());
        assert!(caps.supports_streaming());

        let legacy = DeviceCapabilities {
            capabilities: V4L2_CAP_VIDEO_CAPTURE | V4L2_CAP_STREAMING,
            device_caps: 0,
            ..Default::default()
        };
        assert!(legacy.supports_capture());
    }

    #[test]
    fn test_packed_frame_size() {
        let format = FrameFormat {
            width: 640,
            height: 480,
            fourcc: PixelFormat::Uyvy.as_u32(),
            bytes_per_line: 1280,
            size_image: 614_400,
        };
        assert_eq!(format.packed_frame_size(), Some(614_400));
        assert_eq!(format.to_string(), "640x480 UYVY");
        assert_eq!(format.stride(), Some(1280));
        assert_eq!(format.min_image_size(), Some(614_400));
    }

    #[test]
    fn test_padded_stride() {
        let padded = FrameFormat {
            width: 8,
            height: 4,
            fourcc: PixelFormat::Yuyv.as_u32(),
            bytes_per_line: 48,
            size_image: 192,
        };
        assert_eq!(padded.row_bytes(), Some(16));
        assert_eq!(padded.stride(), Some(48));
        // The last row needs no padding after it
        assert_eq!(padded.min_image_size(), Some(48 * 3 + 16));

        let unreported = FrameFormat {
            bytes_per_line: 0,
            ..padded
        };
        assert_eq!(unreported.stride(), Some(16));
    }

    #[test]
    fn test_rgba_layout_only_for_packed_yuv() {
        assert!(SnapshotLayout::Rgba.supports(PixelFormat::Uyvy));
        assert!(SnapshotLayout::Rgba.supports(PixelFormat::Yuyv));
        assert!(!SnapshotLayout::Rgba.supports(PixelFormat::Grey));
        assert_eq!(SnapshotLayout::Rgba.bytes_per_pixel(PixelFormat::Uyvy), 4);
        assert_eq!(SnapshotLayout::Native.bytes_per_pixel(PixelFormat::Uyvy), 2);
        assert_eq!("RGBA".parse::<SnapshotLayout>(), Ok(SnapshotLayout::Rgba));
    }
}

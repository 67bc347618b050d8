// SPDX-License-Identifier: GPL-3.0-only

//! CPU conversion from packed YUV 4:2:2 to RGBA
//!
//! Each 4-byte macropixel carries two luma samples sharing one chroma pair.
//! Colors are converted with BT.601 coefficients; alpha is always 255.

/// Byte order of a packed 4:2:2 macropixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Yuv422Order {
    /// U0 Y0 V0 Y1
    Uyvy,
    /// Y0 U0 Y1 V0
    Yuyv,
}

impl Yuv422Order {
    /// Split a macropixel into (y0, y1, u, v)
    #[inline]
    fn unpack(self, chunk: &[u8]) -> (u8, u8, u8, u8) {
        match self {
            Yuv422Order::Uyvy => (chunk[1], chunk[3], chunk[0], chunk[2]),
            Yuv422Order::Yuyv => (chunk[0], chunk[2], chunk[1], chunk[3]),
        }
    }
}

#[inline]
fn yuv_to_rgba(y: f32, u: f32, v: f32) -> [u8; 4] {
    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    [r, g, b, 255]
}

/// Convert packed 4:2:2 `src` into RGBA `dst`
///
/// Converts as many whole macropixels as both buffers allow and returns the
/// number of RGBA bytes written. Bytes of `dst` past that point are left
/// untouched.
pub fn yuv422_to_rgba_into(src: &[u8], order: Yuv422Order, dst: &mut [u8]) -> usize {
    let mut written = 0;
    for (chunk, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(8)) {
        let (y0, y1, u, v) = order.unpack(chunk);
        let u = u as f32 - 128.0;
        let v = v as f32 - 128.0;
        out[..4].copy_from_slice(&yuv_to_rgba(y0 as f32, u, v));
        out[4..].copy_from_slice(&yuv_to_rgba(y1 as f32, u, v));
        written += 8;
    }
    written
}

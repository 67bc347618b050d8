// SPDX-License-Identifier: GPL-3.0-only

//! Pixel format conversions

pub mod conversions;

pub use conversions::{Yuv422Order, yuv422_to_rgba_into};

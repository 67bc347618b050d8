// SPDX-License-Identifier: GPL-3.0-only

//! Media processing utilities
//!
//! # Color Space Conversion
//!
//! Capture devices deliver packed YUV 4:2:2 (UYVY or YUYV). Consumers that
//! expect RGBA get it through the CPU converters in [`formats::conversions`].

pub mod formats;

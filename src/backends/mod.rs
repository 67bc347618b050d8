// SPDX-License-Identifier: GPL-3.0-only

//! Backend abstraction layer for frame capture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          CaptureSession / CLI               │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                  │
//! │  ┌──────────────────┐ ┌──────────────────┐  │
//! │  │     Camera       │ │  Virtual Camera  │  │
//! │  │   (V4L2 mmap)    │ │   (in-memory)    │  │
//! │  └──────────────────┘ └──────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`camera`]: Driver trait, V4L2 device, buffer pool and capture loop
//! - [`virtual_camera`]: In-memory capture device used for dry runs and tests

pub mod camera;
pub mod virtual_camera;

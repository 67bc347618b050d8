// SPDX-License-Identifier: GPL-3.0-only
//! Capture session and its thread lifecycle
//!
//! A [`CaptureSession`] drives a [`DeviceBufferPool`] at a fixed cadence:
//! acquire a frame, copy it into an owned [`FrameSnapshot`], release the
//! buffer back to the driver, then publish the snapshot through the relay.
//! The pool is stopped exactly once when the session ends, whatever the
//! reason.
//!
//! [`CaptureLoopController`] runs a session on its own thread and gives the
//! owner a way to stop it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::CaptureDriver;
use super::buffer_pool::{DeviceBufferPool, StopSummary};
use super::types::{FrameFormat, FrameSnapshot, PixelFormat, SnapshotLayout};
use crate::constants::{
    DEFAULT_FPS, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_MAX_FRAMES, FRAME_LOG_INTERVAL,
    frame_interval,
};
use crate::errors::{CaptureError, CaptureResult, RelayError};
use crate::media::formats::{Yuv422Order, yuv422_to_rgba_into};
use crate::relay::{FramePublisher, RelayCloser};

/// Cooperative stop flag shared between a session and its owner
///
/// Checked only at the top of each iteration; a blocked dequeue or publish is
/// not interrupted by it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What the session does when a device call fails mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// End the session on the first failure
    #[default]
    Terminate,
    /// Drop the frame and keep going, up to `max_consecutive` failures in a row
    SkipFrames {
        #[serde(default = "default_max_consecutive")]
        max_consecutive: u32,
    },
}

fn default_max_consecutive() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}

/// Session tuning
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    /// Target time between the start of two iterations
    pub frame_interval: Duration,
    /// Iteration budget; `None` runs until cancelled
    pub max_frames: Option<u64>,
    pub layout: SnapshotLayout,
    pub error_policy: ErrorPolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_interval: frame_interval(DEFAULT_FPS),
            max_frames: Some(DEFAULT_MAX_FRAMES),
            layout: SnapshotLayout::Native,
            error_policy: ErrorPolicy::Terminate,
        }
    }
}

/// Why a session ended without a device failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// The iteration budget was used up
    Completed,
    /// The cancellation token was set
    Cancelled,
    /// The relay was closed by the consumer or a supervisor
    ConsumerDisconnected,
}

/// Result of a session that ended cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames_published: u64,
    /// Frames dropped under [`ErrorPolicy::SkipFrames`]
    pub frames_skipped: u64,
    pub exit: SessionExit,
    pub stop: StopSummary,
}

/// One capture run: a pool, the producer side of a relay and the loop settings
pub struct CaptureSession<D: CaptureDriver> {
    pool: DeviceBufferPool<D>,
    publisher: FramePublisher,
    settings: CaptureSettings,
    token: CancellationToken,
}

impl<D: CaptureDriver> CaptureSession<D> {
    /// Bind a ready pool to a relay
    ///
    /// Fails with `InvalidConfig` if the layout cannot be produced from the
    /// pool's pixel format; the pool is stopped before returning.
    pub fn new(
        pool: DeviceBufferPool<D>,
        publisher: FramePublisher,
        settings: CaptureSettings,
        token: CancellationToken,
    ) -> CaptureResult<Self> {
        let pixel_format = pool.pixel_format();
        if !settings.layout.supports(pixel_format) {
            pool.stop();
            return Err(CaptureError::InvalidConfig(format!(
                "{} snapshots cannot be produced from {} frames",
                settings.layout, pixel_format
            )));
        }

        Ok(Self {
            pool,
            publisher,
            settings,
            token,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn relay_closer(&self) -> RelayCloser {
        self.publisher.closer()
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Size in bytes of every snapshot this session publishes
    pub fn snapshot_size(&self) -> usize {
        let format = self.pool.format();
        format.width as usize
            * format.height as usize
            * self.settings.layout.bytes_per_pixel(self.pool.pixel_format())
    }

    /// Start streaming and capture until the budget, a cancel, a closed relay
    /// or a device failure ends the session
    ///
    /// The pool is stopped on every path. Device failures are returned as
    /// `Err` after the stop; the relay is closed when this returns, so the
    /// consumer sees [`RelayError::Closed`] once it has drained the last frame.
    pub fn run(self) -> CaptureResult<SessionSummary> {
        let snapshot_size = self.snapshot_size();
        let CaptureSession {
            mut pool,
            publisher,
            settings,
            token,
        } = self;

        let outcome = match pool.start() {
            Ok(()) => {
                let mut state = LoopState::new(snapshot_size);
                let result = state.run(&mut pool, &publisher, &settings, &token);
                result.map(|exit| (state, exit))
            }
            Err(e) => Err(e),
        };

        let stop = pool.stop();
        drop(publisher);

        match outcome {
            Ok((state, exit)) => {
                info!(
                    published = state.published,
                    skipped = state.skipped,
                    exit = ?exit,
                    stream_off_failed = stop.stream_off_failed,
                    "Capture session finished"
                );
                Ok(SessionSummary {
                    frames_published: state.published,
                    frames_skipped: state.skipped,
                    exit,
                    stop,
                })
            }
            Err(e) => {
                error!(error = %e, "Capture session failed");
                Err(e)
            }
        }
    }
}

struct LoopState {
    snapshot_size: usize,
    iterations: u64,
    published: u64,
    skipped: u64,
    consecutive_failures: u32,
    short_frames: u64,
}

impl LoopState {
    fn new(snapshot_size: usize) -> Self {
        Self {
            snapshot_size,
            iterations: 0,
            published: 0,
            skipped: 0,
            consecutive_failures: 0,
            short_frames: 0,
        }
    }

    fn run<D: CaptureDriver>(
        &mut self,
        pool: &mut DeviceBufferPool<D>,
        publisher: &FramePublisher,
        settings: &CaptureSettings,
        token: &CancellationToken,
    ) -> CaptureResult<SessionExit> {
        loop {
            if token.is_cancelled() {
                debug!(iterations = self.iterations, "Cancellation observed");
                return Ok(SessionExit::Cancelled);
            }
            if let Some(max) = settings.max_frames
                && self.iterations >= max
            {
                return Ok(SessionExit::Completed);
            }

            let started = Instant::now();
            self.iterations += 1;

            match self.capture_one(pool, settings.layout) {
                Ok(snapshot) => {
                    self.consecutive_failures = 0;
                    if let Err(RelayError::Closed(_)) = publisher.publish(snapshot) {
                        info!(published = self.published, "Frame relay closed, ending session");
                        return Ok(SessionExit::ConsumerDisconnected);
                    }
                    self.published += 1;
                    if self.published % FRAME_LOG_INTERVAL == 0 {
                        debug!(frame = self.published, "Published frame");
                    }
                }
                Err(e) => self.absorb(e, settings.error_policy)?,
            }

            if let Some(rest) = settings.frame_interval.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    /// Apply the error policy to a failed iteration
    fn absorb(&mut self, e: CaptureError, policy: ErrorPolicy) -> CaptureResult<()> {
        let ErrorPolicy::SkipFrames { max_consecutive } = policy else {
            return Err(e);
        };
        if !matches!(e, CaptureError::IoFailure { .. }) {
            return Err(e);
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures > max_consecutive {
            warn!(
                failures = self.consecutive_failures,
                "Too many consecutive capture failures"
            );
            return Err(e);
        }

        self.skipped += 1;
        warn!(
            error = %e,
            failures = self.consecutive_failures,
            skipped = self.skipped,
            "Skipping frame"
        );
        Ok(())
    }

    fn capture_one<D: CaptureDriver>(
        &mut self,
        pool: &mut DeviceBufferPool<D>,
        layout: SnapshotLayout,
    ) -> CaptureResult<FrameSnapshot> {
        // A previous re-queue failed; the buffer is still ours
        if let Some(index) = pool.checked_out() {
            pool.release_frame(index)?;
        }

        let format = pool.format();
        let pixel_format = pool.pixel_format();
        let rows = RowLayout::new(&format, pixel_format, layout);
        let mut data = vec![0u8; self.snapshot_size];

        let frame = pool.acquire_frame()?;
        let (index, sequence) = (frame.index, frame.sequence);
        let copied = copy_frame(frame.data, rows, pixel_format, layout, &mut data);
        let bytes_used = frame.bytes_used;
        pool.release_frame(index)?;

        if copied < data.len() {
            self.short_frames += 1;
            if self.short_frames == 1 || self.short_frames % FRAME_LOG_INTERVAL == 0 {
                warn!(
                    index,
                    bytes_used,
                    expected = data.len(),
                    short_frames = self.short_frames,
                    "Short frame, padding with zeros"
                );
            }
        }

        Ok(FrameSnapshot {
            width: format.width,
            height: format.height,
            pixel_format,
            layout,
            data: Arc::from(data),
            frame_number: self.iterations,
            sequence,
            captured_at: Instant::now(),
        })
    }
}

/// Row geometry of a device buffer and of the snapshot built from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowLayout {
    /// Start-to-start distance of two rows in the device buffer
    src_stride: usize,
    /// Pixel bytes of one device row
    src_row: usize,
    /// Bytes of one snapshot row
    dst_row: usize,
}

impl RowLayout {
    fn new(format: &FrameFormat, pixel_format: PixelFormat, layout: SnapshotLayout) -> Self {
        let width = format.width as usize;
        let src_row = width * pixel_format.bytes_per_pixel();
        Self {
            src_stride: (format.bytes_per_line as usize).max(src_row),
            src_row,
            dst_row: width * layout.bytes_per_pixel(pixel_format),
        }
    }

    fn is_packed(&self) -> bool {
        self.src_stride == self.src_row
    }
}

/// Copy or convert `src` into `dst`, dropping any row padding
///
/// Returns how many bytes of `dst` were filled.
fn copy_frame(
    src: &[u8],
    rows: RowLayout,
    pixel_format: PixelFormat,
    layout: SnapshotLayout,
    dst: &mut [u8],
) -> usize {
    if rows.is_packed() {
        return copy_pixels(src, pixel_format, layout, dst);
    }
    if rows.dst_row == 0 {
        return 0;
    }

    let mut filled = 0;
    for (line, out) in src.chunks(rows.src_stride).zip(dst.chunks_mut(rows.dst_row)) {
        let pixels = &line[..line.len().min(rows.src_row)];
        let n = copy_pixels(pixels, pixel_format, layout, out);
        filled += n;
        if n < out.len() {
            break;
        }
    }
    filled
}

fn copy_pixels(
    src: &[u8],
    pixel_format: PixelFormat,
    layout: SnapshotLayout,
    dst: &mut [u8],
) -> usize {
    match (layout, pixel_format) {
        (SnapshotLayout::Rgba, PixelFormat::Uyvy) => {
            yuv422_to_rgba_into(src, Yuv422Order::Uyvy, dst)
        }
        (SnapshotLayout::Rgba, PixelFormat::Yuyv) => {
            yuv422_to_rgba_into(src, Yuv422Order::Yuyv, dst)
        }
        _ => {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            n
        }
    }
}

/// Controller for a capture session running in a separate thread
///
/// # Example
///
/// ```ignore
/// let (publisher, subscriber) = relay::channel();
/// let session = CaptureSession::new(pool, publisher, settings, CancellationToken::new())?;
/// let mut controller = CaptureLoopController::spawn("capture", session)?;
///
/// while let Ok(frame) = subscriber.take() {
///     consume(frame);
/// }
/// let outcome = controller.join();
/// ```
pub struct CaptureLoopController {
    thread_handle: Option<JoinHandle<CaptureResult<SessionSummary>>>,
    token: CancellationToken,
    closer: RelayCloser,
    name: String,
}

impl CaptureLoopController {
    /// Run `session` on a new named thread
    pub fn spawn<D>(name: &str, session: CaptureSession<D>) -> CaptureResult<Self>
    where
        D: CaptureDriver + 'static,
    {
        let token = session.cancellation_token();
        let closer = session.relay_closer();
        let name_clone = name.to_string();

        info!(name = %name, "Starting capture loop");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Capture loop thread started");
                let result = session.run();
                info!(name = %name_clone, "Capture loop thread exiting");
                result
            })
            .map_err(|e| CaptureError::io("spawn capture thread", e))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            token,
            closer,
            name: name.to_string(),
        })
    }

    /// Check if the loop is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal the loop to stop at its next iteration boundary (non-blocking)
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting capture loop stop");
        self.token.cancel();
    }

    /// Cancel, close the relay so a blocked publish returns, and wait
    ///
    /// Returns `None` if the session was already joined.
    pub fn stop(&mut self) -> Option<CaptureResult<SessionSummary>> {
        self.request_stop();
        self.closer.close();
        self.join()
    }

    /// Wait for the session to end on its own
    ///
    /// Returns `None` if it was already joined or the thread panicked.
    pub fn join(&mut self) -> Option<CaptureResult<SessionSummary>> {
        let handle = self.thread_handle.take()?;
        debug!(name = %self.name, "Waiting for capture loop thread to finish");
        match handle.join() {
            Ok(result) => {
                debug!(name = %self.name, "Capture loop thread finished");
                Some(result)
            }
            Err(e) => {
                warn!(name = %self.name, "Capture loop thread panicked: {:?}", e);
                None
            }
        }
    }
}

impl Drop for CaptureLoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "CaptureLoopController dropped, stopping loop");
            self.stop();
        }
    }
}

// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Listing capture devices
//! - Inspecting a single device
//! - Running a capture session with a stand-in consumer

use camrelay::backends::camera::types::{
    V4L2_CAP_DEVICE_CAPS, V4L2_CAP_STREAMING, V4L2_CAP_VIDEO_CAPTURE,
};
use camrelay::backends::camera::v4l2_utils::{list_capture_devices, query_device_info};
use camrelay::constants::FRAME_LOG_INTERVAL;
use camrelay::relay::{self, FrameSubscriber};
use camrelay::{
    CancellationToken, CaptureConfig, CaptureDriver, CaptureLoopController, CaptureSession,
    DeviceBufferPool, V4l2Device, VirtualCaptureDevice, VirtualDeviceConfig,
};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;
use tracing::{info, warn};

use crate::CaptureArgs;

/// List all V4L2 capture devices
pub fn list_devices() -> Result<(), Box<dyn std::error::Error>> {
    let devices = list_capture_devices();

    if devices.is_empty() {
        println!("No capture devices found.");
        return Ok(());
    }

    println!("Available capture devices:");
    println!();
    for device in &devices {
        println!("  {}  {} ({})", device.path.display(), device.card(), device.driver());
    }

    Ok(())
}

/// Print what the driver reports for one node
pub fn show_info(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let info = query_device_info(path)
        .ok_or_else(|| format!("{} is not a V4L2 device or cannot be opened", path.display()))?;

    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    let caps = &info.caps;

    println!("Device:     {}", info.path.display());
    if info.real_path != info.path {
        println!("Resolves:   {}", info.real_path.display());
    }
    println!("Card:       {}", caps.card);
    println!("Driver:     {}", caps.driver);
    println!("Bus:        {}", caps.bus_info);
    println!("Caps:       0x{:08x}", caps.capabilities);
    if caps.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
        println!("Node caps:  0x{:08x}", caps.device_caps);
    }
    println!(
        "Capture:    {}",
        yes_no(caps.effective() & V4L2_CAP_VIDEO_CAPTURE != 0)
    );
    println!(
        "Streaming:  {}",
        yes_no(caps.effective() & V4L2_CAP_STREAMING != 0)
    );

    Ok(())
}

/// Run a capture session until its frame budget, Ctrl+C or a device failure
pub fn run_capture(args: CaptureArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;

    // Set up Ctrl+C handler
    let token = CancellationToken::new();
    let token_clone = token.clone();
    ctrlc::set_handler(move || {
        token_clone.cancel();
    })?;

    if args.use_virtual {
        let device = VirtualCaptureDevice::new(VirtualDeviceConfig::default());
        capture_with(device, &config, token, args.output)
    } else {
        capture_with(V4l2Device::default(), &config, token, args.output)
    }
}

/// Config file first, then command-line overrides
fn resolve_config(args: &CaptureArgs) -> Result<CaptureConfig, Box<dyn std::error::Error>> {
    let mut config = CaptureConfig::load_or_default(args.config.as_deref())?;

    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(height) = args.height {
        config.height = height;
    }
    if let Some(format) = args.format {
        config.pixel_format = format;
    }
    if let Some(buffers) = args.buffers {
        config.buffer_count = buffers;
    }
    if let Some(fps) = args.fps {
        config.fps = fps;
    }
    if let Some(frames) = args.frames {
        config.max_frames = (frames > 0).then_some(frames);
    }
    if let Some(layout) = args.layout {
        config.layout = layout;
    }

    config.validate()?;
    Ok(config)
}

fn capture_with<D: CaptureDriver + 'static>(
    driver: D,
    config: &CaptureConfig,
    token: CancellationToken,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = DeviceBufferPool::initialize(driver, &config.pool_request())?;
    let format = pool.format();

    let (publisher, subscriber) = relay::channel();
    let session = CaptureSession::new(pool, publisher, config.capture_settings(), token)?;
    let snapshot_size = session.snapshot_size();

    println!("Capturing from {}", config.device.display());
    println!("  Format:   {}", format);
    println!("  Layout:   {} ({} bytes per frame)", config.layout, snapshot_size);
    match config.max_frames {
        Some(max) => println!("  Frames:   {} at {} fps", max, config.fps),
        None => println!("  Frames:   until Ctrl+C, at {} fps", config.fps),
    }
    if let Some(path) = &output {
        println!("  Output:   {}", path.display());
    }
    println!();

    let sink = match &output {
        Some(path) => Some(BufWriter::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    let consumer = thread::Builder::new()
        .name("frame-consumer".to_string())
        .spawn(move || consume(subscriber, sink))?;

    let mut controller = CaptureLoopController::spawn("capture", session)?;

    let consumed = match consumer.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("consumer thread panicked")),
    };
    let outcome = controller.join().ok_or("capture thread panicked")?;

    let summary = outcome?;
    let consumed = consumed?;

    println!("Session ended: {:?}", summary.exit);
    println!("  Published: {}", summary.frames_published);
    println!("  Skipped:   {}", summary.frames_skipped);
    println!(
        "  Consumed:  {} frames, {} bytes in {:.1}s",
        consumed.frames,
        consumed.bytes,
        consumed.elapsed_secs
    );
    if summary.stop.stream_off_failed {
        println!("  Warning: device did not acknowledge stream off");
    }

    Ok(())
}

struct ConsumerStats {
    frames: u64,
    bytes: u64,
    elapsed_secs: f64,
}

/// Stand-in consumer: pull every frame and append it to `sink`, or drop it
///
/// Returning drops the subscriber, which closes the relay; a write error
/// therefore also ends the capture session.
fn consume(
    subscriber: FrameSubscriber,
    mut sink: Option<BufWriter<File>>,
) -> io::Result<ConsumerStats> {
    let started = Instant::now();
    let mut stats = ConsumerStats {
        frames: 0,
        bytes: 0,
        elapsed_secs: 0.0,
    };

    while let Ok(frame) = subscriber.take() {
        if let Some(writer) = sink.as_mut()
            && let Err(e) = writer.write_all(&frame.data)
        {
            warn!(error = %e, frame = frame.frame_number, "Writing frame failed, closing relay");
            return Err(e);
        }

        stats.frames += 1;
        stats.bytes += frame.len() as u64;
        if stats.frames % FRAME_LOG_INTERVAL == 0 {
            let fps = stats.frames as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                frames = stats.frames,
                sequence = frame.sequence,
                fps = format!("{:.1}", fps),
                "Consumer throughput"
            );
        }
    }

    if let Some(writer) = sink.as_mut() {
        writer.flush()?;
    }
    stats.elapsed_secs = started.elapsed().as_secs_f64();
    Ok(stats)
}

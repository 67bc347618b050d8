// SPDX-License-Identifier: GPL-3.0-only

use camrelay::{PixelFormat, SnapshotLayout};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camrelay")]
#[command(about = "Capture raw frames from a V4L2 camera and relay them to a consumer")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    List,

    /// Show what a device reports about itself
    Info {
        /// Device node
        #[arg(short, long, default_value = camrelay::constants::DEFAULT_DEVICE)]
        device: PathBuf,
    },

    /// Capture frames and hand them to a consumer
    Capture(CaptureArgs),
}

/// Flags override values from the config file
#[derive(Args, Debug, Default)]
pub struct CaptureArgs {
    /// Config file (default: ~/.config/camrelay/config.json if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Device node
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    /// Pixel format FourCC (UYVY, YUYV, GREY, RGB3, RGB4)
    #[arg(short, long)]
    pub format: Option<PixelFormat>,

    /// Number of mmap buffers (2-4)
    #[arg(short, long)]
    pub buffers: Option<u32>,

    /// Target frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Stop after this many frames (0 runs until Ctrl+C)
    #[arg(short = 'n', long)]
    pub frames: Option<u64>,

    /// Snapshot layout handed to the consumer (native or rgba)
    #[arg(short, long)]
    pub layout: Option<SnapshotLayout>,

    /// Append raw frames to this file instead of discarding them
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Use the in-memory virtual device instead of real hardware
    #[arg(long = "virtual")]
    pub use_virtual: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camrelay=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => cli::list_devices(),
        Commands::Info { device } => cli::show_info(&device),
        Commands::Capture(args) => cli::run_capture(args),
    }
}

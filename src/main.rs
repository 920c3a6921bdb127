//! cam-capture binary for exercising streaming capture on a V4L2 device.

use std::process::ExitCode;
use std::time::Duration;

use cam_capture::validation::{validate_color_bars, validate_gradient};
use cam_capture::{
    Backpressure, CaptureConfig, CaptureDevice, CaptureSession, CaptureStats, CaptureWorker,
    FlaggedFrames, Format, FourCC, Frame, Mapping, V4L2Device, V4L2Mapping, V4L2Provider,
};
use clap::Parser;
use tracing::{error, info, warn};

/// Handoff policy when the consumer falls behind.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Eq, Copy)]
enum BackpressureArg {
    /// Drop the newest frame and keep the device fed
    DropNewest,
    /// Pause dequeuing until delivered frames are released
    Block,
}

impl From<BackpressureArg> for Backpressure {
    fn from(arg: BackpressureArg) -> Self {
        match arg {
            BackpressureArg::DropNewest => Self::DropNewest,
            BackpressureArg::Block => Self::Block,
        }
    }
}

/// Test pattern to check every frame against.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Eq, Copy)]
enum PatternArg {
    /// 100% SMPTE color bars
    ColorBars,
    /// Left-to-right gray ramp
    Gradient,
}

/// Stream frames from a V4L2 capture device and print their metadata.
///
/// # Example
///
/// ```bash
/// cam-capture --device /dev/video0 --size 640 480 --frames 100
/// CAPTURE_DEVICE=/dev/video2 RUST_LOG=debug cam-capture --threaded
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture device path
    #[arg(short, long, env = "CAPTURE_DEVICE", default_value = "/dev/video0")]
    device: String,

    /// Capture resolution in pixels (width height); keeps the device format if unset
    #[arg(long, env = "CAPTURE_SIZE", value_delimiter = ' ', num_args = 2)]
    size: Option<Vec<u32>>,

    /// Pixel format as a four character code
    #[arg(long, env = "CAPTURE_FOURCC", default_value = "YUYV")]
    fourcc: FourCC,

    /// Number of buffers to request
    #[arg(short, long, default_value_t = 4)]
    buffers: u32,

    /// Stop after this many frames; runs until an error if unset
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Frame wait timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Capture on a dedicated thread
    #[arg(long)]
    threaded: bool,

    /// Handoff policy for threaded capture
    #[arg(long, default_value = "drop-newest", value_enum)]
    backpressure: BackpressureArg,

    /// Recycle frames the device flags as corrupted instead of delivering them
    #[arg(long)]
    recycle_flagged: bool,

    /// Validate each YUYV frame against a test pattern
    #[arg(long, value_enum)]
    pattern: Option<PatternArg>,
}

impl Args {
    fn config(&self) -> CaptureConfig {
        let mut config = CaptureConfig::new(&self.device)
            .with_buffer_count(self.buffers)
            .with_frame_timeout(Duration::from_millis(self.timeout_ms))
            .with_backpressure(self.backpressure.into());

        if let Some(&[width, height]) = self.size.as_deref() {
            config = config.with_format(Format::new(width, height, self.fourcc));
        }
        if self.recycle_flagged {
            config = config.with_flagged_frames(FlaggedFrames::Recycle);
        }
        config
    }

    fn done(&self, captured: u64) -> bool {
        self.frames.is_some_and(|limit| captured >= limit)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let result = if args.threaded {
        run_threaded(&args)
    } else {
        run_session(&args)
    };

    match result {
        Ok(stats) => {
            info!(
                captured = stats.frames_captured,
                flagged = stats.frames_flagged,
                dropped = stats.frames_dropped,
                enqueue_failures = stats.enqueue_failures,
                "capture finished"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "capture failed");
            ExitCode::FAILURE
        }
    }
}

fn run_session(args: &Args) -> cam_capture::Result<CaptureStats> {
    let mut session: CaptureSession<V4L2Device> = CaptureSession::new(args.config());
    session.start(&V4L2Provider)?;

    if let Some(device) = session.device() {
        let caps = device.capabilities();
        info!(card = %caps.card, driver = %caps.driver, "streaming");
    }
    let format = session.format().copied().unwrap_or_default();
    info!(
        width = format.width,
        height = format.height,
        fourcc = %format.fourcc,
        "negotiated format"
    );

    session.stream_frames(args.frames, |frame| report(frame, &format, args.pattern))?;

    session.stop()?;
    Ok(session.stats())
}

fn run_threaded(args: &Args) -> cam_capture::Result<CaptureStats> {
    let config = args.config();
    let timeout = config.frame_timeout;
    let worker: CaptureWorker<V4L2Mapping> = CaptureWorker::spawn(&V4L2Provider, config)?;
    let format = *worker.format();
    info!(
        device = worker.device(),
        width = format.width,
        height = format.height,
        fourcc = %format.fourcc,
        "capture thread started"
    );

    let mut captured = 0;
    while !args.done(captured) {
        match worker.recv_timeout(timeout) {
            Some(Ok(frame)) => {
                report(&frame, &format, args.pattern);
                captured += 1;
            }
            Some(Err(err)) if err.is_recoverable() => warn!(error = %err, "frame skipped"),
            Some(Err(err)) => return Err(err),
            None => {
                warn!("no frame within {timeout:?}");
                break;
            }
        }
    }

    worker.stop()
}

fn report<M: Mapping>(frame: &Frame<M>, format: &Format, pattern: Option<PatternArg>) {
    let meta = frame.metadata();
    println!(
        "Frame {}: buffer {}, {} bytes, timestamp: {:?}{}",
        meta.sequence,
        frame.index(),
        frame.payload_size(),
        meta.timestamp,
        if frame.is_flagged() { " [flagged]" } else { "" }
    );

    let checked = match pattern {
        Some(PatternArg::ColorBars) => validate_color_bars(frame.data(), format),
        Some(PatternArg::Gradient) => validate_gradient(frame.data(), format),
        None => return,
    };
    if let Err(err) = checked {
        warn!(sequence = meta.sequence, error = %err, "pattern check failed");
    }
}

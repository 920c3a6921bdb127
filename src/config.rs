//! Capture session configuration.

use std::time::Duration;

use crate::traits::Format;

/// Upper bound on per-release enqueue retries.
pub const MAX_ENQUEUE_RETRIES: u32 = 5;

/// What the worker does with a new frame while the consumer still has the
/// previous one waiting in the handoff slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Re-enqueue the new frame immediately and count it as dropped.
    #[default]
    DropNewest,
    /// Stop dequeuing until every delivered frame has been released.
    Block,
}

/// What the session does with a frame the device flagged as corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlaggedFrames {
    /// Hand the frame to the consumer with its error flag set.
    #[default]
    Deliver,
    /// Re-enqueue the buffer and report `FrameErrorFlagged` instead.
    Recycle,
}

/// Capture session configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device path, e.g. `/dev/video0`.
    pub device: String,
    /// Number of buffers to request; the device may grant a different count.
    pub buffer_count: u32,
    /// Format applied right after open. `None` keeps the device's format.
    pub format: Option<Format>,
    /// Longest `next_frame` waits before failing.
    pub frame_timeout: Duration,
    /// Slice length for waits that must observe a stop request.
    pub poll_interval: Duration,
    /// Handoff policy for the threaded worker.
    pub backpressure: Backpressure,
    /// Flagged frame policy.
    pub flagged_frames: FlaggedFrames,
    /// Immediate retries for a rejected re-enqueue, capped at
    /// [`MAX_ENQUEUE_RETRIES`].
    pub enqueue_retries: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_owned(),
            buffer_count: 4,
            format: None,
            frame_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            backpressure: Backpressure::default(),
            flagged_frames: FlaggedFrames::default(),
            enqueue_retries: 1,
        }
    }
}

impl CaptureConfig {
    /// Configuration for `device` with default settings.
    #[must_use]
    pub fn new(device: &str) -> Self {
        Self::default().with_device(device)
    }

    /// Set the device path.
    #[must_use]
    pub fn with_device(mut self, device: &str) -> Self {
        device.clone_into(&mut self.device);
        self
    }

    /// Set the requested buffer count.
    #[must_use]
    pub const fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    /// Apply `format` after opening the device.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Set the frame wait timeout.
    #[must_use]
    pub const fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Set the wait slice used to observe stop requests.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the worker backpressure policy.
    #[must_use]
    pub const fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Set the flagged frame policy.
    #[must_use]
    pub const fn with_flagged_frames(mut self, policy: FlaggedFrames) -> Self {
        self.flagged_frames = policy;
        self
    }

    /// Set the re-enqueue retry count. Values above [`MAX_ENQUEUE_RETRIES`]
    /// are clamped.
    #[must_use]
    pub fn with_enqueue_retries(mut self, retries: u32) -> Self {
        self.enqueue_retries = retries.min(MAX_ENQUEUE_RETRIES);
        self
    }

    /// Poll interval with a floor of one millisecond.
    pub(crate) fn poll_slice(&self) -> Duration {
        self.poll_interval.max(Duration::from_millis(1))
    }
}

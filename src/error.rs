//! Error taxonomy for the capture protocol.
//!
//! Every fallible operation in the crate reports exactly one [`ErrorKind`].
//! Errors carry the device identifier and the operation that failed so a
//! caller can log or translate them without seeing raw error codes.

use std::fmt;
use std::io;

/// Closed set of failure conditions, one per protocol stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The device could not be opened or is not a streaming capture device.
    OpenFailed,
    /// The device rejected the buffer request or granted no buffers.
    BufferRequestFailed,
    /// A buffer could not be queried or mapped into process memory.
    MappingFailed,
    /// A buffer could not be handed to the device.
    EnqueueFailed,
    /// No buffer could be taken back from the device.
    DequeueFailed,
    /// The device refused to start streaming.
    StreamOnFailed,
    /// The device refused to stop streaming.
    StreamOffFailed,
    /// The device marked a dequeued buffer as corrupted.
    FrameErrorFlagged,
    /// A buffer index outside the negotiated pool.
    IndexOutOfRange,
}

impl ErrorKind {
    /// Whether the session can keep streaming after this error.
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::FrameErrorFlagged | Self::EnqueueFailed | Self::IndexOutOfRange
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenFailed => "open failed",
            Self::BufferRequestFailed => "buffer request failed",
            Self::MappingFailed => "buffer mapping failed",
            Self::EnqueueFailed => "enqueue failed",
            Self::DequeueFailed => "dequeue failed",
            Self::StreamOnFailed => "stream on failed",
            Self::StreamOffFailed => "stream off failed",
            Self::FrameErrorFlagged => "frame error flag set",
            Self::IndexOutOfRange => "buffer index out of range",
        };
        f.write_str(name)
    }
}

/// Error type for capture operations.
#[derive(Debug, thiserror::Error)]
#[error("{kind} ({operation} on {device}): {detail}")]
pub struct CaptureError {
    kind: ErrorKind,
    device: String,
    operation: &'static str,
    detail: String,
    #[source]
    source: Option<io::Error>,
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

impl CaptureError {
    fn new(kind: ErrorKind, device: &str, operation: &'static str, detail: String) -> Self {
        Self {
            kind,
            device: device.to_owned(),
            operation,
            detail,
            source: None,
        }
    }

    fn from_io(kind: ErrorKind, device: &str, operation: &'static str, err: io::Error) -> Self {
        Self {
            detail: err.to_string(),
            source: Some(err),
            ..Self::new(kind, device, operation, String::new())
        }
    }

    /// Failure kind.
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Identifier of the device the failure happened on.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Name of the operation that failed.
    pub const fn operation(&self) -> &'static str {
        self.operation
    }

    /// Human-readable detail.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Whether the session can keep streaming after this error.
    pub const fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    pub(crate) fn open_failed(device: &str, err: io::Error) -> Self {
        Self::from_io(ErrorKind::OpenFailed, device, "open", err)
    }

    pub(crate) fn not_capture_device(device: &str, missing: &str) -> Self {
        Self::new(
            ErrorKind::OpenFailed,
            device,
            "query capabilities",
            format!("device has no {missing} capability"),
        )
    }

    pub(crate) fn format_failed(device: &str, operation: &'static str, err: io::Error) -> Self {
        Self::from_io(ErrorKind::OpenFailed, device, operation, err)
    }

    pub(crate) fn invalid_state(
        kind: ErrorKind,
        device: &str,
        operation: &'static str,
        state: &dyn fmt::Display,
    ) -> Self {
        Self::new(kind, device, operation, format!("session is {state}"))
    }

    pub(crate) fn buffer_request_failed(device: &str, err: io::Error) -> Self {
        Self::from_io(ErrorKind::BufferRequestFailed, device, "VIDIOC_REQBUFS", err)
    }

    pub(crate) fn buffer_request_rejected(device: &str, detail: String) -> Self {
        Self::new(ErrorKind::BufferRequestFailed, device, "VIDIOC_REQBUFS", detail)
    }

    pub(crate) fn mapping_failed(device: &str, index: u32, err: io::Error) -> Self {
        let mut error = Self::from_io(ErrorKind::MappingFailed, device, "mmap", err);
        error.detail = format!("buffer {index}: {}", error.detail);
        error
    }

    pub(crate) fn enqueue_failed(device: &str, index: u32, err: io::Error) -> Self {
        let mut error = Self::from_io(ErrorKind::EnqueueFailed, device, "VIDIOC_QBUF", err);
        error.detail = format!("buffer {index}: {}", error.detail);
        error
    }

    pub(crate) fn enqueue_rejected(device: &str, detail: String) -> Self {
        Self::new(ErrorKind::EnqueueFailed, device, "VIDIOC_QBUF", detail)
    }

    pub(crate) fn dequeue_failed(device: &str, err: io::Error) -> Self {
        Self::from_io(ErrorKind::DequeueFailed, device, "VIDIOC_DQBUF", err)
    }

    pub(crate) fn dequeue_rejected(device: &str, detail: String) -> Self {
        Self::new(ErrorKind::DequeueFailed, device, "VIDIOC_DQBUF", detail)
    }

    pub(crate) fn stream_on_failed(device: &str, err: io::Error) -> Self {
        Self::from_io(ErrorKind::StreamOnFailed, device, "VIDIOC_STREAMON", err)
    }

    pub(crate) fn stream_off_failed(device: &str, err: io::Error) -> Self {
        Self::from_io(ErrorKind::StreamOffFailed, device, "VIDIOC_STREAMOFF", err)
    }

    pub(crate) fn worker_panicked(device: &str) -> Self {
        Self::new(
            ErrorKind::StreamOffFailed,
            device,
            "join capture thread",
            "capture thread panicked before teardown".to_owned(),
        )
    }

    pub(crate) fn frame_error_flagged(device: &str, index: u32, sequence: u32) -> Self {
        Self::new(
            ErrorKind::FrameErrorFlagged,
            device,
            "VIDIOC_DQBUF",
            format!("buffer {index} (sequence {sequence}) flagged by device"),
        )
    }

    pub(crate) fn index_out_of_range(device: &str, index: u32, count: u32) -> Self {
        Self::new(
            ErrorKind::IndexOutOfRange,
            device,
            "buffer lookup",
            format!("index {index} outside pool of {count}"),
        )
    }
}

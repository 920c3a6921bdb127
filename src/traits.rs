//! Core traits and types for the V4L2 device abstraction.
//!
//! [`CaptureDevice`] is the seam between the capture state machine and the
//! kernel: the production implementation issues V4L2 ioctls, the test mock
//! scripts the same protocol in memory.

use std::io;
use std::time::Duration;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("fourcc must be exactly 4 bytes, got {s:?}"))?;
        Ok(Self(bytes))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new packed 4:2:2 format specification.
    ///
    /// Stride and size assume 2 bytes per pixel; the driver reports the
    /// real values when the format is applied.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = width.saturating_mul(2);
        let size = stride.saturating_mul(height);
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

impl Default for Format {
    /// 640x480 YUYV, the format a freshly opened device is assumed to carry.
    fn default() -> Self {
        Self::new(640, 480, FourCC::YUYV)
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Metadata the device attaches to a completed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Bytes of valid data the device wrote.
    pub bytes_used: u32,
}

/// A buffer taken back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Pool index of the buffer.
    pub index: u32,
    /// Device-reported frame metadata.
    pub metadata: FrameMetadata,
    /// Whether the device flagged the frame as corrupted.
    pub error_flag: bool,
}

/// A region of device memory mapped into the process.
///
/// Dropping the mapping unmaps it.
pub trait Mapping: Send + Sync {
    /// Opaque base address of the region.
    fn base_address(&self) -> usize;

    /// Mapped length in bytes.
    fn len(&self) -> usize;

    /// Whether the region is zero-length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The full region.
    fn as_slice(&self) -> &[u8];
}

/// Abstraction over a single opened capture device.
///
/// Methods map one-to-one onto the streaming I/O protocol; none of them
/// track ownership, that is the job of the capture session.
pub trait CaptureDevice: Send {
    /// Region type produced by [`CaptureDevice::map_buffer`].
    type Mapping: Mapping + 'static;

    /// Identifier the device was opened with.
    fn id(&self) -> &str;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Get current format.
    fn format(&self) -> io::Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> io::Result<Format>;

    /// Ask for `count` buffers. Returns the granted count.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Device-side length of buffer `index`.
    fn query_buffer(&mut self, index: u32) -> io::Result<usize>;

    /// Map buffer `index` into process memory.
    fn map_buffer(&mut self, index: u32, length: usize) -> io::Result<Self::Mapping>;

    /// Hand buffer `index` to the device.
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Wait up to `timeout` for a completed buffer. Returns `false` on timeout.
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Take the next completed buffer back from the device.
    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;

    /// Start streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stop streaming. Every queued buffer returns to the driver.
    fn stream_off(&mut self) -> io::Result<()>;
}

/// Opens devices by identifier.
pub trait DeviceProvider {
    /// Device type produced by this provider.
    type Device: CaptureDevice;

    /// Open the device named `id`.
    fn open(&self, id: &str) -> io::Result<Self::Device>;
}

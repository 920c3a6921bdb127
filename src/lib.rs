//! Cam-Capture: zero-copy V4L2 streaming capture with explicit buffer ownership
//!
//! This library drives the memory-mapped streaming protocol of a V4L2 capture
//! device. Every buffer has exactly one owner at a time (idle, device or
//! consumer); frames are handed out as tokens that return their buffer to the
//! device when dropped. The device layer is trait-based, enabling both
//! production use with real hardware and testing with mock devices.

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod traits;
pub mod validation;
pub mod worker;

#[cfg(test)]
pub mod mock;

pub use buffer::{Buffer, BufferPool, Owner};
pub use config::{Backpressure, CaptureConfig, FlaggedFrames, MAX_ENQUEUE_RETRIES};
pub use device::{V4L2Device, V4L2Mapping, V4L2Provider};
pub use error::{CaptureError, ErrorKind, Result};
pub use session::{CaptureSession, CaptureStats, Frame, SessionState};
pub use traits::{
    CaptureDevice, DequeuedBuffer, DeviceCapabilities, DeviceProvider, Format, FourCC,
    FrameMetadata, Mapping,
};
pub use worker::CaptureWorker;

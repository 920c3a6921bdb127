//! V4L2 device implementation using the v4l crate.
//!
//! Device open, capability and format queries go through the crate's safe
//! API; the streaming I/O protocol (REQBUFS, QUERYBUF, QBUF, DQBUF,
//! STREAMON/OFF) and the buffer mappings use its raw `v4l2` layer so the
//! capture session can own every buffer transition itself.

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::{Flags, Type};
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    CaptureDevice, DequeuedBuffer, DeviceCapabilities, DeviceProvider, Format, FourCC,
    FrameMetadata, Mapping,
};

/// Attempts for an ioctl interrupted by a signal.
const MAX_INTERRUPTED_RETRIES: usize = 5;

/// Re-issue `op` while it fails with `EINTR`, at most
/// [`MAX_INTERRUPTED_RETRIES`] times.
fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(err)
                if err.kind() == io::ErrorKind::Interrupted
                    && attempt + 1 < MAX_INTERRUPTED_RETRIES =>
            {
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn empty_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value.
        ..unsafe { mem::zeroed() }
    }
}

/// Opens V4L2 devices by path.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4L2Provider;

impl DeviceProvider for V4L2Provider {
    type Device = V4L2Device;

    fn open(&self, id: &str) -> io::Result<V4L2Device> {
        V4L2Device::open(id)
    }
}

/// V4L2 device implementation wrapping the v4l crate.
///
/// The file descriptor is closed when the device is dropped.
pub struct V4L2Device {
    id: String,
    device: Device,
    fd: c_int,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Open a V4L2 device by path (e.g., `/dev/video0`).
    pub fn open(path: &str) -> io::Result<Self> {
        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        let fd = device.handle().fd();
        debug!(device = path, card = %capabilities.card, "opened V4L2 device");

        Ok(Self {
            id: path.to_owned(),
            device,
            fd,
            capabilities,
        })
    }

    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    pub fn open_index(index: u32) -> io::Result<Self> {
        Self::open(&format!("/dev/video{index}"))
    }

    fn ioctl<T>(&self, request: Request, arg: &mut T) -> io::Result<()> {
        use v4l::v4l2::vidioc;

        let code = match request {
            Request::ReqBufs => vidioc::VIDIOC_REQBUFS,
            Request::QueryBuf => vidioc::VIDIOC_QUERYBUF,
            Request::QBuf => vidioc::VIDIOC_QBUF,
            Request::DqBuf => vidioc::VIDIOC_DQBUF,
            Request::StreamOn => vidioc::VIDIOC_STREAMON,
            Request::StreamOff => vidioc::VIDIOC_STREAMOFF,
        };
        retry_interrupted(|| {
            // SAFETY: `arg` is the argument struct the request expects and
            // outlives the call.
            unsafe { v4l2::ioctl(self.fd, code, ptr::from_mut(&mut *arg).cast::<c_void>()) }
        })
    }

    fn query(&self, index: u32) -> io::Result<v4l2_buffer> {
        let mut buf = empty_buffer(index);
        self.ioctl(Request::QueryBuf, &mut buf)?;
        Ok(buf)
    }
}

/// Streaming ioctls issued by the device.
#[derive(Debug, Clone, Copy)]
enum Request {
    ReqBufs,
    QueryBuf,
    QBuf,
    DqBuf,
    StreamOn,
    StreamOff,
}

impl CaptureDevice for V4L2Device {
    type Mapping = V4L2Mapping;

    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> io::Result<Format> {
        let fmt = self.device.format()?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        let mut fmt = self.device.format()?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self.device.set_format(&fmt)?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: plain C struct; all-zero is a valid value.
            ..unsafe { mem::zeroed() }
        };
        self.ioctl(Request::ReqBufs, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<usize> {
        Ok(self.query(index)?.length as usize)
    }

    fn map_buffer(&mut self, index: u32, length: usize) -> io::Result<V4L2Mapping> {
        let buf = self.query(index)?;
        // SAFETY: QUERYBUF on an MMAP queue fills the `offset` member.
        let offset = unsafe { buf.m.offset };
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::other("buffer offset exceeds off_t"))?;

        // SAFETY: maps `length` bytes of the device's buffer `index`; the
        // kernel validates offset and length against the fd.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset,
            )
        }?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null address"))?;
        Ok(V4L2Mapping { ptr, len: length })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = empty_buffer(index);
        self.ioctl(Request::QBuf, &mut buf)
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);

        // SAFETY: `fds` is a valid array of one pollfd for the whole call.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        let [pollfd] = fds;
        match ready {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
            0 => Ok(false),
            _ => {
                let revents = pollfd.revents;
                if revents & libc::POLLERR != 0 {
                    Err(io::Error::other("device signalled POLLERR"))
                } else {
                    Ok(revents & libc::POLLIN != 0)
                }
            }
        }
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buf = empty_buffer(0);
        self.ioctl(Request::DqBuf, &mut buf)?;

        // V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = buf.timestamp.tv_sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        Ok(DequeuedBuffer {
            index: buf.index,
            metadata: FrameMetadata {
                sequence: buf.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: buf.bytesused,
            },
            error_flag: Flags::from(buf.flags).contains(Flags::ERROR),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;
        self.ioctl(Request::StreamOn, &mut typ)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;
        self.ioctl(Request::StreamOff, &mut typ)
    }
}

/// A device buffer mapped with `mmap`. Unmapped on drop.
#[derive(Debug)]
pub struct V4L2Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory with no thread affinity; the
// capture session decides which side may read it at any time.
unsafe impl Send for V4L2Mapping {}
// SAFETY: only shared reads are exposed through `as_slice`.
unsafe impl Sync for V4L2Mapping {}

impl Mapping for V4L2Mapping {
    fn base_address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` maps `len` readable bytes until this value is dropped.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for V4L2Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` come from a successful mmap and are unmapped once.
        if let Err(err) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } {
            warn!(error = %err, len = self.len, "munmap failed");
        }
    }
}

//! Capture state machine.
//!
//! A [`CaptureSession`] owns the device handle and its [`BufferPool`] and is
//! the only place buffers change hands. The consumer receives a [`Frame`],
//! an ownership token for one dequeued buffer, and gives it back with
//! [`CaptureSession::release`] (or by dropping it, in which case the buffer
//! is re-enqueued on the next frame cycle).

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::buffer::{BufferPool, Owner};
use crate::config::{CaptureConfig, FlaggedFrames};
use crate::error::{CaptureError, ErrorKind, Result};
use crate::traits::{CaptureDevice, DeviceProvider, Format, FrameMetadata, Mapping};

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device handle, no buffers.
    Closed,
    /// Device open, pool mapped, every buffer queued; not streaming.
    Prepared,
    /// Device producing frames.
    Streaming,
    /// Teardown in progress.
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Prepared => write!(f, "prepared"),
            Self::Streaming => write!(f, "streaming"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Buffers dequeued and handed out (flagged ones included).
    pub frames_captured: u64,
    /// Buffers the device flagged as corrupted.
    pub frames_flagged: u64,
    /// Frames recycled without reaching the consumer.
    pub frames_dropped: u64,
    /// Rejected re-enqueue attempts.
    pub enqueue_failures: u64,
}

#[derive(Debug, Clone, Copy)]
struct Recycled {
    generation: u64,
    index: u32,
}

/// A captured frame: read access to one buffer until it is released.
///
/// Dropping a frame without releasing it returns the buffer to its session,
/// which re-enqueues it on the next frame cycle.
#[must_use = "frames hold a capture buffer until released"]
pub struct Frame<M: Mapping> {
    index: u32,
    generation: u64,
    payload_size: usize,
    metadata: FrameMetadata,
    error_flag: bool,
    mapping: Arc<M>,
    recycle: Option<Sender<Recycled>>,
}

impl<M: Mapping> Frame<M> {
    /// Pool index of the buffer holding this frame.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Opaque base address of the buffer.
    pub fn base_address(&self) -> usize {
        self.mapping.base_address()
    }

    /// Bytes of valid data.
    pub const fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// The captured bytes.
    pub fn data(&self) -> &[u8] {
        self.mapping
            .as_slice()
            .get(..self.payload_size)
            .unwrap_or_default()
    }

    /// Device-reported metadata.
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Whether the device flagged this frame as corrupted.
    pub const fn is_flagged(&self) -> bool {
        self.error_flag
    }
}

impl<M: Mapping> fmt::Debug for Frame<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("payload_size", &self.payload_size)
            .field("metadata", &self.metadata)
            .field("error_flag", &self.error_flag)
            .finish_non_exhaustive()
    }
}

impl<M: Mapping> Drop for Frame<M> {
    fn drop(&mut self) {
        if let Some(recycle) = self.recycle.take() {
            // The session may already be gone; nothing to return to then.
            let _ = recycle.send(Recycled {
                generation: self.generation,
                index: self.index,
            });
        }
    }
}

struct Active<D: CaptureDevice> {
    pool: BufferPool<D::Mapping>,
    device: D,
    format: Format,
    recycle_tx: Sender<Recycled>,
    recycle_rx: Receiver<Recycled>,
}

/// Capture state machine for one device.
pub struct CaptureSession<D: CaptureDevice> {
    config: CaptureConfig,
    state: SessionState,
    active: Option<Active<D>>,
    generation: u64,
    stats: CaptureStats,
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// A closed session for `config`.
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state: SessionState::Closed,
            active: None,
            generation: 0,
            stats: CaptureStats::default(),
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Session configuration.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Counters since the last prepare.
    pub const fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Format in effect, while the device is open.
    pub fn format(&self) -> Option<&Format> {
        self.active.as_ref().map(|active| &active.format)
    }

    /// The buffer pool, while the device is open.
    pub fn pool(&self) -> Option<&BufferPool<D::Mapping>> {
        self.active.as_ref().map(|active| &active.pool)
    }

    /// The device handle, while open.
    pub fn device(&self) -> Option<&D> {
        self.active.as_ref().map(|active| &active.device)
    }

    /// Buffers currently held by `owner`.
    pub fn owned_by(&self, owner: Owner) -> usize {
        self.pool().map_or(0, |pool| pool.count_owned_by(owner))
    }

    /// Open the device, negotiate and map the pool, and queue every buffer.
    ///
    /// On failure everything acquired so far is released and the session
    /// stays `Closed`.
    pub fn prepare<P>(&mut self, provider: &P) -> Result<()>
    where
        P: DeviceProvider<Device = D>,
    {
        let id = self.config.device.clone();
        if self.state != SessionState::Closed {
            return Err(CaptureError::invalid_state(
                ErrorKind::OpenFailed,
                &id,
                "open",
                &self.state,
            ));
        }

        let mut device = provider
            .open(&id)
            .map_err(|err| CaptureError::open_failed(&id, err))?;

        let caps = device.capabilities();
        if !caps.can_capture {
            return Err(CaptureError::not_capture_device(&id, "video capture"));
        }
        if !caps.can_stream {
            return Err(CaptureError::not_capture_device(&id, "streaming"));
        }
        info!(device = %id, card = %caps.card, driver = %caps.driver, "opened capture device");

        let format = match &self.config.format {
            Some(requested) => {
                let actual = device
                    .set_format(requested)
                    .map_err(|err| CaptureError::format_failed(&id, "VIDIOC_S_FMT", err))?;
                if actual.width != requested.width || actual.height != requested.height {
                    warn!(
                        device = %id,
                        requested_width = requested.width,
                        requested_height = requested.height,
                        width = actual.width,
                        height = actual.height,
                        "driver adjusted requested resolution"
                    );
                }
                actual
            }
            None => device
                .format()
                .map_err(|err| CaptureError::format_failed(&id, "VIDIOC_G_FMT", err))?,
        };

        let mut pool = BufferPool::new(&id);
        pool.negotiate(&mut device, self.config.buffer_count)?;
        pool.map_all(&mut device)?;

        for index in 0..pool.count() {
            if let Err(err) = device.queue_buffer(index) {
                error!(device = %id, index, "priming enqueue failed, closing device");
                return Err(CaptureError::enqueue_failed(&id, index, err));
            }
            pool.set_owner(index, Owner::Device)?;
        }
        debug!(device = %id, count = pool.count(), "primed device with all buffers");

        let (recycle_tx, recycle_rx) = mpsc::channel();
        self.active = Some(Active {
            pool,
            device,
            format,
            recycle_tx,
            recycle_rx,
        });
        self.generation += 1;
        self.stats = CaptureStats::default();
        self.state = SessionState::Prepared;
        Ok(())
    }

    /// Start streaming. On failure the session is torn down to `Closed`.
    pub fn stream_on(&mut self) -> Result<()> {
        let id = self.config.device.clone();
        let active = match (self.state, self.active.as_mut()) {
            (SessionState::Prepared, Some(active)) => active,
            (state, _) => {
                return Err(CaptureError::invalid_state(
                    ErrorKind::StreamOnFailed,
                    &id,
                    "VIDIOC_STREAMON",
                    &state,
                ))
            }
        };

        if let Err(err) = active.device.stream_on() {
            error!(device = %id, "stream on failed, closing device");
            self.close();
            return Err(CaptureError::stream_on_failed(&id, err));
        }

        info!(device = %id, buffers = active.pool.count(), "streaming started");
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Prepare and start streaming.
    pub fn start<P>(&mut self, provider: &P) -> Result<()>
    where
        P: DeviceProvider<Device = D>,
    {
        self.prepare(provider)?;
        self.stream_on()
    }

    /// Wait for the next frame, failing with `DequeueFailed` once the
    /// configured frame timeout elapses.
    pub fn next_frame(&mut self) -> Result<Frame<D::Mapping>> {
        let timeout = self.config.frame_timeout;
        self.poll_frame(timeout)?.ok_or_else(|| {
            CaptureError::dequeue_rejected(
                &self.config.device,
                format!("no frame within {timeout:?}"),
            )
        })
    }

    /// Wait up to `timeout` for the next frame. `Ok(None)` means nothing
    /// completed in time.
    pub fn poll_frame(&mut self, timeout: Duration) -> Result<Option<Frame<D::Mapping>>> {
        if self.state != SessionState::Streaming {
            return Err(CaptureError::invalid_state(
                ErrorKind::DequeueFailed,
                &self.config.device,
                "VIDIOC_DQBUF",
                &self.state,
            ));
        }

        let deadline = Instant::now().checked_add(timeout);
        self.recycle_returned();
        if self.owned_by(Owner::Device) == 0 && !self.wait_recycled(timeout) {
            return Ok(None);
        }

        let remaining = deadline.map_or(timeout, |at| at.saturating_duration_since(Instant::now()));
        let id = self.config.device.as_str();
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };

        let ready = active
            .device
            .wait_ready(remaining)
            .map_err(|err| CaptureError::dequeue_failed(id, err))?;
        if !ready {
            return Ok(None);
        }

        let dequeued = active.device.dequeue_buffer().map_err(|err| {
            error!(device = %id, "dequeue failed");
            CaptureError::dequeue_failed(id, err)
        })?;
        let index = dequeued.index;

        let buffer = active.pool.buffer_at_mut(index)?;
        if buffer.owner() != Owner::Device {
            return Err(CaptureError::dequeue_rejected(
                id,
                format!("buffer {index} was not queued on the device"),
            ));
        }
        buffer.set_payload_size(dequeued.metadata.bytes_used as usize);
        let payload_size = buffer.payload_size();
        let mapping = Arc::clone(buffer.mapping());
        active.pool.set_owner(index, Owner::Consumer)?;
        self.stats.frames_captured += 1;

        if dequeued.error_flag {
            self.stats.frames_flagged += 1;
            let sequence = dequeued.metadata.sequence;
            warn!(device = %id, index, sequence, "device flagged frame error");

            if self.config.flagged_frames == FlaggedFrames::Recycle {
                self.stats.frames_dropped += 1;
                let flagged = CaptureError::frame_error_flagged(id, index, sequence);
                // A failed re-enqueue is logged and counted inside requeue.
                let _ = self.requeue(index);
                return Err(flagged);
            }
        }

        debug!(device = %id, index, payload_size, "frame dequeued");
        Ok(Some(Frame {
            index,
            generation: self.generation,
            payload_size,
            metadata: dequeued.metadata,
            error_flag: dequeued.error_flag,
            mapping,
            recycle: self.active.as_ref().map(|active| active.recycle_tx.clone()),
        }))
    }

    /// Hand a frame's buffer back to the device.
    ///
    /// A rejected re-enqueue is not fatal: the buffer is parked and retried
    /// on the next frame cycle.
    pub fn release(&mut self, mut frame: Frame<D::Mapping>) -> Result<()> {
        frame.recycle = None;
        if frame.generation != self.generation || self.active.is_none() {
            debug!(device = %self.config.device, index = frame.index, "released frame from a closed session");
            return Ok(());
        }
        if self.state != SessionState::Streaming {
            return Err(CaptureError::invalid_state(
                ErrorKind::EnqueueFailed,
                &self.config.device,
                "VIDIOC_QBUF",
                &self.state,
            ));
        }
        self.requeue(frame.index)
    }

    /// Capture until `limit` frames were handed to `on_frame`, or forever if
    /// `limit` is `None`. Each frame is released after the callback returns.
    ///
    /// Recoverable errors are logged and skipped; the first fatal error is
    /// returned. Returns the number of frames delivered.
    pub fn stream_frames<F>(&mut self, limit: Option<u64>, mut on_frame: F) -> Result<u64>
    where
        F: FnMut(&Frame<D::Mapping>),
    {
        let mut delivered = 0;
        while !limit.is_some_and(|limit| delivered >= limit) {
            let frame = match self.next_frame() {
                Ok(frame) => frame,
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "frame skipped");
                    continue;
                }
                Err(err) => return Err(err),
            };

            on_frame(&frame);
            delivered += 1;

            match self.release(frame) {
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "buffer not returned to device this cycle");
                }
                result => result?,
            }
        }
        Ok(delivered)
    }

    /// Release a frame the consumer never saw.
    pub(crate) fn discard(&mut self, frame: Frame<D::Mapping>) {
        self.stats.frames_dropped += 1;
        // Failures are logged and counted inside requeue.
        let _ = self.release(frame);
    }

    fn requeue(&mut self, index: u32) -> Result<()> {
        let id = self.config.device.as_str();
        let attempts = self.config.enqueue_retries + 1;
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        if active.pool.owner_of(index)? != Owner::Consumer {
            return Err(CaptureError::enqueue_rejected(
                id,
                format!("buffer {index} is not held by the consumer"),
            ));
        }

        let mut last_err = None;
        for attempt in 0..attempts {
            match active.device.queue_buffer(index) {
                Ok(()) => {
                    active.pool.set_owner(index, Owner::Device)?;
                    return Ok(());
                }
                Err(err) => {
                    debug!(device = %id, index, attempt, error = %err, "re-enqueue rejected");
                    last_err = Some(err);
                }
            }
        }

        self.stats.enqueue_failures += 1;
        active.pool.set_owner(index, Owner::Idle)?;
        warn!(device = %id, index, attempts, "buffer parked after failed re-enqueue");
        let err = last_err.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::Other));
        Err(CaptureError::enqueue_failed(id, index, err))
    }

    /// Re-enqueue buffers whose frames were dropped, then give every parked
    /// buffer one more attempt.
    fn recycle_returned(&mut self) {
        let returned: Vec<Recycled> = match self.active.as_ref() {
            Some(active) => active.recycle_rx.try_iter().collect(),
            None => return,
        };
        for recycled in returned {
            self.requeue_returned(recycled);
        }
        self.retry_parked();
    }

    /// Block up to `timeout` for a dropped frame to come back. Returns
    /// whether one did.
    pub(crate) fn wait_recycled(&mut self, timeout: Duration) -> bool {
        let received = match self.active.as_ref() {
            Some(active) => active.recycle_rx.recv_timeout(timeout),
            None => return false,
        };
        match received {
            Ok(recycled) => {
                self.requeue_returned(recycled);
                self.recycle_returned();
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    fn requeue_returned(&mut self, recycled: Recycled) {
        if recycled.generation != self.generation {
            return;
        }
        if let Err(err) = self.requeue(recycled.index) {
            debug!(error = %err, "dropped frame could not be re-enqueued");
        }
    }

    fn retry_parked(&mut self) {
        let id = self.config.device.as_str();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        for index in active.pool.indices_owned_by(Owner::Idle) {
            match active.device.queue_buffer(index) {
                Ok(()) => {
                    // Index came from the pool itself.
                    let _ = active.pool.set_owner(index, Owner::Device);
                    debug!(device = %id, index, "parked buffer re-enqueued");
                }
                Err(err) => {
                    self.stats.enqueue_failures += 1;
                    warn!(device = %id, index, error = %err, "parked buffer still rejected");
                }
            }
        }
    }

    /// Stop streaming, unmap the pool and close the device.
    ///
    /// Teardown always completes; a stream-off failure is returned after the
    /// session is `Closed`.
    pub fn stop(&mut self) -> Result<()> {
        let was_streaming = match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Streaming => true,
            SessionState::Prepared | SessionState::Stopping => false,
        };
        self.state = SessionState::Stopping;

        let mut result = Ok(());
        if let Some(active) = self.active.as_mut() {
            if was_streaming {
                if let Err(err) = active.device.stream_off() {
                    error!(device = %self.config.device, "stream off failed, continuing teardown");
                    result = Err(CaptureError::stream_off_failed(&self.config.device, err));
                }
            }
            active.pool.reclaim_from_device();
        }

        self.close();
        info!(device = %self.config.device, stats = ?self.stats, "capture stopped");
        result
    }

    fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.pool.unmap_all();
            drop(active);
            debug!(device = %self.config.device, "device closed");
        }
        self.state = SessionState::Closed;
    }
}

impl<D: CaptureDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "teardown on drop reported an error");
        }
    }
}

impl<D: CaptureDevice> fmt::Debug for CaptureSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.config.device)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

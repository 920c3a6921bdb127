//! Threaded capture.
//!
//! [`CaptureWorker`] moves a started [`CaptureSession`] onto its own thread.
//! Frames reach the consumer through a single-slot channel; the consumer
//! releases a frame by dropping it, which hands the buffer back to the
//! worker for re-enqueue. When the slot is still occupied the configured
//! [`Backpressure`] policy applies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::buffer::Owner;
use crate::config::{Backpressure, CaptureConfig};
use crate::error::{CaptureError, Result};
use crate::session::{CaptureSession, CaptureStats, Frame, SessionState};
use crate::traits::{CaptureDevice, DeviceProvider, Format, Mapping};

type FrameResult<M> = Result<Frame<M>>;

struct WorkerExit {
    stats: CaptureStats,
    error: Option<CaptureError>,
}

/// A capture session running on a dedicated thread.
pub struct CaptureWorker<M: Mapping> {
    device: String,
    format: Format,
    frames: Receiver<FrameResult<M>>,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    handle: Option<JoinHandle<WorkerExit>>,
}

impl<M: Mapping + 'static> CaptureWorker<M> {
    /// Start a session for `config` and hand it to a capture thread.
    ///
    /// Start-up errors are returned here, before any thread exists.
    pub fn spawn<P>(provider: &P, config: CaptureConfig) -> Result<Self>
    where
        P: DeviceProvider,
        P::Device: CaptureDevice<Mapping = M> + 'static,
    {
        let device = config.device.clone();
        let mut session = CaptureSession::new(config);
        session.start(provider)?;
        let format = session.format().copied().unwrap_or_default();

        let (tx, frames) = mpsc::sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(SessionState::Streaming));

        let handle = thread::Builder::new()
            .name("capture".to_owned())
            .spawn({
                let stop = Arc::clone(&stop);
                let state = Arc::clone(&state);
                move || run(session, &tx, &stop, &state)
            })
            .map_err(|err| CaptureError::stream_on_failed(&device, err))?;

        Ok(Self {
            device,
            format,
            frames,
            stop,
            state,
            handle: Some(handle),
        })
    }

    /// Identifier of the device being captured.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Format negotiated before the thread started.
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Last state the capture thread published.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the next frame or error. `None` once the capture thread
    /// has exited and every pending item was received.
    pub fn recv(&self) -> Option<FrameResult<M>> {
        self.frames.recv().ok()
    }

    /// Like [`CaptureWorker::recv`], giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<FrameResult<M>> {
        self.frames.recv_timeout(timeout).ok()
    }

    /// Stop capture and wait for the thread to finish teardown.
    ///
    /// Returns the session counters, or the terminal error the consumer had
    /// not yet received.
    pub fn stop(mut self) -> Result<CaptureStats> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<CaptureStats> {
        self.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(CaptureStats::default());
        };

        match handle.join() {
            Ok(WorkerExit { error: Some(err), .. }) => Err(err),
            Ok(WorkerExit { stats, error: None }) => Ok(stats),
            Err(_) => Err(CaptureError::worker_panicked(&self.device)),
        }
    }
}

impl<M: Mapping> Drop for CaptureWorker<M> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(device = %self.device, "capture thread panicked");
            }
        }
    }
}

fn run<D: CaptureDevice>(
    mut session: CaptureSession<D>,
    tx: &SyncSender<FrameResult<D::Mapping>>,
    stop: &AtomicBool,
    state: &Mutex<SessionState>,
) -> WorkerExit {
    let slice = session.config().poll_slice();
    let backpressure = session.config().backpressure;
    let mut terminal = None;

    while !stop.load(Ordering::Acquire) {
        if backpressure == Backpressure::Block && session.owned_by(Owner::Consumer) > 0 {
            session.wait_recycled(slice);
            continue;
        }

        match session.poll_frame(slice) {
            Ok(None) => {}
            Ok(Some(frame)) => match tx.try_send(Ok(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    if let Ok(frame) = item {
                        debug!(index = frame.index(), "handoff slot full, dropping frame");
                        session.discard(frame);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("frame receiver dropped, stopping capture");
                    break;
                }
            },
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "recoverable capture error");
                // Reported only if the consumer has room for it.
                let _ = tx.try_send(Err(err));
            }
            Err(err) => {
                error!(error = %err, "fatal capture error, stopping");
                terminal = deliver_terminal(tx, err, stop, slice);
                break;
            }
        }
    }

    set_state(state, SessionState::Stopping);
    let stream_off = session.stop().err();
    let stats = session.stats();
    drop(session);
    set_state(state, SessionState::Closed);

    WorkerExit {
        stats,
        error: terminal.or(stream_off),
    }
}

/// Hand a fatal error to the consumer, waiting for the slot to free up
/// unless a stop was requested. Returns the error if it could not be sent.
fn deliver_terminal<M: Mapping>(
    tx: &SyncSender<FrameResult<M>>,
    err: CaptureError,
    stop: &AtomicBool,
    slice: Duration,
) -> Option<CaptureError> {
    let mut pending = Err(err);
    loop {
        match tx.try_send(pending) {
            Ok(()) => return None,
            Err(TrySendError::Disconnected(item)) => return item.err(),
            Err(TrySendError::Full(item)) => {
                if stop.load(Ordering::Acquire) {
                    return item.err();
                }
                pending = item;
                thread::sleep(slice);
            }
        }
    }
}

fn set_state(state: &Mutex<SessionState>, next: SessionState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

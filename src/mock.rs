//! Mock device implementation for testing without hardware.
//!
//! The mock plays the kernel's side of the streaming protocol in memory. A
//! [`MockScript`] injects failures at any protocol step and decides which
//! buffer completes next; a [`MockHandle`] lets tests inspect device state
//! after the session has dropped the device.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::traits::{
    CaptureDevice, DequeuedBuffer, DeviceCapabilities, DeviceProvider, Format, FourCC,
    FrameMetadata, Mapping,
};

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// One scripted buffer completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockCompletion {
    index: Option<u32>,
    bytes_used: Option<u32>,
    error_flag: bool,
}

impl MockCompletion {
    /// Complete whichever buffer the device queued first.
    pub fn next() -> Self {
        Self::default()
    }

    /// Complete buffer `index` specifically.
    pub fn index(index: u32) -> Self {
        Self {
            index: Some(index),
            ..Self::default()
        }
    }

    /// Report `bytes` of payload.
    #[must_use]
    pub const fn bytes(mut self, bytes: u32) -> Self {
        self.bytes_used = Some(bytes);
        self
    }

    /// Set the device error flag.
    #[must_use]
    pub const fn flagged(mut self) -> Self {
        self.error_flag = true;
        self
    }
}

/// Fault injection and behavior script for a mock device.
#[derive(Debug, Clone)]
pub struct MockScript {
    format: Format,
    pattern: TestPattern,
    buffer_size: Option<usize>,
    capabilities: DeviceCapabilities,
    fail_open: bool,
    granted: Option<u32>,
    fail_request: bool,
    fail_map_at: Option<u32>,
    fail_enqueue_calls: Vec<usize>,
    fail_dequeue_calls: Vec<usize>,
    fail_stream_on: bool,
    fail_stream_off: bool,
    stall_after: Option<usize>,
    completions: Vec<MockCompletion>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            format: Format::new(64, 48, FourCC::YUYV),
            pattern: TestPattern::ColorBars,
            buffer_size: None,
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            fail_open: false,
            granted: None,
            fail_request: false,
            fail_map_at: None,
            fail_enqueue_calls: Vec::new(),
            fail_dequeue_calls: Vec::new(),
            fail_stream_on: false,
            fail_stream_off: false,
            stall_after: None,
            completions: Vec::new(),
        }
    }
}

impl MockScript {
    /// Set the initial device format.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the pattern written into mapped buffers.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Override the device-side buffer length.
    #[must_use]
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fail every open.
    #[must_use]
    pub const fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Grant `count` buffers whatever the request.
    #[must_use]
    pub const fn granting(mut self, count: u32) -> Self {
        self.granted = Some(count);
        self
    }

    /// Reject the buffer request.
    #[must_use]
    pub const fn failing_request(mut self) -> Self {
        self.fail_request = true;
        self
    }

    /// Fail mapping buffer `index`.
    #[must_use]
    pub const fn failing_map_at(mut self, index: u32) -> Self {
        self.fail_map_at = Some(index);
        self
    }

    /// Fail the `call`-th enqueue (0-based, counted over the device lifetime).
    #[must_use]
    pub fn failing_enqueue_call(mut self, call: usize) -> Self {
        self.fail_enqueue_calls.push(call);
        self
    }

    /// Fail the `call`-th dequeue (0-based).
    #[must_use]
    pub fn failing_dequeue_call(mut self, call: usize) -> Self {
        self.fail_dequeue_calls.push(call);
        self
    }

    /// Fail stream on.
    #[must_use]
    pub const fn failing_stream_on(mut self) -> Self {
        self.fail_stream_on = true;
        self
    }

    /// Fail stream off.
    #[must_use]
    pub const fn failing_stream_off(mut self) -> Self {
        self.fail_stream_off = true;
        self
    }

    /// Never signal a completed buffer.
    #[must_use]
    pub const fn never_ready(self) -> Self {
        self.stall_after(0)
    }

    /// Stop signalling completed buffers once `dequeues` have been taken.
    #[must_use]
    pub const fn stall_after(mut self, dequeues: usize) -> Self {
        self.stall_after = Some(dequeues);
        self
    }

    /// Script the next completion. Unscripted completions take the oldest
    /// queued buffer with a full payload.
    #[must_use]
    pub fn completing(mut self, completion: MockCompletion) -> Self {
        self.completions.push(completion);
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    opens: usize,
    streaming: bool,
    granted: u32,
    queued: VecDeque<u32>,
    enqueue_log: Vec<u32>,
    enqueue_calls: usize,
    dequeue_calls: usize,
    completions: VecDeque<MockCompletion>,
    sequence: u32,
    live_mappings: usize,
    total_mapped: usize,
    stream_on_calls: usize,
    stream_off_calls: usize,
}

type SharedState = Arc<Mutex<MockState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inspection handle onto a mock device's state.
#[derive(Debug, Clone)]
pub struct MockHandle(SharedState);

impl MockHandle {
    /// Regions currently mapped.
    pub fn live_mappings(&self) -> usize {
        lock(&self.0).live_mappings
    }

    /// Regions mapped over the device lifetime.
    pub fn total_mapped(&self) -> usize {
        lock(&self.0).total_mapped
    }

    /// Every successful enqueue, in call order.
    pub fn enqueue_log(&self) -> Vec<u32> {
        lock(&self.0).enqueue_log.clone()
    }

    /// Buffers currently queued on the device, oldest first.
    pub fn queued(&self) -> Vec<u32> {
        lock(&self.0).queued.iter().copied().collect()
    }

    /// Whether a device handle is open.
    pub fn is_open(&self) -> bool {
        lock(&self.0).open
    }

    /// Number of times the device was opened.
    pub fn opens(&self) -> usize {
        lock(&self.0).opens
    }

    /// Whether the device is streaming.
    pub fn is_streaming(&self) -> bool {
        lock(&self.0).streaming
    }

    /// Stream on calls.
    pub fn stream_on_calls(&self) -> usize {
        lock(&self.0).stream_on_calls
    }

    /// Stream off calls.
    pub fn stream_off_calls(&self) -> usize {
        lock(&self.0).stream_off_calls
    }
}

/// Mapped region backed by heap memory.
#[derive(Debug)]
pub struct MockMapping {
    data: Box<[u8]>,
    state: SharedState,
}

impl Mapping for MockMapping {
    fn base_address(&self) -> usize {
        self.data.as_ptr() as usize
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.live_mappings = state.live_mappings.saturating_sub(1);
    }
}

/// Mock device for testing without hardware.
#[derive(Debug)]
pub struct MockDevice {
    id: String,
    script: MockScript,
    state: SharedState,
}

impl MockDevice {
    /// Open a mock device named `id` driven by `script`.
    pub fn new(id: &str, script: MockScript) -> Self {
        Self::with_state(id, script, SharedState::default())
    }

    fn with_state(id: &str, script: MockScript, state: SharedState) -> Self {
        {
            let mut guard = lock(&state);
            guard.open = true;
            guard.opens += 1;
            guard.streaming = false;
            guard.granted = 0;
            guard.queued.clear();
            guard.completions = script.completions.iter().copied().collect();
        }
        Self {
            id: id.to_owned(),
            script,
            state,
        }
    }

    /// Inspection handle sharing this device's state.
    pub fn stats(&self) -> MockHandle {
        MockHandle(Arc::clone(&self.state))
    }

    fn buffer_size(&self) -> usize {
        self.script
            .buffer_size
            .unwrap_or(self.script.format.size as usize)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.open = false;
        state.streaming = false;
        state.queued.clear();
    }
}

fn einval(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned())
}

impl CaptureDevice for MockDevice {
    type Mapping = MockMapping;

    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.script.capabilities
    }

    fn format(&self) -> io::Result<Format> {
        Ok(self.script.format)
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        self.script.format = *format;
        Ok(self.script.format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut state = lock(&self.state);
        if self.script.fail_request {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        if state.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.granted = if count == 0 {
            0
        } else {
            self.script.granted.unwrap_or(count)
        };
        Ok(state.granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<usize> {
        if index >= lock(&self.state).granted {
            return Err(einval("buffer index beyond granted count"));
        }
        Ok(self.buffer_size())
    }

    fn map_buffer(&mut self, index: u32, length: usize) -> io::Result<MockMapping> {
        if self.script.fail_map_at == Some(index) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        let mut data = generate_test_frame(&self.script.format, self.script.pattern);
        data.resize(length, 0);

        let mut state = lock(&self.state);
        state.live_mappings += 1;
        state.total_mapped += 1;
        drop(state);

        Ok(MockMapping {
            data: data.into_boxed_slice(),
            state: Arc::clone(&self.state),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut state = lock(&self.state);
        let call = state.enqueue_calls;
        state.enqueue_calls += 1;

        if self.script.fail_enqueue_calls.contains(&call) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if index >= state.granted {
            return Err(einval("buffer index beyond granted count"));
        }
        if state.queued.contains(&index) {
            return Err(einval("buffer already queued"));
        }
        state.queued.push_back(index);
        state.enqueue_log.push(index);
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        let ready = {
            let state = lock(&self.state);
            let stalled = self
                .script
                .stall_after
                .is_some_and(|limit| state.dequeue_calls >= limit);
            !stalled && state.streaming && !state.queued.is_empty()
        };
        if !ready {
            std::thread::sleep(timeout);
        }
        Ok(ready)
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut state = lock(&self.state);
        let call = state.dequeue_calls;
        state.dequeue_calls += 1;

        if self.script.fail_dequeue_calls.contains(&call) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if !state.streaming {
            return Err(einval("not streaming"));
        }

        let completion = state.completions.pop_front().unwrap_or_default();
        let index = match completion.index {
            Some(index) => {
                let pos = state
                    .queued
                    .iter()
                    .position(|&queued| queued == index)
                    .ok_or_else(|| einval("scripted buffer is not queued"))?;
                state.queued.remove(pos);
                index
            }
            None => state
                .queued
                .pop_front()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))?,
        };

        let sequence = state.sequence;
        state.sequence += 1;

        #[allow(clippy::cast_possible_truncation)]
        let full = self.buffer_size() as u32;

        Ok(DequeuedBuffer {
            index,
            metadata: FrameMetadata {
                sequence,
                timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
                bytes_used: completion.bytes_used.unwrap_or(full),
            },
            error_flag: completion.error_flag,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.stream_on_calls += 1;
        if self.script.fail_stream_on {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.stream_off_calls += 1;
        state.streaming = false;
        state.queued.clear();
        if self.script.fail_stream_off {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(())
    }
}

/// Opens mock devices that share one inspection handle.
#[derive(Debug, Clone)]
pub struct MockProvider {
    script: MockScript,
    state: SharedState,
}

impl MockProvider {
    /// Provider whose devices follow `script`.
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            state: SharedState::default(),
        }
    }

    /// Inspection handle for every device this provider opens.
    pub fn handle(&self) -> MockHandle {
        MockHandle(Arc::clone(&self.state))
    }
}

impl DeviceProvider for MockProvider {
    type Device = MockDevice;

    fn open(&self, id: &str) -> io::Result<MockDevice> {
        if self.script.fail_open {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        Ok(MockDevice::with_state(
            id,
            self.script.clone(),
            Arc::clone(&self.state),
        ))
    }
}

/// Generate test frame data based on pattern.
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let size = (format.width * format.height * 2) as usize; // YUYV = 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => {
            generate_color_bars(&mut data, format.width, format.height);
        }
        TestPattern::Gradient => {
            generate_gradient(&mut data, format.width, format.height);
        }
        TestPattern::Solid(y, u, v) => {
            generate_solid(&mut data, y, u, v);
        }
    }

    data
}

/// YUYV values of the eight SMPTE bars: White, Yellow, Cyan, Green, Magenta,
/// Red, Blue, Black.
pub const COLOR_BARS_YUV: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let bar_idx = (x / bar_width).min(7) as usize;
            let (y_val, u_val, v_val) = COLOR_BARS_YUV[bar_idx];

            let offset = ((y * width + x) * 2) as usize;
            if let Some(px) = data.get_mut(offset..offset + 4) {
                px.copy_from_slice(&[y_val, u_val, y_val, v_val]);
            }
        }
    }
}

fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            let offset = ((y * width + x) * 2) as usize;

            if let Some(px) = data.get_mut(offset..offset + 4) {
                px.copy_from_slice(&[y_val, 128, y_val, 128]);
            }
        }
    }
}

fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for px in data.chunks_exact_mut(4) {
        px.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new("/dev/mock0", MockScript::default());
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
        assert!(device.stats().is_open());
    }

    #[test]
    fn test_mock_device_format() {
        let mut device = MockDevice::new("/dev/mock0", MockScript::default());
        let format = device.format().expect("format should succeed");
        assert_eq!(format.width, 64);

        let new_format = Format::new(1280, 720, FourCC::YUYV);
        let actual = device
            .set_format(&new_format)
            .expect("set_format should succeed");
        assert_eq!(actual.width, 1280);
        assert_eq!(actual.height, 720);
    }

    #[test]
    fn test_mock_rejects_double_queue() {
        let mut device = MockDevice::new("/dev/mock0", MockScript::default());
        device.request_buffers(2).expect("request should succeed");
        device.queue_buffer(1).expect("first queue should succeed");
        assert!(device.queue_buffer(1).is_err());
        assert_eq!(device.stats().queued(), vec![1]);
    }

    #[test]
    fn test_mock_scripted_completion() {
        let script = MockScript::default().completing(MockCompletion::index(1).bytes(10).flagged());
        let mut device = MockDevice::new("/dev/mock0", script);
        device.request_buffers(2).expect("request should succeed");
        device.queue_buffer(0).expect("queue should succeed");
        device.queue_buffer(1).expect("queue should succeed");
        device.stream_on().expect("stream on should succeed");

        let buf = device.dequeue_buffer().expect("dequeue should succeed");
        assert_eq!(buf.index, 1);
        assert_eq!(buf.metadata.bytes_used, 10);
        assert!(buf.error_flag);
        assert_eq!(device.stats().queued(), vec![0]);
    }

    #[test]
    fn test_drop_closes_device() {
        let device = MockDevice::new("/dev/mock0", MockScript::default());
        let handle = device.stats();
        drop(device);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), (640 * 480 * 2) as usize);
        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = (479 * 640 * 2) as usize;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let format = Format::new(64, 64, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 64, 192));

        assert_eq!(data[0], 128);
        assert_eq!(data[2], 128);
        assert_eq!(data[1], 64);
        assert_eq!(data[3], 192);
    }
}

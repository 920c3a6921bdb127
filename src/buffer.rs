//! Mapped buffers and the pool that owns them.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::traits::{CaptureDevice, Mapping};

/// Who may touch a buffer's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Mapped but held by neither side.
    Idle,
    /// Queued on the device; the device may write into it.
    Device,
    /// Handed to the consumer; read-only until released.
    Consumer,
}

/// One memory region shared with the device.
#[derive(Debug)]
pub struct Buffer<M> {
    index: u32,
    mapping: Arc<M>,
    payload_size: usize,
    owner: Owner,
}

impl<M: Mapping> Buffer<M> {
    fn new(index: u32, mapping: M) -> Self {
        Self {
            index,
            mapping: Arc::new(mapping),
            payload_size: 0,
            owner: Owner::Idle,
        }
    }

    /// Device buffer index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Opaque base address of the mapped region.
    pub fn base_address(&self) -> usize {
        self.mapping.base_address()
    }

    /// Mapped length in bytes.
    pub fn capacity(&self) -> usize {
        self.mapping.len()
    }

    /// Bytes of valid data from the last capture.
    pub const fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Current owner.
    pub const fn owner(&self) -> Owner {
        self.owner
    }

    /// Record the captured length, clamped to the capacity.
    pub(crate) fn set_payload_size(&mut self, bytes: usize) {
        self.payload_size = bytes.min(self.capacity());
    }

    pub(crate) const fn mapping(&self) -> &Arc<M> {
        &self.mapping
    }
}

/// Fixed-size set of mapped buffers negotiated with one device.
#[derive(Debug)]
pub struct BufferPool<M> {
    device: String,
    granted: u32,
    buffers: Vec<Buffer<M>>,
}

impl<M: Mapping> BufferPool<M> {
    /// Empty pool for the device named `device`.
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_owned(),
            granted: 0,
            buffers: Vec::new(),
        }
    }

    /// Ask the device for `requested` buffers and record the granted count.
    pub fn negotiate<D>(&mut self, device: &mut D, requested: u32) -> Result<u32>
    where
        D: CaptureDevice<Mapping = M>,
    {
        if requested == 0 {
            return Err(CaptureError::buffer_request_rejected(
                &self.device,
                "requested zero buffers".to_owned(),
            ));
        }

        let granted = device
            .request_buffers(requested)
            .map_err(|err| CaptureError::buffer_request_failed(&self.device, err))?;

        if granted == 0 {
            return Err(CaptureError::buffer_request_rejected(
                &self.device,
                format!("device granted 0 of {requested} buffers"),
            ));
        }

        if granted != requested {
            debug!(device = %self.device, requested, granted, "device adjusted buffer count");
        }
        self.granted = granted;
        Ok(granted)
    }

    /// Map every granted buffer. All-or-nothing: on failure nothing stays
    /// mapped.
    pub fn map_all<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: CaptureDevice<Mapping = M>,
    {
        if !self.buffers.is_empty() {
            return Ok(());
        }
        if self.granted == 0 {
            return Err(CaptureError::buffer_request_rejected(
                &self.device,
                "pool has not been negotiated".to_owned(),
            ));
        }

        let mut mapped = Vec::with_capacity(self.granted as usize);
        for index in 0..self.granted {
            let mapping = device
                .query_buffer(index)
                .and_then(|length| device.map_buffer(index, length));

            match mapping {
                Ok(mapping) => {
                    debug!(
                        device = %self.device,
                        index,
                        capacity = mapping.len(),
                        "mapped buffer"
                    );
                    mapped.push(Buffer::new(index, mapping));
                }
                Err(err) => {
                    warn!(
                        device = %self.device,
                        index,
                        rolled_back = mapped.len(),
                        "buffer mapping failed"
                    );
                    drop(mapped);
                    return Err(CaptureError::mapping_failed(&self.device, index, err));
                }
            }
        }

        self.buffers = mapped;
        Ok(())
    }

    /// Release every mapped region. Safe to call on an empty pool.
    ///
    /// Regions still held by a consumer frame stay valid until that frame is
    /// dropped.
    pub fn unmap_all(&mut self) {
        if !self.buffers.is_empty() {
            debug!(device = %self.device, count = self.buffers.len(), "unmapping pool");
        }
        self.buffers.clear();
        self.granted = 0;
    }

    /// Buffer at `index`.
    pub fn buffer_at(&self, index: u32) -> Result<&Buffer<M>> {
        self.buffers
            .get(index as usize)
            .ok_or_else(|| CaptureError::index_out_of_range(&self.device, index, self.count()))
    }

    pub(crate) fn buffer_at_mut(&mut self, index: u32) -> Result<&mut Buffer<M>> {
        let count = self.count();
        self.buffers
            .get_mut(index as usize)
            .ok_or_else(|| CaptureError::index_out_of_range(&self.device, index, count))
    }

    /// Number of mapped buffers.
    #[allow(clippy::cast_possible_truncation)]
    pub fn count(&self) -> u32 {
        self.buffers.len() as u32
    }

    /// Count granted by the last successful negotiation.
    pub const fn granted(&self) -> u32 {
        self.granted
    }

    /// Whether no buffer is mapped.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Owner of buffer `index`.
    pub fn owner_of(&self, index: u32) -> Result<Owner> {
        self.buffer_at(index).map(Buffer::owner)
    }

    /// Number of buffers currently held by `owner`.
    pub fn count_owned_by(&self, owner: Owner) -> usize {
        self.buffers.iter().filter(|buf| buf.owner == owner).count()
    }

    /// Indices of buffers currently held by `owner`, in index order.
    pub fn indices_owned_by(&self, owner: Owner) -> Vec<u32> {
        self.buffers
            .iter()
            .filter(|buf| buf.owner == owner)
            .map(Buffer::index)
            .collect()
    }

    pub(crate) fn set_owner(&mut self, index: u32, owner: Owner) -> Result<()> {
        let buffer = self.buffer_at_mut(index)?;
        if owner != Owner::Consumer {
            buffer.payload_size = 0;
        }
        buffer.owner = owner;
        Ok(())
    }

    /// Mark every buffer idle, e.g. after the device dropped its queue.
    pub(crate) fn reclaim_from_device(&mut self) {
        for buffer in &mut self.buffers {
            if buffer.owner == Owner::Device {
                buffer.owner = Owner::Idle;
            }
        }
    }
}

//! Buffer pools feeding the presentation pipeline.

use std::collections::VecDeque;
use std::io;

use smithay::reexports::drm::buffer::{Buffer as _, DrmFourcc};
use smithay::reexports::drm::control::dumbbuffer::DumbBuffer;
use smithay::reexports::drm::control::Device as _;

use crate::backend::kms::{DrmCard, ScanoutSource};

/// Stable identity of a pool slot, used to key the scan-out cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no rendered buffer is ready")]
    NothingReady,
    #[error("every buffer in the pool is in use")]
    Exhausted,
    #[error("buffer allocation failed")]
    Io(#[from] io::Error),
}

/// A small ring of buffers the renderer draws into and the display scans out of.
pub trait BufferPool {
    type Buffer;

    /// Takes the oldest finished buffer for presentation.
    fn acquire(&mut self) -> Result<Self::Buffer, PoolError>;

    /// Hands a buffer back once the display no longer reads from it.
    fn release(&mut self, buffer: Self::Buffer);

    fn id(&self, buffer: &Self::Buffer) -> BufferId;

    fn scanout_source(&self, buffer: &Self::Buffer) -> ScanoutSource;
}

// =============================================================================
// Ring bookkeeping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Ready,
    Acquired,
}

/// Slot states of a fixed-size ring.
#[derive(Debug)]
struct Ring {
    slots: Vec<SlotState>,
    ready: VecDeque<usize>,
}

impl Ring {
    fn new(len: usize) -> Self {
        Self {
            slots: vec![SlotState::Free; len],
            ready: VecDeque::with_capacity(len),
        }
    }

    /// A slot the renderer may draw into.
    ///
    /// When nothing is free, the oldest finished frame that nobody picked up is drawn over.
    fn drawable(&mut self) -> Option<usize> {
        if let Some(slot) = self.slots.iter().position(|s| *s == SlotState::Free) {
            return Some(slot);
        }

        let slot = self.ready.pop_front()?;
        self.slots[slot] = SlotState::Free;
        Some(slot)
    }

    fn mark_ready(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Ready;
        self.ready.push_back(slot);
    }

    fn acquire(&mut self) -> Result<usize, PoolError> {
        match self.ready.pop_front() {
            Some(slot) => {
                self.slots[slot] = SlotState::Acquired;
                Ok(slot)
            }
            None if self.slots.iter().all(|s| *s == SlotState::Acquired) => {
                Err(PoolError::Exhausted)
            }
            None => Err(PoolError::NothingReady),
        }
    }

    fn release(&mut self, slot: usize) {
        match self.slots.get_mut(slot) {
            Some(state @ SlotState::Acquired) => *state = SlotState::Free,
            Some(state) => warn!("releasing slot {slot} that is {state:?}"),
            None => warn!("releasing unknown slot {slot}"),
        }
    }
}

// =============================================================================
// Dumb buffers
// =============================================================================

/// A slot of a [`DumbBufferPool`], handed out by [`BufferPool::acquire`].
#[derive(Debug, PartialEq, Eq)]
pub struct DumbSlot(usize);

/// A ring of CPU-mapped dumb buffers.
pub struct DumbBufferPool {
    buffers: Vec<DumbBuffer>,
    ring: Ring,
    size: (u32, u32),
}

impl DumbBufferPool {
    pub fn new(card: &DrmCard, size: (u32, u32), count: usize) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("DumbBufferPool::new");

        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match card.create_dumb_buffer(size) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    for buffer in buffers {
                        if let Err(err) = card.destroy_dumb_buffer(buffer) {
                            debug!("error destroying dumb buffer: {err:?}");
                        }
                    }
                    return Err(anyhow::Error::new(err)
                        .context(format!("error creating {}x{} dumb buffer", size.0, size.1)));
                }
            }
        }

        debug!("created {count} dumb buffers of {}x{}", size.0, size.1);

        Ok(Self {
            buffers,
            ring: Ring::new(count),
            size,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Renders the next frame into a free buffer and queues it for presentation.
    ///
    /// `draw` gets the mapped pixels (XRGB8888), the row pitch in bytes and the size.
    pub fn draw(
        &mut self,
        card: &DrmCard,
        draw: impl FnOnce(&mut [u8], u32, (u32, u32)),
    ) -> Result<(), PoolError> {
        let _span = tracy_client::span!("DumbBufferPool::draw");

        let slot = self.ring.drawable().ok_or(PoolError::Exhausted)?;
        let buffer = &mut self.buffers[slot];
        let pitch = buffer.pitch();
        let size = self.size;

        let mut mapping = card.map_dumb_buffer(buffer)?;
        draw(mapping.as_mut(), pitch, size);
        drop(mapping);

        self.ring.mark_ready(slot);
        Ok(())
    }

    pub fn destroy(self, card: &DrmCard) {
        for buffer in self.buffers {
            if let Err(err) = card.destroy_dumb_buffer(buffer) {
                debug!("error destroying dumb buffer: {err:?}");
            }
        }
    }
}

impl BufferPool for DumbBufferPool {
    type Buffer = DumbSlot;

    fn acquire(&mut self) -> Result<DumbSlot, PoolError> {
        self.ring.acquire().map(DumbSlot)
    }

    fn release(&mut self, buffer: DumbSlot) {
        self.ring.release(buffer.0);
    }

    fn id(&self, buffer: &DumbSlot) -> BufferId {
        BufferId(buffer.0 as u32)
    }

    fn scanout_source(&self, buffer: &DumbSlot) -> ScanoutSource {
        let dumb = &self.buffers[buffer.0];
        ScanoutSource {
            size: dumb.size(),
            format: DrmFourcc::Xrgb8888,
            pitch: dumb.pitch(),
            handle: dumb.handle(),
        }
    }
}

use std::collections::VecDeque;

use smithay::reexports::drm::control::framebuffer;

use super::pool::BufferId;

/// Framebuffers already registered for pool buffers, oldest first.
#[derive(Debug)]
pub struct ScanoutCache {
    entries: VecDeque<(BufferId, framebuffer::Handle)>,
    capacity: usize,
}

impl ScanoutCache {
    /// Creates an empty cache. The capacity is at least 2: the displayed framebuffer plus the
    /// one being presented.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: BufferId) -> Option<framebuffer::Handle> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, fb)| *fb)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.get(id).is_some()
    }

    pub fn insert(&mut self, id: BufferId, fb: framebuffer::Handle) {
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.push_back((id, fb));
    }

    /// Removes the oldest entries until at most `limit` remain.
    ///
    /// The entry for `displayed` is never removed, so the cache may stay above `limit` by one.
    /// Returns the framebuffers to destroy.
    pub fn evict_over(
        &mut self,
        limit: usize,
        displayed: Option<BufferId>,
    ) -> Vec<framebuffer::Handle> {
        let mut evicted = Vec::new();

        while self.entries.len() > limit {
            let Some(pos) = self
                .entries
                .iter()
                .position(|(entry, _)| Some(*entry) != displayed)
            else {
                break;
            };

            if let Some((_, fb)) = self.entries.remove(pos) {
                evicted.push(fb);
            }
        }

        evicted
    }

    /// Room for one more entry without going over capacity.
    pub fn make_room(&mut self, displayed: Option<BufferId>) -> Vec<framebuffer::Handle> {
        self.evict_over(self.capacity - 1, displayed)
    }

    /// Empties the cache, returning every framebuffer.
    pub fn drain(&mut self) -> Vec<framebuffer::Handle> {
        self.entries.drain(..).map(|(_, fb)| fb).collect()
    }
}

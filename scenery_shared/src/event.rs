//! Resource events.
//!
//! Upload failures and evictions never interrupt a frame; they are queued here and
//! drained by whoever owns the render loop (logging, forwarding to clients).

use std::collections::VecDeque;

use crate::{hash::ContentHash, scene::SceneId};

/// Something noteworthy that happened to a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    /// Reported once per hash, on the first failed attempt.
    UploadFailed { hash: ContentHash, reason: String },
    /// Unloaded from the device. `demoted` means a scene still references it.
    Evicted { hash: ContentHash, bytes: u64, demoted: bool },
    EffectCompiled { hash: ContentHash },
    /// Bytes for a scene's resources could not be provided.
    ResourcesMissing { scene: SceneId, hashes: Vec<ContentHash> },
    /// More was uploaded than the cache size allows and nothing was evictable.
    CacheBudgetExceeded { uploaded_bytes: u64, budget: u64 },
}

/// Bounded FIFO of [`ResourceEvent`]s. When full, the oldest event is dropped.
#[derive(Debug)]
pub struct EventBus {
    queue: VecDeque<ResourceEvent>,
    capacity: usize,
    dropped: u64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: ResourceEvent) {
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(event);
    }

    /// Takes all queued events, oldest first.
    pub fn drain(&mut self) -> Vec<ResourceEvent> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Events lost to the capacity limit so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_order() {
        let mut bus = EventBus::default();
        bus.push(ResourceEvent::EffectCompiled { hash: ContentHash::new(1, 0) });
        bus.push(ResourceEvent::EffectCompiled { hash: ContentHash::new(2, 0) });
        let events = bus.drain();
        assert_eq!(
            events,
            vec![
                ResourceEvent::EffectCompiled { hash: ContentHash::new(1, 0) },
                ResourceEvent::EffectCompiled { hash: ContentHash::new(2, 0) },
            ]
        );
        assert!(bus.is_empty());
    }

    #[test]
    fn drops_oldest_when_full() {
        let mut bus = EventBus::with_capacity(2);
        for i in 0..3 {
            bus.push(ResourceEvent::EffectCompiled { hash: ContentHash::new(i, 0) });
        }
        assert_eq!(bus.dropped(), 1);
        assert_eq!(
            bus.drain()[0],
            ResourceEvent::EffectCompiled { hash: ContentHash::new(1, 0) }
        );
    }
}

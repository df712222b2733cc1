//! Tracking of in-flight resource requests.
//!
//! Several requesters may want the same hash; the hash goes on the wire once and
//! stays wanted until the last requester cancels or the bytes arrive.

use std::collections::{BTreeMap, BTreeSet};

use crate::{hash::ContentHash, scene::SceneId};

/// Pending requests keyed by hash, with the set of requesters for each.
#[derive(Debug, Clone)]
pub struct ResourceRequests<R = SceneId> {
    pending: BTreeMap<ContentHash, BTreeSet<R>>,
}

impl<R> Default for ResourceRequests<R> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<R: Ord + Copy> ResourceRequests<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records interest of `requester`. Returns the hashes nobody had asked for yet,
    /// i.e. the ones that actually need requesting.
    pub fn request(&mut self, hashes: &[ContentHash], requester: R) -> Vec<ContentHash> {
        let mut fresh = Vec::new();
        for hash in hashes {
            let requesters = self.pending.entry(*hash).or_default();
            if requesters.is_empty() {
                fresh.push(*hash);
            }
            requesters.insert(requester);
        }
        fresh
    }

    /// Withdraws one requester's interest in `hash`.
    ///
    /// Returns `true` when that leaves nobody waiting for it. A no-op returning
    /// `false` if the request already completed or was never made.
    pub fn cancel_resource_request(&mut self, hash: ContentHash, requester: R) -> bool {
        let Some(requesters) = self.pending.get_mut(&hash) else {
            return false;
        };
        if !requesters.remove(&requester) {
            return false;
        }
        if requesters.is_empty() {
            self.pending.remove(&hash);
            return true;
        }
        false
    }

    /// Cancels everything `requester` asked for. Returns hashes nobody wants anymore.
    pub fn cancel_all(&mut self, requester: R) -> Vec<ContentHash> {
        let hashes: Vec<ContentHash> = self
            .pending
            .iter()
            .filter(|(_, reqs)| reqs.contains(&requester))
            .map(|(hash, _)| *hash)
            .collect();
        hashes
            .into_iter()
            .filter(|hash| self.cancel_resource_request(*hash, requester))
            .collect()
    }

    /// Marks `hash` as delivered and returns who was waiting for it.
    pub fn complete(&mut self, hash: ContentHash) -> Vec<R> {
        self.pending
            .remove(&hash)
            .map(|reqs| reqs.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn is_pending(&self, hash: ContentHash) -> bool {
        self.pending.contains_key(&hash)
    }

    pub fn requesters(&self, hash: ContentHash) -> Vec<R> {
        self.pending
            .get(&hash)
            .map(|reqs| reqs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Hashes still waiting for bytes.
    pub fn pending_hashes(&self) -> Vec<ContentHash> {
        self.pending.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

//! In-memory, content-addressed resource storage.
//!
//! Each entry counts two kinds of interest independently:
//! - [`ManagedResource`] handles, which keep the bytes alive.
//! - [`ResourceHashUsage`] handles, which only keep the hash (and its summary info)
//!   known, e.g. for a resource that lives in a file or has not arrived yet.
//!
//! An entry exists exactly as long as either count is non-zero. All count
//! transitions go through one mutex, so "last reference dropped" is observed once
//! no matter which thread drops it.

use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tracing::{error, trace};

use crate::{
    error::{ResourceError, ResourceResult},
    hash::ContentHash,
    resource::{Resource, ResourceInfo},
};

/// Which of the two counters a handle holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefKind {
    Managed,
    HashUsage,
}

struct Entry {
    resource: Option<Arc<Resource>>,
    ref_count: usize,
    hash_usages: usize,
    info: Option<ResourceInfo>,
    deletion_allowed: bool,
    resident_bytes: usize,
}

impl Entry {
    fn empty() -> Self {
        Self {
            resource: None,
            ref_count: 0,
            hash_usages: 0,
            info: None,
            deletion_allowed: true,
            resident_bytes: 0,
        }
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<ContentHash, Entry>,
    resident_bytes: usize,
}

#[derive(Default)]
pub(crate) struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, hash: ContentHash, kind: RefKind) {
        let mut state = self.lock();
        match state.entries.get_mut(&hash) {
            Some(entry) => match kind {
                RefKind::Managed => entry.ref_count += 1,
                RefKind::HashUsage => entry.hash_usages += 1,
            },
            None => {
                debug_assert!(false, "handle for {hash} outlived its entry");
                error!(%hash, ?kind, "handle outlived its storage entry");
            }
        }
    }

    /// Brings the entry's share of the running total in line with its resident form.
    fn remeasure(&self, hash: ContentHash) {
        let mut guard = self.lock();
        let State {
            entries,
            resident_bytes,
        } = &mut *guard;
        let Some(entry) = entries.get_mut(&hash) else {
            return;
        };
        let Some(resource) = &entry.resource else {
            return;
        };
        let size = resource.resident_size();
        *resident_bytes = *resident_bytes - entry.resident_bytes + size;
        if size != entry.resident_bytes {
            trace!(%hash, from = entry.resident_bytes, to = size, "resident size changed");
        }
        entry.resident_bytes = size;
    }

    /// Drops one reference of `kind`. A no-op if the entry is already gone.
    fn release(&self, hash: ContentHash, kind: RefKind) {
        let mut freed = Vec::new();
        {
            let mut guard = self.lock();
            let State {
                entries,
                resident_bytes,
            } = &mut *guard;
            let Some(entry) = entries.get_mut(&hash) else {
                trace!(%hash, ?kind, "release on removed entry");
                return;
            };

            let counter = match kind {
                RefKind::Managed => &mut entry.ref_count,
                RefKind::HashUsage => &mut entry.hash_usages,
            };
            if *counter == 0 {
                debug_assert!(false, "{kind:?} count underflow for {hash}");
                error!(%hash, ?kind, "reference count underflow");
                return;
            }
            *counter -= 1;

            if kind == RefKind::Managed && entry.ref_count == 0 && entry.deletion_allowed {
                if let Some(res) = entry.resource.take() {
                    *resident_bytes -= entry.resident_bytes;
                    entry.resident_bytes = 0;
                    freed.push(res);
                    trace!(%hash, "resource bytes released");
                }
            }

            if entry.ref_count == 0 && entry.hash_usages == 0 {
                if let Some(removed) = entries.remove(&hash) {
                    *resident_bytes -= removed.resident_bytes;
                    freed.extend(removed.resource);
                    trace!(%hash, "storage entry removed");
                }
            }
        }
        // Resources are dropped after the lock is released.
        drop(freed);
    }
}

/// Reference counts of one storage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryCounts {
    pub managed: usize,
    pub hash_usages: usize,
    /// Whether the bytes are in memory.
    pub resident: bool,
}

/// Thread-safe resource storage. Cloning shares the same storage.
#[derive(Clone, Default)]
pub struct ResourceStorage {
    shared: Arc<Shared>,
}

impl ResourceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a claim on `resource`, deduplicating by content hash.
    ///
    /// If the hash is already resident the existing object is handed out and
    /// `resource` is dropped; its content is assumed identical and not compared.
    /// With `deletion_allowed == false` the bytes are pinned until the entry goes away
    /// instead of being released when the last managed handle drops.
    pub fn manage(&self, resource: Arc<Resource>, deletion_allowed: bool) -> ManagedResource {
        let hash = resource.hash();
        let info = resource.info();
        let size = resource.resident_size();

        let mut guard = self.shared.lock();
        let State {
            entries,
            resident_bytes,
        } = &mut *guard;
        let entry = entries.entry(hash).or_insert_with(Entry::empty);
        let held = match &entry.resource {
            Some(existing) => {
                entry.deletion_allowed &= deletion_allowed;
                existing.clone()
            }
            None => {
                entry.resource = Some(resource.clone());
                entry.resident_bytes = size;
                entry.deletion_allowed = deletion_allowed;
                *resident_bytes += size;
                resource
            }
        };
        entry.info.get_or_insert(info);
        entry.ref_count += 1;
        trace!(%hash, refs = entry.ref_count, "manage");

        ManagedResource {
            shared: self.shared.clone(),
            resource: held,
            hash,
        }
    }

    /// Handle to a resident resource. Never creates an entry.
    pub fn get(&self, hash: ContentHash) -> Option<ManagedResource> {
        let mut state = self.shared.lock();
        let entry = state.entries.get_mut(&hash)?;
        let resource = entry.resource.clone()?;
        entry.ref_count += 1;
        Some(ManagedResource {
            shared: self.shared.clone(),
            resource,
            hash,
        })
    }

    /// Declares interest in a hash, creating a bytes-less entry if needed.
    pub fn get_hash_usage(&self, hash: ContentHash) -> ResourceHashUsage {
        let mut state = self.shared.lock();
        let entry = state.entries.entry(hash).or_insert_with(Entry::empty);
        entry.hash_usages += 1;
        ResourceHashUsage {
            shared: self.shared.clone(),
            hash,
        }
    }

    /// Like [`get_hash_usage`](Self::get_hash_usage) and also records the summary
    /// info if the entry has none yet.
    pub fn get_hash_usage_with_info(&self, info: ResourceInfo) -> ResourceHashUsage {
        let mut state = self.shared.lock();
        let entry = state.entries.entry(info.hash).or_insert_with(Entry::empty);
        entry.hash_usages += 1;
        entry.info.get_or_insert(info);
        ResourceHashUsage {
            shared: self.shared.clone(),
            hash: info.hash,
        }
    }

    /// Summary info, available even when the bytes are not resident.
    pub fn resource_info(&self, hash: ContentHash) -> ResourceResult<ResourceInfo> {
        let state = self.shared.lock();
        let entry = state.entries.get(&hash).ok_or(ResourceError::NotFound(hash))?;
        if let Some(info) = entry.info {
            return Ok(info);
        }
        match &entry.resource {
            Some(res) => Ok(res.info()),
            None => Err(ResourceError::NotFound(hash)),
        }
    }

    pub fn contains(&self, hash: ContentHash) -> bool {
        self.shared.lock().entries.contains_key(&hash)
    }

    pub fn is_resident(&self, hash: ContentHash) -> bool {
        self.shared
            .lock()
            .entries
            .get(&hash)
            .is_some_and(|e| e.resource.is_some())
    }

    pub fn counts(&self, hash: ContentHash) -> Option<EntryCounts> {
        self.shared.lock().entries.get(&hash).map(|e| EntryCounts {
            managed: e.ref_count,
            hash_usages: e.hash_usages,
            resident: e.resource.is_some(),
        })
    }

    /// Number of entries, resident or not.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Running total of bytes held by resident resources.
    pub fn resident_bytes(&self) -> usize {
        self.shared.lock().resident_bytes
    }

    /// Handles to every resident resource, ordered by hash.
    pub fn resources(&self) -> Vec<ManagedResource> {
        let mut state = self.shared.lock();
        let mut out: Vec<ManagedResource> = state
            .entries
            .iter_mut()
            .filter_map(|(hash, entry)| {
                let resource = entry.resource.clone()?;
                entry.ref_count += 1;
                Some(ManagedResource {
                    shared: self.shared.clone(),
                    resource,
                    hash: *hash,
                })
            })
            .collect();
        drop(state);
        out.sort_by_key(|m| m.hash);
        out
    }

    /// Pre-sizes the table for `additional` more entries.
    pub fn reserve(&self, additional: usize) {
        self.shared.lock().entries.reserve(additional);
    }
}

/// Shared claim on resident resource bytes.
///
/// Cloning takes another claim; dropping the last claim lets storage release the
/// bytes (or the whole entry). Change the resident form through this handle, not
/// through the inner [`Resource`], so storage keeps counting the right bytes.
pub struct ManagedResource {
    shared: Arc<Shared>,
    resource: Arc<Resource>,
    hash: ContentHash,
}

impl ManagedResource {
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// [`Resource::compress`], keeping the storage byte total current.
    pub fn compress(&self) -> bool {
        let compressed = self.resource.compress();
        self.shared.remeasure(self.hash);
        compressed
    }

    /// [`Resource::decompress`], keeping the storage byte total current.
    pub fn decompress(&self) -> ResourceResult<()> {
        let result = self.resource.decompress();
        self.shared.remeasure(self.hash);
        result
    }

    /// [`Resource::decompressed_data`], keeping the storage byte total current.
    pub fn decompressed_data(&self) -> ResourceResult<Bytes> {
        let data = self.resource.decompressed_data();
        self.shared.remeasure(self.hash);
        data
    }
}

impl Deref for ManagedResource {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Clone for ManagedResource {
    fn clone(&self) -> Self {
        self.shared.acquire(self.hash, RefKind::Managed);
        Self {
            shared: self.shared.clone(),
            resource: self.resource.clone(),
            hash: self.hash,
        }
    }
}

impl Drop for ManagedResource {
    fn drop(&mut self) {
        self.shared.release(self.hash, RefKind::Managed);
    }
}

impl PartialEq for ManagedResource {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && Arc::ptr_eq(&self.resource, &other.resource)
    }
}

impl fmt::Debug for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedResource")
            .field("hash", &self.hash)
            .field("type", &self.resource.resource_type())
            .finish()
    }
}

/// Shared claim on a hash identity, independent of resident bytes.
pub struct ResourceHashUsage {
    shared: Arc<Shared>,
    hash: ContentHash,
}

impl ResourceHashUsage {
    pub fn hash(&self) -> ContentHash {
        self.hash
    }
}

impl Clone for ResourceHashUsage {
    fn clone(&self) -> Self {
        self.shared.acquire(self.hash, RefKind::HashUsage);
        Self {
            shared: self.shared.clone(),
            hash: self.hash,
        }
    }
}

impl Drop for ResourceHashUsage {
    fn drop(&mut self) {
        self.shared.release(self.hash, RefKind::HashUsage);
    }
}

impl fmt::Debug for ResourceHashUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceHashUsage").field(&self.hash).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceType;

    fn res(fill: u8, len: usize) -> Arc<Resource> {
        Arc::new(Resource::new(
            ResourceType::VertexArray,
            vec![fill; len],
            bytes::Bytes::new(),
            0,
            "array",
        ))
    }

    #[test]
    fn manage_twice_deduplicates() {
        let storage = ResourceStorage::new();
        let a = storage.manage(res(1, 32), true);
        let b = storage.manage(res(1, 32), true);
        assert_eq!(a.hash(), b.hash());
        assert!(Arc::ptr_eq(a.resource(), b.resource()));
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.counts(a.hash()).unwrap().managed, 2);
        assert_eq!(storage.resident_bytes(), 32);
    }

    #[test]
    fn clone_and_drop_track_ref_count() {
        let storage = ResourceStorage::new();
        let a = storage.manage(res(2, 8), true);
        let hash = a.hash();
        let b = a.clone();
        assert_eq!(storage.counts(hash).unwrap().managed, 2);
        drop(a);
        assert_eq!(storage.counts(hash).unwrap().managed, 1);
        drop(b);
        assert!(!storage.contains(hash));
        assert_eq!(storage.resident_bytes(), 0);
    }

    #[test]
    fn get_never_creates() {
        let storage = ResourceStorage::new();
        assert!(storage.get(ContentHash::new(1, 2)).is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn hash_usage_keeps_entry_without_bytes() {
        let storage = ResourceStorage::new();
        let managed = storage.manage(res(3, 16), true);
        let hash = managed.hash();
        let usage = storage.get_hash_usage(hash);
        drop(managed);

        let counts = storage.counts(hash).unwrap();
        assert_eq!(counts.managed, 0);
        assert_eq!(counts.hash_usages, 1);
        assert!(!counts.resident);
        assert!(storage.get(hash).is_none());
        assert_eq!(storage.resident_bytes(), 0);
        // Summary survives the bytes.
        assert_eq!(storage.resource_info(hash).unwrap().decompressed_size, 16);

        drop(usage);
        assert!(!storage.contains(hash));
    }

    #[test]
    fn resident_bytes_follow_compression() {
        let storage = ResourceStorage::new();
        let managed = storage.manage(res(5, 4096), true);
        let other = storage.manage(res(6, 100), true);
        assert_eq!(storage.resident_bytes(), 4196);

        assert!(managed.compress());
        let compressed = managed.resident_size();
        assert!(compressed < 4096);
        assert_eq!(storage.resident_bytes(), compressed + 100);

        let data = storage.get(managed.hash()).unwrap().decompressed_data().unwrap();
        assert_eq!(data.len(), 4096);
        assert_eq!(storage.resident_bytes(), 4196);

        assert!(managed.compress());
        drop(managed);
        assert_eq!(storage.resident_bytes(), 100);
        drop(other);
        assert_eq!(storage.resident_bytes(), 0);
    }

    #[test]
    fn pinned_resource_keeps_bytes_while_hash_is_used() {
        let storage = ResourceStorage::new();
        let managed = storage.manage(res(4, 16), false);
        let hash = managed.hash();
        let usage = storage.get_hash_usage(hash);
        drop(managed);
        assert!(storage.is_resident(hash));
        let again = storage.get(hash).unwrap();
        assert_eq!(again.decompressed_size(), 16);
        drop(again);
        drop(usage);
        assert!(!storage.contains(hash));
    }

    #[test]
    fn manage_reattaches_bytes_to_metadata_only_entry() {
        let storage = ResourceStorage::new();
        let hash = res(5, 10).hash();
        let usage = storage.get_hash_usage(hash);
        assert!(storage.resource_info(hash).is_err());
        let managed = storage.manage(res(5, 10), true);
        assert!(storage.is_resident(hash));
        assert_eq!(storage.counts(hash).unwrap().hash_usages, 1);
        assert_eq!(storage.resident_bytes(), 10);
        drop(managed);
        drop(usage);
        assert!(storage.is_empty());
    }

    #[test]
    fn resources_lists_only_resident_in_hash_order() {
        let storage = ResourceStorage::new();
        let a = storage.manage(res(1, 4), true);
        let b = storage.manage(res(2, 4), true);
        let _usage = storage.get_hash_usage(ContentHash::new(9, 9));
        let listed = storage.resources();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].hash() < listed[1].hash());
        drop(listed);
        assert_eq!(storage.counts(a.hash()).unwrap().managed, 1);
        assert_eq!(storage.counts(b.hash()).unwrap().managed, 1);
    }

    #[test]
    fn entry_exists_iff_some_count_is_positive() {
        let storage = ResourceStorage::new();
        let hash = res(6, 8).hash();
        let mut managed: Vec<ManagedResource> = Vec::new();
        let mut usages: Vec<ResourceHashUsage> = Vec::new();
        // Deterministic pseudo-random interleaving.
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            match (seed >> 16) % 6 {
                0 => managed.push(storage.manage(res(6, 8), true)),
                1 => {
                    if let Some(m) = managed.first() {
                        managed.push(m.clone());
                    }
                }
                2 => usages.push(storage.get_hash_usage(hash)),
                3 => {
                    if let Some(u) = usages.last() {
                        usages.push(u.clone());
                    }
                }
                4 => {
                    managed.pop();
                }
                _ => {
                    usages.pop();
                }
            }
            let alive = !managed.is_empty() || !usages.is_empty();
            assert_eq!(storage.contains(hash), alive);
            if let Some(c) = storage.counts(hash) {
                assert_eq!(c.managed, managed.len());
                assert_eq!(c.hash_usages, usages.len());
            }
        }
        managed.clear();
        usages.clear();
        assert!(storage.is_empty());
    }

    #[test]
    fn concurrent_clone_and_drop_is_linearized() {
        let storage = ResourceStorage::new();
        let root = storage.manage(res(7, 64), true);
        let usage = storage.get_hash_usage(root.hash());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = root.clone();
                let u = usage.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let a = m.clone();
                        let b = u.clone();
                        drop(a);
                        drop(b);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let counts = storage.counts(root.hash()).unwrap();
        assert_eq!(counts.managed, 1);
        assert_eq!(counts.hash_usages, 1);
        drop(root);
        drop(usage);
        assert!(storage.is_empty());
    }
}

//! Resource component: the one entry point scene and network code use.
//!
//! Composes [`ResourceStorage`] with the [`ResourceFilesRegistry`]:
//! - producers hand over bytes with [`manage_resource`](ResourceComponent::manage_resource)
//! - consumers look hashes up, loading them from registered files on first need
//! - whole batches resolve with partial success and a single warning for misses
//!
//! # Usage
//! ```ignore
//! let component = ResourceComponent::new();
//! let handle = component.open_resource_file(Path::new("resources/scene.res"))?;
//! let loaded = component.resolve_resources(&[texture_hash, effect_hash]);
//! ```

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::{ResourceError, ResourceResult},
    files::{open_with_toc, InputStreamContainer, ResourceFileHandle, ResourceFilesRegistry},
    hash::ContentHash,
    persistation::{retrieve_resource, write_named_resources_with_toc},
    resource::{Resource, ResourceInfo},
    storage::{ManagedResource, ResourceHashUsage, ResourceStorage},
    toc::TableOfContents,
};

/// Counters kept by the component.
#[derive(Debug, Default)]
struct Counters {
    loaded_from_file: AtomicU64,
    resolve_misses: AtomicU64,
}

/// Snapshot of [`ResourceComponent`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceStatistics {
    pub loaded_from_file: u64,
    pub resolve_misses: u64,
}

#[derive(Default)]
pub struct ResourceComponent {
    storage: ResourceStorage,
    files: Mutex<ResourceFilesRegistry>,
    counters: Counters,
}

impl ResourceComponent {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, ResourceFilesRegistry> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn storage(&self) -> &ResourceStorage {
        &self.storage
    }

    pub fn manage_resource(&self, resource: Resource, deletion_allowed: bool) -> ManagedResource {
        self.storage.manage(Arc::new(resource), deletion_allowed)
    }

    /// Same as [`manage_resource`](Self::manage_resource) for an already shared resource.
    pub fn manage_shared_resource(
        &self,
        resource: Arc<Resource>,
        deletion_allowed: bool,
    ) -> ManagedResource {
        self.storage.manage(resource, deletion_allowed)
    }

    /// Resident resource, without touching files.
    pub fn get_resource(&self, hash: ContentHash) -> Option<ManagedResource> {
        self.storage.get(hash)
    }

    /// Resident resource, or loaded synchronously from the first file that has it.
    pub fn force_load_resource(&self, hash: ContentHash) -> ResourceResult<ManagedResource> {
        if let Some(resident) = self.storage.get(hash) {
            return Ok(resident);
        }
        let location = self
            .files()
            .get_entry(hash)
            .ok_or(ResourceError::NotFound(hash))?;

        let resource = {
            let mut stream = location.stream.lock();
            retrieve_resource(&mut *stream, &location.entry)?
        };
        self.counters.loaded_from_file.fetch_add(1, Ordering::Relaxed);
        debug!(%hash, file = %location.stream.name(), size = location.entry.size, "resource loaded from file");
        Ok(self.storage.manage(Arc::new(resource), true))
    }

    /// Hash usage for a hash known to storage or to a registered file.
    pub fn get_resource_hash_usage(&self, hash: ContentHash) -> ResourceResult<ResourceHashUsage> {
        if self.storage.contains(hash) || self.files().contains(hash) {
            Ok(self.storage.get_hash_usage(hash))
        } else {
            Err(ResourceError::NotFound(hash))
        }
    }

    /// Hash usage for a hash that may not have arrived anywhere yet.
    pub fn declare_hash_usage(&self, hash: ContentHash) -> ResourceHashUsage {
        self.storage.get_hash_usage(hash)
    }

    pub fn get_resource_info(&self, hash: ContentHash) -> ResourceResult<ResourceInfo> {
        self.storage.resource_info(hash)
    }

    /// Registers an opened stream with its already-read index.
    pub fn add_resource_file(
        &self,
        stream: Arc<InputStreamContainer>,
        toc: TableOfContents,
    ) -> ResourceFileHandle {
        self.files()
            .register_resource_file(stream, toc, &self.storage)
    }

    /// Opens `path`, reads its index and registers it. Nothing is registered on error.
    pub fn open_resource_file(&self, path: &Path) -> ResourceResult<ResourceFileHandle> {
        let (stream, toc) = open_with_toc(path)?;
        Ok(self.add_resource_file(stream, toc))
    }

    pub fn remove_resource_file(&self, handle: ResourceFileHandle) -> bool {
        self.files().unregister_resource_file(handle)
    }

    pub fn has_resource_file(&self, handle: ResourceFileHandle) -> bool {
        self.files().has_resource_file(handle)
    }

    pub fn resource_file_handles(&self, name: &str) -> Vec<ResourceFileHandle> {
        self.files().find_by_name(name)
    }

    /// Loads every entry of `handle` that someone besides the file registry has
    /// declared interest in. Returns handles to what is now resident.
    pub fn load_resource_from_file(
        &self,
        handle: ResourceFileHandle,
    ) -> ResourceResult<Vec<ManagedResource>> {
        let wanted: Vec<ContentHash> = {
            let files = self.files();
            let Some(toc) = files.table_of_contents(handle) else {
                return Ok(Vec::new());
            };
            toc.hashes()
                .filter(|hash| {
                    self.storage.counts(*hash).is_some_and(|c| {
                        !c.resident && c.hash_usages > files.registration_count(*hash)
                    })
                })
                .collect()
        };
        wanted
            .into_iter()
            .map(|hash| self.force_load_resource(hash))
            .collect()
    }

    /// Resolves a batch: resident hashes directly, the rest from registered files.
    ///
    /// Hashes found nowhere are left out of the result; the batch logs one warning.
    pub fn resolve_resources(&self, hashes: &[ContentHash]) -> Vec<ManagedResource> {
        let mut resolved = Vec::with_capacity(hashes.len());
        let mut missing: Vec<ContentHash> = Vec::new();
        let mut last_error: Option<ResourceError> = None;
        for hash in hashes {
            match self.force_load_resource(*hash) {
                Ok(res) => resolved.push(res),
                Err(e) => {
                    missing.push(*hash);
                    last_error = Some(e);
                }
            }
        }
        if let (Some(first), Some(err)) = (missing.first(), last_error) {
            self.counters
                .resolve_misses
                .fetch_add(missing.len() as u64, Ordering::Relaxed);
            warn!(
                missing = missing.len(),
                requested = hashes.len(),
                first = %first,
                error = %err,
                "could not resolve all requested resources"
            );
        }
        resolved
    }

    pub fn reserve_resource_count(&self, additional: usize) {
        self.storage.reserve(additional);
    }

    /// Handles to all resident resources.
    pub fn resources(&self) -> Vec<ManagedResource> {
        self.storage.resources()
    }

    /// Writes `resources` to a new file at `path`.
    pub fn write_resource_file(
        &self,
        path: &Path,
        resources: &[ManagedResource],
        compress: bool,
    ) -> ResourceResult<TableOfContents> {
        let file = File::create(path)
            .map_err(|e| ResourceError::io(format!("create {}", path.display()), e))?;
        let mut out = BufWriter::new(file);
        let toc = write_named_resources_with_toc(&mut out, resources, compress)?;
        out.flush()
            .map_err(|e| ResourceError::io(format!("flush {}", path.display()), e))?;
        Ok(toc)
    }

    pub fn statistics(&self) -> ResourceStatistics {
        ResourceStatistics {
            loaded_from_file: self.counters.loaded_from_file.load(Ordering::Relaxed),
            resolve_misses: self.counters.resolve_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, SeekFrom};

    use super::*;
    use crate::resource::ResourceType;

    fn texture() -> Resource {
        let pixels: Vec<u8> = (0..2000u32).map(|i| (i % 7) as u8).collect();
        Resource::new(ResourceType::Texture2D, pixels, &b"rgba8 25x20"[..], 1, "T")
    }

    fn effect() -> Resource {
        Resource::new(ResourceType::Effect, vec![b'v'; 500], &b"attr a_pos"[..], 1, "E")
    }

    /// Bytes of a file holding T and E. Storage is left empty.
    fn file_bytes(component: &ResourceComponent) -> (Vec<u8>, ContentHash, ContentHash) {
        let t = component.manage_resource(texture(), true);
        let e = component.manage_resource(effect(), true);
        let (th, eh) = (t.hash(), e.hash());
        let mut out = Cursor::new(Vec::new());
        write_named_resources_with_toc(&mut out, &[t, e], true).unwrap();
        (out.into_inner(), th, eh)
    }

    fn open_memory_file(bytes: &[u8]) -> (Arc<InputStreamContainer>, TableOfContents) {
        let mut stream = Cursor::new(bytes.to_vec());
        stream.seek(SeekFrom::Start(0)).unwrap();
        let toc = TableOfContents::read_from_stream(&mut stream).unwrap();
        (Arc::new(InputStreamContainer::new("F", stream)), toc)
    }

    /// Writes T and E into an in-memory file and returns it unregistered.
    fn memory_file(component: &ResourceComponent) -> (Arc<InputStreamContainer>, TableOfContents, ContentHash, ContentHash) {
        let (bytes, th, eh) = file_bytes(component);
        let (stream, toc) = open_memory_file(&bytes);
        (stream, toc, th, eh)
    }

    #[test]
    fn resolves_from_file_and_cleans_up() {
        let component = ResourceComponent::new();
        let (bytes, th, eh) = file_bytes(&component);
        assert!(component.storage().is_empty());

        let (stream, toc) = open_memory_file(&bytes);
        let handle = component.add_resource_file(stream.clone(), toc);
        assert_eq!(Arc::strong_count(&stream), 2);
        let resolved = component.resolve_resources(&[th, eh]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(component.statistics().loaded_from_file, 2);
        assert_eq!(resolved[0].hash(), th);
        assert_eq!(component.storage().counts(th).unwrap().managed, 1);
        assert_eq!(Arc::strong_count(&stream), 2);

        drop(resolved);
        assert!(component.remove_resource_file(handle));
        assert!(component.storage().is_empty());
        assert_eq!(Arc::strong_count(&stream), 1);

        // Registering F again costs one new stream and serves T from it.
        let (reopened, toc) = open_memory_file(&bytes);
        let handle = component.add_resource_file(reopened.clone(), toc);
        let t = component.resolve_resources(&[th]);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].hash(), th);
        assert_eq!(t[0].decompressed_data().unwrap(), texture().decompressed_data().unwrap());
        assert_eq!(component.statistics().loaded_from_file, 3);
        assert_eq!(Arc::strong_count(&reopened), 2);
        assert!(!component.storage().is_resident(eh));

        drop(t);
        assert!(component.remove_resource_file(handle));
        assert!(component.storage().is_empty());
        assert_eq!(Arc::strong_count(&reopened), 1);
    }

    #[test]
    fn resolve_omits_unknown_hashes() {
        let component = ResourceComponent::new();
        let (stream, toc, th, _) = memory_file(&component);
        component.add_resource_file(stream, toc);
        let unknown = ContentHash::new(42, 42);
        let resolved = component.resolve_resources(&[unknown, th, ContentHash::new(43, 0)]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].hash(), th);
        assert_eq!(component.statistics().resolve_misses, 2);
    }

    #[test]
    fn resident_resources_are_not_reloaded() {
        let component = ResourceComponent::new();
        let (stream, toc, _, _) = memory_file(&component);
        component.add_resource_file(stream, toc);
        let held = component.manage_resource(texture(), true);
        let resolved = component.force_load_resource(held.hash()).unwrap();
        assert_eq!(resolved, held);
        assert_eq!(component.statistics().loaded_from_file, 0);
    }

    #[test]
    fn unknown_hash_is_not_found() {
        let component = ResourceComponent::new();
        let hash = ContentHash::new(1, 2);
        assert!(matches!(
            component.force_load_resource(hash),
            Err(ResourceError::NotFound(h)) if h == hash
        ));
        assert!(matches!(
            component.get_resource_hash_usage(hash),
            Err(ResourceError::NotFound(_))
        ));
        assert!(component.get_resource_info(hash).is_err());
        let declared = component.declare_hash_usage(hash);
        assert!(component.get_resource_hash_usage(hash).is_ok());
        drop(declared);
    }

    #[test]
    fn info_survives_dropping_loaded_bytes() {
        let component = ResourceComponent::new();
        let (stream, toc, th, _) = memory_file(&component);
        component.add_resource_file(stream, toc);
        let loaded = component.force_load_resource(th).unwrap();
        drop(loaded);
        assert!(component.get_resource(th).is_none());
        let info = component.get_resource_info(th).unwrap();
        assert_eq!(info.decompressed_size, 2000);
        assert!(info.is_compressed());
        // Still loadable a second time.
        assert!(component.force_load_resource(th).is_ok());
        assert_eq!(component.statistics().loaded_from_file, 2);
    }

    #[test]
    fn keeps_resource_when_file_removed_but_hash_still_used() {
        let component = ResourceComponent::new();
        let (stream, toc, th, _) = memory_file(&component);
        let handle = component.add_resource_file(stream, toc);
        let usage = component.get_resource_hash_usage(th).unwrap();
        let loaded = component.force_load_resource(th).unwrap();
        component.remove_resource_file(handle);
        assert!(component.get_resource(th).is_some());
        drop(loaded);
        assert!(component.storage().contains(th));
        assert!(component.get_resource(th).is_none());
        drop(usage);
        assert!(!component.storage().contains(th));
    }

    #[test]
    fn load_from_file_only_loads_wanted_hashes() {
        let component = ResourceComponent::new();
        let (stream, toc, th, eh) = memory_file(&component);
        let handle = component.add_resource_file(stream, toc);
        let _want_effect = component.get_resource_hash_usage(eh).unwrap();

        let loaded = component.load_resource_from_file(handle).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hash(), eh);
        assert!(component.get_resource(th).is_none());
    }

    #[test]
    fn writes_and_opens_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.res");
        let component = ResourceComponent::new();
        let t = component.manage_resource(texture(), true);
        let e = component.manage_resource(effect(), true);
        let toc = component.write_resource_file(&path, &[t.clone(), e.clone()], true).unwrap();
        assert_eq!(toc.len(), 2);
        let (th, eh) = (t.hash(), e.hash());
        drop((t, e));

        let reader = ResourceComponent::new();
        let handle = reader.open_resource_file(&path).unwrap();
        assert!(reader.has_resource_file(handle));
        assert_eq!(reader.resource_file_handles(&path.display().to_string()), vec![handle]);
        let resolved = reader.resolve_resources(&[th, eh]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].decompressed_data().unwrap(), effect().decompressed_data().unwrap());
    }

    #[test]
    fn corrupt_file_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.res");
        std::fs::write(&path, [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]).unwrap();
        let component = ResourceComponent::new();
        assert!(matches!(
            component.open_resource_file(&path),
            Err(ResourceError::CorruptIndex(_))
        ));
        assert!(component.storage().is_empty());
        assert!(matches!(
            component.open_resource_file(&dir.path().join("missing.res")),
            Err(ResourceError::Io { .. })
        ));
    }
}

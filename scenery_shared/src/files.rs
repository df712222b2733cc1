//! Registry of open resource files.
//!
//! Every registration pairs a shared input stream with the file's table of contents
//! and holds a [`ResourceHashUsage`] for each entry, so storage keeps knowing about
//! (and can report info for) resources whose bytes are still on disk. The stream is
//! closed when the last registration holding it is removed.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, Read, Seek},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{ResourceError, ResourceResult},
    hash::ContentHash,
    storage::{ResourceHashUsage, ResourceStorage},
    toc::{ResourceFileEntry, TableOfContents},
};

/// Anything a resource file can be read from.
pub trait ResourceStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> ResourceStream for T {}

/// A named, shareable input stream.
pub struct InputStreamContainer {
    name: String,
    stream: Mutex<Box<dyn ResourceStream>>,
}

impl InputStreamContainer {
    pub fn new(name: impl Into<String>, stream: impl ResourceStream + 'static) -> Self {
        Self {
            name: name.into(),
            stream: Mutex::new(Box::new(stream)),
        }
    }

    /// Opens a file for buffered reading.
    pub fn open(path: &Path) -> ResourceResult<Self> {
        let file = File::open(path)
            .map_err(|e| ResourceError::io(format!("open resource file {}", path.display()), e))?;
        Ok(Self::new(path.display().to_string(), BufReader::new(file)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exclusive access to the stream; reads seek to their own offsets.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn ResourceStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for InputStreamContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStreamContainer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Identifies one registration. Files with equal names get distinct handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceFileHandle(pub u64);

struct Registration {
    stream: Arc<InputStreamContainer>,
    toc: TableOfContents,
    _usages: Vec<ResourceHashUsage>,
}

/// What [`ResourceFilesRegistry::get_entry`] resolves a hash to.
#[derive(Debug, Clone)]
pub struct FileEntryLocation {
    pub handle: ResourceFileHandle,
    pub stream: Arc<InputStreamContainer>,
    pub entry: ResourceFileEntry,
}

#[derive(Default)]
pub struct ResourceFilesRegistry {
    files: BTreeMap<ResourceFileHandle, Registration>,
    next_handle: u64,
}

impl ResourceFilesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes an already-read TOC and takes a hash usage for every entry.
    pub fn register_resource_file(
        &mut self,
        stream: Arc<InputStreamContainer>,
        toc: TableOfContents,
        storage: &ResourceStorage,
    ) -> ResourceFileHandle {
        self.next_handle += 1;
        let handle = ResourceFileHandle(self.next_handle);
        let usages = toc
            .entries()
            .map(|entry| storage.get_hash_usage_with_info(entry.info))
            .collect();
        info!(file = %stream.name(), ?handle, resources = toc.len(), "resource file registered");
        self.files.insert(
            handle,
            Registration {
                stream,
                toc,
                _usages: usages,
            },
        );
        handle
    }

    /// Removes a registration, releasing its hash usages and its stream share.
    pub fn unregister_resource_file(&mut self, handle: ResourceFileHandle) -> bool {
        match self.files.remove(&handle) {
            Some(reg) => {
                info!(file = %reg.stream.name(), ?handle, "resource file unregistered");
                true
            }
            None => false,
        }
    }

    pub fn has_resource_file(&self, handle: ResourceFileHandle) -> bool {
        self.files.contains_key(&handle)
    }

    /// Handles of registrations whose stream carries `name`.
    pub fn find_by_name(&self, name: &str) -> Vec<ResourceFileHandle> {
        self.files
            .iter()
            .filter(|(_, reg)| reg.stream.name() == name)
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Stream and byte range of `hash`, from the earliest registration that has it.
    pub fn get_entry(&self, hash: ContentHash) -> Option<FileEntryLocation> {
        self.files.iter().find_map(|(handle, reg)| {
            reg.toc.entry(hash).map(|entry| FileEntryLocation {
                handle: *handle,
                stream: reg.stream.clone(),
                entry: *entry,
            })
        })
    }

    pub fn contains(&self, hash: ContentHash) -> bool {
        self.files.values().any(|reg| reg.toc.contains(hash))
    }

    /// How many registrations list `hash`; each holds one hash usage for it.
    pub fn registration_count(&self, hash: ContentHash) -> usize {
        self.files
            .values()
            .filter(|reg| reg.toc.contains(hash))
            .count()
    }

    pub fn table_of_contents(&self, handle: ResourceFileHandle) -> Option<&TableOfContents> {
        self.files.get(&handle).map(|reg| &reg.toc)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Opens `path` and reads its index without registering anything.
pub fn open_with_toc(path: &Path) -> ResourceResult<(Arc<InputStreamContainer>, TableOfContents)> {
    let container = InputStreamContainer::open(path)?;
    let toc = {
        let mut stream = container.lock();
        TableOfContents::read_from_stream(&mut *stream)?
    };
    Ok((Arc::new(container), toc))
}

/// Path helper: resource files live flat under a directory.
pub fn resource_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.res"))
}

//! Renderer-side resource descriptors.
//!
//! The registry never fetches or uploads anything itself. It records what the
//! renderer knows about each hash a scene references: where the bytes are in their
//! journey to the device, which scenes use it and what it occupies once uploaded.

use std::collections::{BTreeMap, HashMap};

use scenery_shared::{
    hash::ContentHash,
    render::DeviceResourceHandle,
    resource::ResourceType,
    scene::SceneId,
    storage::ManagedResource,
};
use serde::Serialize;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ResourceStatus {
    /// Referenced by a scene, bytes not asked for yet.
    Registered,
    /// Bytes asked for from a provider.
    Requested,
    /// Bytes arrived and wait for upload.
    Provided,
    /// Effect compiling on the worker thread.
    ScheduledForUpload,
    Uploaded,
    Broken,
}

#[derive(Debug)]
pub struct ResourceDescriptor {
    pub hash: ContentHash,
    pub status: ResourceStatus,
    /// Held only until the resource is uploaded (or gives up retrying).
    pub resource: Option<ManagedResource>,
    pub resource_type: Option<ResourceType>,
    pub decompressed_size: u32,
    pub compressed_size: u32,
    pub device_handle: Option<DeviceResourceHandle>,
    pub vram_size: u64,
    /// Scene -> number of references from that scene.
    pub scene_usage: BTreeMap<SceneId, u32>,
    pub upload_attempts: u32,
}

impl ResourceDescriptor {
    fn new(hash: ContentHash) -> Self {
        Self {
            hash,
            status: ResourceStatus::Registered,
            resource: None,
            resource_type: None,
            decompressed_size: 0,
            compressed_size: 0,
            device_handle: None,
            vram_size: 0,
            scene_usage: BTreeMap::new(),
            upload_attempts: 0,
        }
    }

    pub fn is_used(&self) -> bool {
        !self.scene_usage.is_empty()
    }

    pub fn is_effect(&self) -> bool {
        self.resource_type.is_some_and(ResourceType::is_effect)
    }

    pub fn scenes(&self) -> impl Iterator<Item = SceneId> + '_ {
        self.scene_usage.keys().copied()
    }

    fn occupies_device(&self) -> bool {
        matches!(
            self.status,
            ResourceStatus::Uploaded | ResourceStatus::ScheduledForUpload
        )
    }
}

#[derive(Debug, Default)]
pub struct RendererResourceRegistry {
    descriptors: HashMap<ContentHash, ResourceDescriptor>,
    /// Provided and in use, in arrival order.
    provided: Vec<ContentHash>,
    /// On the device (or compiling) but no longer used, oldest first.
    unused: Vec<ContentHash>,
}

fn remove_from(list: &mut Vec<ContentHash>, hash: ContentHash) {
    if let Some(pos) = list.iter().position(|h| *h == hash) {
        list.remove(pos);
    }
}

impl RendererResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the hash was already registered.
    pub fn register_resource(&mut self, hash: ContentHash) -> bool {
        if self.descriptors.contains_key(&hash) {
            return false;
        }
        trace!(%hash, "register resource");
        self.descriptors.insert(hash, ResourceDescriptor::new(hash));
        true
    }

    /// Forgets the hash. The caller unloads it from the device first.
    pub fn unregister_resource(&mut self, hash: ContentHash) -> Option<ResourceDescriptor> {
        let descriptor = self.descriptors.remove(&hash)?;
        debug_assert!(
            descriptor.device_handle.is_none(),
            "unregistering {hash} while it is on the device"
        );
        remove_from(&mut self.provided, hash);
        remove_from(&mut self.unused, hash);
        trace!(%hash, "unregister resource");
        Some(descriptor)
    }

    pub fn contains_resource(&self, hash: ContentHash) -> bool {
        self.descriptors.contains_key(&hash)
    }

    pub fn descriptor(&self, hash: ContentHash) -> Option<&ResourceDescriptor> {
        self.descriptors.get(&hash)
    }

    pub fn status(&self, hash: ContentHash) -> Option<ResourceStatus> {
        self.descriptors.get(&hash).map(|d| d.status)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Adds one reference from `scene`. The hash must be registered.
    pub fn add_resource_ref(&mut self, hash: ContentHash, scene: SceneId) {
        let Some(descriptor) = self.descriptors.get_mut(&hash) else {
            warn!(%hash, %scene, "reference to unregistered resource");
            return;
        };
        let was_used = descriptor.is_used();
        *descriptor.scene_usage.entry(scene).or_insert(0) += 1;
        if !was_used {
            remove_from(&mut self.unused, hash);
            if descriptor.status == ResourceStatus::Provided && !self.provided.contains(&hash) {
                self.provided.push(hash);
            }
        }
    }

    /// Removes one reference from `scene`.
    ///
    /// When nothing uses the hash anymore, a descriptor that occupies the device
    /// moves to the unused list. Any other descriptor is unregistered.
    pub fn remove_resource_ref(&mut self, hash: ContentHash, scene: SceneId) {
        let Some(descriptor) = self.descriptors.get_mut(&hash) else {
            return;
        };
        let Some(count) = descriptor.scene_usage.get_mut(&scene) else {
            debug_assert!(false, "{scene} never referenced {hash}");
            return;
        };
        *count -= 1;
        if *count == 0 {
            descriptor.scene_usage.remove(&scene);
        }
        if descriptor.is_used() {
            return;
        }
        if descriptor.occupies_device() {
            self.unused.push(hash);
        } else {
            self.unregister_resource(hash);
        }
    }

    /// Drops every reference `scene` holds. Returns the hashes it used.
    pub fn remove_scene(&mut self, scene: SceneId) -> Vec<ContentHash> {
        let hashes = self.resources_in_use_by_scene(scene);
        for &hash in &hashes {
            let refs = self
                .descriptors
                .get(&hash)
                .and_then(|d| d.scene_usage.get(&scene).copied())
                .unwrap_or(0);
            for _ in 0..refs {
                self.remove_resource_ref(hash, scene);
            }
        }
        hashes
    }

    pub fn set_resource_requested(&mut self, hash: ContentHash) {
        if let Some(d) = self.descriptors.get_mut(&hash) {
            if d.status == ResourceStatus::Registered {
                d.status = ResourceStatus::Requested;
            }
        }
    }

    /// Attaches arrived bytes. Ignored unless the descriptor waits for bytes.
    pub fn set_resource_data(&mut self, hash: ContentHash, resource: ManagedResource) {
        let Some(d) = self.descriptors.get_mut(&hash) else {
            return;
        };
        match d.status {
            ResourceStatus::Registered | ResourceStatus::Requested | ResourceStatus::Broken => {}
            other => {
                trace!(%hash, status = ?other, "ignoring data for resource");
                return;
            }
        }
        d.status = ResourceStatus::Provided;
        d.resource_type = Some(resource.resource_type());
        d.decompressed_size = resource.decompressed_size();
        d.compressed_size = resource.compressed_size();
        d.resource = Some(resource);
        if d.is_used() && !self.provided.contains(&hash) {
            self.provided.push(hash);
        }
    }

    pub fn set_resource_scheduled_for_upload(&mut self, hash: ContentHash) {
        if let Some(d) = self.descriptors.get_mut(&hash) {
            d.status = ResourceStatus::ScheduledForUpload;
            remove_from(&mut self.provided, hash);
        }
    }

    pub fn set_resource_uploaded(&mut self, hash: ContentHash, handle: DeviceResourceHandle, vram_size: u64) {
        if let Some(d) = self.descriptors.get_mut(&hash) {
            d.status = ResourceStatus::Uploaded;
            d.device_handle = Some(handle);
            d.vram_size = vram_size;
            d.resource = None;
            d.upload_attempts = 0;
            remove_from(&mut self.provided, hash);
        }
    }

    /// `keep_data` keeps the bytes for a later retry.
    pub fn set_resource_broken(&mut self, hash: ContentHash, keep_data: bool) {
        if let Some(d) = self.descriptors.get_mut(&hash) {
            d.status = ResourceStatus::Broken;
            if !keep_data {
                d.resource = None;
            }
            remove_from(&mut self.provided, hash);
            if !d.is_used() {
                self.unregister_resource(hash);
            }
        }
    }

    /// Counts a failed attempt and returns the total so far.
    pub fn record_upload_failure(&mut self, hash: ContentHash) -> u32 {
        match self.descriptors.get_mut(&hash) {
            Some(d) => {
                d.upload_attempts += 1;
                d.upload_attempts
            }
            None => 0,
        }
    }

    /// Uploaded -> Registered after the device copy was freed.
    pub fn set_resource_evicted(&mut self, hash: ContentHash) {
        if let Some(d) = self.descriptors.get_mut(&hash) {
            d.status = ResourceStatus::Registered;
            d.device_handle = None;
            d.vram_size = 0;
        }
    }

    /// Back to Registered so the bytes get asked for again.
    pub fn set_resource_registered(&mut self, hash: ContentHash) {
        if let Some(d) = self.descriptors.get_mut(&hash) {
            if matches!(d.status, ResourceStatus::Requested | ResourceStatus::Broken) && d.resource.is_none() {
                d.status = ResourceStatus::Registered;
                d.upload_attempts = 0;
            }
        }
    }

    pub fn all_provided_resources(&self) -> &[ContentHash] {
        &self.provided
    }

    /// In the order they became unused.
    pub fn all_resources_not_in_use_by_scenes(&self) -> &[ContentHash] {
        &self.unused
    }

    /// Broken, still used and still holding bytes.
    pub fn broken_resources_with_data(&self) -> Vec<ContentHash> {
        let mut out: Vec<ContentHash> = self
            .descriptors
            .values()
            .filter(|d| d.status == ResourceStatus::Broken && d.resource.is_some() && d.is_used())
            .map(|d| d.hash)
            .collect();
        out.sort();
        out
    }

    /// Sorted by hash.
    pub fn resources_in_use_by_scene(&self, scene: SceneId) -> Vec<ContentHash> {
        let mut out: Vec<ContentHash> = self
            .descriptors
            .values()
            .filter(|d| d.scene_usage.contains_key(&scene))
            .map(|d| d.hash)
            .collect();
        out.sort();
        out
    }

    pub fn has_any_resources_scheduled_for_upload(&self) -> bool {
        self.descriptors
            .values()
            .any(|d| d.status == ResourceStatus::ScheduledForUpload)
    }

    /// Uploaded descriptors, sorted by hash.
    pub fn uploaded_resources(&self) -> Vec<ContentHash> {
        let mut out: Vec<ContentHash> = self
            .descriptors
            .values()
            .filter(|d| d.device_handle.is_some())
            .map(|d| d.hash)
            .collect();
        out.sort();
        out
    }

    /// Count of descriptors per status.
    pub fn status_counts(&self) -> BTreeMap<ResourceStatus, usize> {
        let mut out = BTreeMap::new();
        for d in self.descriptors.values() {
            *out.entry(d.status).or_insert(0) += 1;
        }
        out
    }
}

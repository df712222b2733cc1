//! Per-frame upload and eviction policy.
//!
//! Once per render loop iteration [`ResourceUploadingManager::upload_and_unload_pending_resources`]
//! runs these steps:
//! 1. Promote effects the worker finished compiling.
//! 2. Plan uploads: provided (or retryable broken) resources used by shown scenes,
//!    best scene priority first, small before large.
//! 3. If uploaded bytes plus planned bytes exceed the cache size, free device
//!    memory: unused resources first (oldest first), then resources only hidden
//!    scenes use (lowest priority first).
//! 4. Upload the plan until the frame's time budget runs out.
//!
//! The cache size is a target, not a cap. Whatever shown scenes need gets
//! uploaded even when nothing can be evicted.

use std::collections::BTreeSet;

use scenery_shared::{
    config::DisplayConfig,
    event::{EventBus, ResourceEvent},
    hash::ContentHash,
    render::{RenderBackend, ShaderCompiler, UploadOutcome},
    scene::SceneId,
};
use tracing::{debug, info, trace, warn};

use crate::{
    effects::{AsyncEffectUploader, EffectResult},
    frame_timer::FrameTimer,
    registry::{RendererResourceRegistry, ResourceStatus},
    stats::RendererStatistics,
};

/// Resources at least this big are followed by a time budget check.
pub const LARGE_RESOURCE_BYTE_SIZE_THRESHOLD: u32 = 250_000;

#[derive(Debug, Clone, Copy)]
struct PlannedUpload {
    hash: ContentHash,
    size: u64,
    priority: i32,
    large: bool,
}

pub struct ResourceUploadingManager {
    registry: RendererResourceRegistry,
    backend: Box<dyn RenderBackend>,
    effects: AsyncEffectUploader,
    timer: FrameTimer,
    config: DisplayConfig,
    shown_scenes: BTreeSet<SceneId>,
    stats: RendererStatistics,
    events: EventBus,
    uploaded_bytes: u64,
}

impl ResourceUploadingManager {
    pub fn new(
        backend: Box<dyn RenderBackend>,
        compiler: Box<dyn ShaderCompiler>,
        config: DisplayConfig,
        timer: FrameTimer,
    ) -> anyhow::Result<Self> {
        if let Some(us) = config.upload_time_budget_us {
            timer.set_upload_budget(Some(std::time::Duration::from_micros(us)));
        }
        Ok(Self {
            registry: RendererResourceRegistry::new(),
            backend,
            effects: AsyncEffectUploader::new(compiler)?,
            timer,
            config,
            shown_scenes: BTreeSet::new(),
            stats: RendererStatistics::default(),
            events: EventBus::default(),
            uploaded_bytes: 0,
        })
    }

    pub fn registry(&self) -> &RendererResourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RendererResourceRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    pub fn statistics(&self) -> RendererStatistics {
        self.stats
    }

    /// Queues an event observed outside the upload loop.
    pub fn report(&mut self, event: ResourceEvent) {
        self.events.push(event);
    }

    pub fn drain_events(&mut self) -> Vec<ResourceEvent> {
        self.events.drain()
    }

    /// Bytes currently occupied on the device.
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    pub fn upload_batch_size(&self) -> usize {
        self.config.upload_batch_size.max(1)
    }

    pub fn show_scene(&mut self, scene: SceneId) {
        self.shown_scenes.insert(scene);
    }

    pub fn hide_scene(&mut self, scene: SceneId) {
        self.shown_scenes.remove(&scene);
    }

    pub fn is_scene_shown(&self, scene: SceneId) -> bool {
        self.shown_scenes.contains(&scene)
    }

    pub fn shown_scenes(&self) -> impl Iterator<Item = SceneId> + '_ {
        self.shown_scenes.iter().copied()
    }

    /// Hides the scene and drops every reference it holds.
    pub fn remove_scene(&mut self, scene: SceneId) -> Vec<ContentHash> {
        self.shown_scenes.remove(&scene);
        self.registry.remove_scene(scene)
    }

    pub fn has_anything_to_upload(&self) -> bool {
        !self.plan_uploads().is_empty()
            || self.registry.has_any_resources_scheduled_for_upload()
            || (self.uploaded_bytes > self.config.gpu_cache_size
                && self
                    .registry
                    .all_resources_not_in_use_by_scenes()
                    .iter()
                    .any(|&hash| self.is_evictable(hash)))
    }

    pub fn upload_and_unload_pending_resources(&mut self) {
        self.sync_effects();

        let planned = self.plan_uploads();
        let planned_bytes: u64 = planned.iter().map(|p| p.size).sum();
        self.unload_to_fit(planned_bytes);
        self.upload(&planned);
    }

    /// Promotes effects whose compilation finished. Never blocks.
    pub fn sync_effects(&mut self) {
        for EffectResult { hash, result } in self.effects.poll_finished() {
            if self.registry.status(hash) != Some(ResourceStatus::ScheduledForUpload) {
                debug!(%hash, "compiled effect no longer wanted");
                continue;
            }
            let registered = result.and_then(|compiled| {
                self.backend
                    .register_compiled_effect(compiled)
                    .map_err(|e| e.to_string())
            });
            match registered {
                Ok(upload) => {
                    self.registry
                        .set_resource_uploaded(hash, upload.handle, upload.vram_size);
                    self.account_upload(upload.vram_size);
                    self.stats.effects_compiled += 1;
                    self.events.push(ResourceEvent::EffectCompiled { hash });
                    debug!(%hash, "effect uploaded");
                }
                Err(reason) => self.upload_failed(hash, reason),
            }
        }
    }

    fn scene_priority(&self, scenes: impl Iterator<Item = SceneId>) -> Option<i32> {
        scenes.map(|s| self.config.scene_priority(s)).min()
    }

    fn plan_uploads(&self) -> Vec<PlannedUpload> {
        let broken = self.registry.broken_resources_with_data();
        let mut planned: Vec<PlannedUpload> = self
            .registry
            .all_provided_resources()
            .iter()
            .chain(broken.iter())
            .filter_map(|&hash| {
                let d = self.registry.descriptor(hash)?;
                let priority = self.scene_priority(
                    d.scenes().filter(|s| self.shown_scenes.contains(s)),
                )?;
                Some(PlannedUpload {
                    hash,
                    size: u64::from(d.decompressed_size),
                    priority,
                    large: d.decompressed_size >= LARGE_RESOURCE_BYTE_SIZE_THRESHOLD,
                })
            })
            .collect();
        planned.sort_by_key(|p| (p.priority, p.large));
        planned
    }

    fn is_evictable(&self, hash: ContentHash) -> bool {
        self.registry.descriptor(hash).is_some_and(|d| {
            d.status == ResourceStatus::Uploaded && !(self.config.keep_effects && d.is_effect())
        })
    }

    fn unload_to_fit(&mut self, planned_bytes: u64) {
        let budget = self.config.gpu_cache_size;
        let mut deficit = (self.uploaded_bytes + planned_bytes).saturating_sub(budget);
        if deficit == 0 {
            return;
        }

        let unused = self.registry.all_resources_not_in_use_by_scenes().to_vec();
        for hash in unused {
            if deficit == 0 {
                break;
            }
            if !self.is_evictable(hash) {
                continue;
            }
            let freed = self.unload(hash);
            self.registry.unregister_resource(hash);
            deficit = deficit.saturating_sub(freed);
            self.events.push(ResourceEvent::Evicted {
                hash,
                bytes: freed,
                demoted: false,
            });
        }

        // Hidden scenes only give up memory to make room for something shown.
        if deficit > 0 && planned_bytes > 0 {
            let mut hidden: Vec<(i32, ContentHash)> = self
                .registry
                .descriptors()
                .filter(|d| d.is_used() && !d.scenes().any(|s| self.shown_scenes.contains(&s)))
                .filter(|d| self.is_evictable(d.hash))
                .filter_map(|d| Some((self.scene_priority(d.scenes())?, d.hash)))
                .collect();
            hidden.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            for (_, hash) in hidden {
                if deficit == 0 {
                    break;
                }
                let freed = self.unload(hash);
                self.registry.set_resource_evicted(hash);
                deficit = deficit.saturating_sub(freed);
                self.events.push(ResourceEvent::Evicted {
                    hash,
                    bytes: freed,
                    demoted: true,
                });
            }
        }

        if deficit > 0 && budget > 0 && planned_bytes > 0 {
            self.stats.cache_budget_exceeded_frames += 1;
            self.events.push(ResourceEvent::CacheBudgetExceeded {
                uploaded_bytes: self.uploaded_bytes + planned_bytes,
                budget,
            });
        }
    }

    fn upload(&mut self, planned: &[PlannedUpload]) {
        let batch = self.upload_batch_size();
        for (i, p) in planned.iter().enumerate() {
            let submitted_effect = self.upload_one(p.hash);
            let check = i % batch == 0 || p.large || submitted_effect;
            if check && i + 1 < planned.len() && self.timer.is_upload_budget_exceeded() {
                self.stats.time_budget_exhausted_frames += 1;
                debug!(
                    uploaded = i + 1,
                    remaining = planned.len() - i - 1,
                    "upload time budget exhausted"
                );
                break;
            }
        }
    }

    /// Returns `true` if an effect went to the compiler.
    fn upload_one(&mut self, hash: ContentHash) -> bool {
        let Some(resource) = self
            .registry
            .descriptor(hash)
            .and_then(|d| d.resource.clone())
        else {
            return false;
        };
        let outcome = resource
            .decompressed_data()
            .and_then(|data| self.backend.upload_resource(&resource, &data));
        match outcome {
            Ok(UploadOutcome::Uploaded(upload)) => {
                self.registry
                    .set_resource_uploaded(hash, upload.handle, upload.vram_size);
                self.account_upload(upload.vram_size);
                trace!(%hash, vram = upload.vram_size, "resource uploaded");
                false
            }
            Ok(UploadOutcome::CompileAsync) => {
                self.registry.set_resource_scheduled_for_upload(hash);
                self.effects.submit(hash, resource);
                true
            }
            Err(e) => {
                self.upload_failed(hash, e.to_string());
                false
            }
        }
    }

    fn account_upload(&mut self, vram_size: u64) {
        self.uploaded_bytes += vram_size;
        self.stats.resources_uploaded += 1;
        self.stats.bytes_uploaded += vram_size;
    }

    fn upload_failed(&mut self, hash: ContentHash, reason: String) {
        let attempts = self.registry.record_upload_failure(hash);
        let retry = attempts < self.config.max_upload_attempts;
        self.registry.set_resource_broken(hash, retry);
        self.stats.upload_failures += 1;
        if attempts == 1 {
            warn!(%hash, %reason, "resource upload failed");
            self.events.push(ResourceEvent::UploadFailed { hash, reason });
        } else if !retry {
            info!(%hash, attempts, "giving up on resource upload");
        }
    }

    /// Frees the device copy. Returns the bytes freed.
    fn unload(&mut self, hash: ContentHash) -> u64 {
        let Some(d) = self.registry.descriptor(hash) else {
            return 0;
        };
        let (Some(handle), Some(resource_type)) = (d.device_handle, d.resource_type) else {
            return 0;
        };
        let bytes = d.vram_size;
        self.backend.unload_resource(hash, resource_type, handle);
        self.uploaded_bytes = self.uploaded_bytes.saturating_sub(bytes);
        self.stats.resources_unloaded += 1;
        self.stats.bytes_unloaded += bytes;
        trace!(%hash, bytes, "resource unloaded");
        bytes
    }
}

impl Drop for ResourceUploadingManager {
    fn drop(&mut self) {
        for hash in self.registry.uploaded_resources() {
            self.unload(hash);
            self.registry.set_resource_evicted(hash);
        }
    }
}

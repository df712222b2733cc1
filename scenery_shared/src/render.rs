//! Rendering abstraction.
//!
//! This crate does not depend on a graphics API. The renderer talks to the device
//! through [`RenderBackend`] (render thread only) and compiles effects through a
//! [`ShaderCompiler`] that runs on a worker thread.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ResourceError, ResourceResult},
    hash::ContentHash,
    resource::{Resource, ResourceType},
};

/// GPU-side identity of an uploaded resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceResourceHandle(pub u32);

/// Result of a synchronous upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceUpload {
    pub handle: DeviceResourceHandle,
    pub vram_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded(DeviceUpload),
    /// The effect is not cached as a binary and has to be compiled off-thread.
    CompileAsync,
}

/// Output of a [`ShaderCompiler`], registered with the device on the render thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledEffect {
    pub hash: ContentHash,
    pub binary: Bytes,
}

/// Device upload primitives.
pub trait RenderBackend: Send {
    /// `data` is the decoded payload of `resource`.
    fn upload_resource(&mut self, resource: &Resource, data: &[u8]) -> ResourceResult<UploadOutcome>;
    fn unload_resource(
        &mut self,
        hash: ContentHash,
        resource_type: ResourceType,
        handle: DeviceResourceHandle,
    );
    fn register_compiled_effect(&mut self, effect: CompiledEffect) -> ResourceResult<DeviceUpload>;
}

/// Turns effect resources into program binaries. Runs off the render thread.
pub trait ShaderCompiler: Send + 'static {
    fn compile_effect(&mut self, hash: ContentHash, resource: &Resource) -> Result<CompiledEffect, String>;
}

/// Observable state of a [`NullBackend`].
#[derive(Debug, Default)]
pub struct NullBackendState {
    pub uploads: Vec<ContentHash>,
    pub unloads: Vec<ContentHash>,
    pub live: BTreeMap<DeviceResourceHandle, (ContentHash, u64)>,
    /// Uploads of these hashes fail.
    pub failing: HashSet<ContentHash>,
}

impl NullBackendState {
    pub fn live_vram(&self) -> u64 {
        self.live.values().map(|(_, size)| size).sum()
    }

    pub fn is_live(&self, hash: ContentHash) -> bool {
        self.live.values().any(|(h, _)| *h == hash)
    }
}

/// A headless backend that hands out handles and records what it was asked to do.
pub struct NullBackend {
    state: Arc<Mutex<NullBackendState>>,
    next_handle: u32,
    async_effects: bool,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            next_handle: 0,
            async_effects: true,
        }
    }

    /// Upload effects synchronously, as if every effect had a cached binary.
    pub fn with_sync_effects(mut self) -> Self {
        self.async_effects = false;
        self
    }

    /// Shared view of what happened, usable after the backend moved into a manager.
    pub fn state(&self) -> Arc<Mutex<NullBackendState>> {
        self.state.clone()
    }

    fn lock(&self) -> MutexGuard<'_, NullBackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&mut self, hash: ContentHash, vram_size: u64) -> DeviceUpload {
        self.next_handle += 1;
        let handle = DeviceResourceHandle(self.next_handle);
        let mut state = self.lock();
        state.uploads.push(hash);
        state.live.insert(handle, (hash, vram_size));
        DeviceUpload { handle, vram_size }
    }
}

impl RenderBackend for NullBackend {
    fn upload_resource(&mut self, resource: &Resource, data: &[u8]) -> ResourceResult<UploadOutcome> {
        let hash = resource.hash();
        if self.lock().failing.contains(&hash) {
            return Err(ResourceError::UploadFailure {
                hash,
                reason: "device rejected resource".into(),
            });
        }
        if resource.resource_type().is_effect() && self.async_effects {
            return Ok(UploadOutcome::CompileAsync);
        }
        Ok(UploadOutcome::Uploaded(self.allocate(hash, data.len() as u64)))
    }

    fn unload_resource(
        &mut self,
        hash: ContentHash,
        _resource_type: ResourceType,
        handle: DeviceResourceHandle,
    ) {
        let mut state = self.lock();
        state.live.remove(&handle);
        state.unloads.push(hash);
    }

    fn register_compiled_effect(&mut self, effect: CompiledEffect) -> ResourceResult<DeviceUpload> {
        Ok(self.allocate(effect.hash, effect.binary.len() as u64))
    }
}

/// Compiles by copying the effect source; optionally slow or failing.
#[derive(Debug, Clone, Default)]
pub struct NullShaderCompiler {
    pub failing: HashSet<ContentHash>,
    pub delay: Duration,
}

impl ShaderCompiler for NullShaderCompiler {
    fn compile_effect(&mut self, hash: ContentHash, resource: &Resource) -> Result<CompiledEffect, String> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.failing.contains(&hash) {
            return Err(format!("effect {} failed to link", resource.name()));
        }
        let binary = resource.decompressed_data().map_err(|e| e.to_string())?;
        Ok(CompiledEffect { hash, binary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_backend_tracks_live_resources() {
        let mut backend = NullBackend::new();
        let state = backend.state();
        let res = Resource::new(ResourceType::IndexArray, vec![0u8; 24], Bytes::new(), 0, "i");
        let data = res.decompressed_data().unwrap();
        let outcome = backend.upload_resource(&res, &data).unwrap();
        let UploadOutcome::Uploaded(upload) = outcome else {
            panic!("index arrays upload synchronously");
        };
        assert_eq!(upload.vram_size, 24);
        assert_eq!(state.lock().unwrap().live_vram(), 24);

        backend.unload_resource(res.hash(), ResourceType::IndexArray, upload.handle);
        assert_eq!(state.lock().unwrap().live_vram(), 0);
        assert_eq!(state.lock().unwrap().unloads, vec![res.hash()]);
    }

    #[test]
    fn effects_go_async_unless_configured() {
        let effect = Resource::new(ResourceType::Effect, vec![1u8; 8], Bytes::new(), 0, "fx");
        let mut backend = NullBackend::new();
        assert_eq!(
            backend.upload_resource(&effect, &[1u8; 8]).unwrap(),
            UploadOutcome::CompileAsync
        );
        let mut sync = NullBackend::new().with_sync_effects();
        assert!(matches!(
            sync.upload_resource(&effect, &[1u8; 8]).unwrap(),
            UploadOutcome::Uploaded(_)
        ));
    }

    #[test]
    fn configured_failures_are_reported() {
        let mut backend = NullBackend::new();
        let res = Resource::new(ResourceType::Texture2D, vec![0u8; 4], Bytes::new(), 0, "t");
        backend.state().lock().unwrap().failing.insert(res.hash());
        assert!(matches!(
            backend.upload_resource(&res, &[0u8; 4]),
            Err(ResourceError::UploadFailure { .. })
        ));
    }
}

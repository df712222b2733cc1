//! Configuration system.
//!
//! Loads configuration from JSON strings (file IO left to the binaries).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scene::SceneId;

/// Root configuration shared by client and renderer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneryConfig {
    /// Renderer listen address, e.g. `127.0.0.1:41000`.
    pub renderer_addr: String,
    /// Render loop frequency.
    pub frame_hz: u32,
    /// Directory resource files are written to and read from.
    #[serde(default = "default_resource_dir")]
    pub resource_dir: String,
    /// Compress large resources when writing resource files.
    #[serde(default = "default_true")]
    pub compress_resources: bool,
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Renderer-side upload and caching policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    /// Bytes of unused uploaded resources kept on the GPU. 0 unloads them next frame.
    #[serde(default)]
    pub gpu_cache_size: u64,
    /// Never evict compiled effects while the renderer runs.
    #[serde(default = "default_true")]
    pub keep_effects: bool,
    /// Uploads between two time budget checks.
    #[serde(default = "default_upload_batch_size")]
    pub upload_batch_size: usize,
    /// Per-frame upload time budget; `None` is unlimited.
    #[serde(default)]
    pub upload_time_budget_us: Option<u64>,
    /// Attempts before a broken resource gives up its bytes.
    #[serde(default = "default_max_upload_attempts")]
    pub max_upload_attempts: u32,
    /// Lower value wins; scenes not listed get 0.
    #[serde(default)]
    pub scene_priorities: BTreeMap<SceneId, i32>,
}

fn default_resource_dir() -> String {
    "resources".to_string()
}

fn default_true() -> bool {
    true
}

fn default_upload_batch_size() -> usize {
    10
}

fn default_max_upload_attempts() -> u32 {
    3
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            gpu_cache_size: 0,
            keep_effects: true,
            upload_batch_size: default_upload_batch_size(),
            upload_time_budget_us: None,
            max_upload_attempts: default_max_upload_attempts(),
            scene_priorities: BTreeMap::new(),
        }
    }
}

impl DisplayConfig {
    pub fn scene_priority(&self, scene: SceneId) -> i32 {
        self.scene_priorities.get(&scene).copied().unwrap_or(0)
    }
}

impl Default for SceneryConfig {
    fn default() -> Self {
        Self {
            renderer_addr: "127.0.0.1:41000".to_string(),
            frame_hz: 60,
            resource_dir: default_resource_dir(),
            compress_resources: true,
            display: DisplayConfig::default(),
        }
    }
}

impl SceneryConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

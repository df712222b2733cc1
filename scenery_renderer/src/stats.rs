//! Renderer statistics.

use serde::Serialize;

/// Counters accumulated by the uploading manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RendererStatistics {
    pub resources_uploaded: u64,
    pub bytes_uploaded: u64,
    pub resources_unloaded: u64,
    pub bytes_unloaded: u64,
    pub upload_failures: u64,
    pub effects_compiled: u64,
    /// Frames that ended with more uploaded than the cache size and nothing evictable.
    pub cache_budget_exceeded_frames: u64,
    /// Frames that stopped uploading because the time budget ran out.
    pub time_budget_exhausted_frames: u64,
}

impl RendererStatistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// One-line summary for console and logs.
    pub fn summary(&self) -> String {
        format!(
            "uploaded {} ({} B), unloaded {} ({} B), failures {}, effects {}, over cache {} frames, out of time {} frames",
            self.resources_uploaded,
            self.bytes_uploaded,
            self.resources_unloaded,
            self.bytes_unloaded,
            self.upload_failures,
            self.effects_compiled,
            self.cache_budget_exceeded_frames,
            self.time_budget_exhausted_frames,
        )
    }
}

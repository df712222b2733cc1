//! `scenery_renderer`
//!
//! Renderer-side systems:
//! - Resource descriptors keyed by content hash
//! - Per-frame upload/eviction policy under cache and time budgets
//! - Effect compilation on a worker thread
//! - A frame loop serving scene clients over TCP
//!
//! The device sits behind `scenery_shared::render::RenderBackend`; the binary
//! runs headless with the null backend.

pub mod effects;
pub mod frame_timer;
pub mod registry;
pub mod renderer;
pub mod stats;
pub mod uploading;

pub use renderer::RendererServer;
pub use uploading::ResourceUploadingManager;

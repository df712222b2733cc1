//! `scenery_client`
//!
//! Client-side systems:
//! - Connection management (reliable stream to the renderer)
//! - Scene publishing and resource ownership
//! - Answering resource requests from the local cache and resource files

pub mod client;

pub use client::SceneClient;

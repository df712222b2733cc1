//! `scenery_shared`
//!
//! Content-addressed resource cache shared by client and renderer.
//!
//! Layers, bottom-up:
//! - `hash`, `resource`: content hash and the resource value type.
//! - `storage`: deduplicating storage with managed and hash-usage handles.
//! - `toc`, `persistation`, `files`: resource file format and open-file registry.
//! - `component`: the facade scene and network code talk to.
//! - `requests`, `net`: demand tracking and the wire protocol.
//! - `render`: device upload traits and a headless backend.
//!
//! No `unsafe`.

pub mod component;
pub mod config;
pub mod error;
pub mod event;
pub mod files;
pub mod hash;
pub mod net;
pub mod persistation;
pub mod render;
pub mod requests;
pub mod resource;
pub mod scene;
pub mod storage;
pub mod toc;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::component::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::hash::*;
    pub use crate::net::*;
    pub use crate::resource::*;
    pub use crate::scene::*;
    pub use crate::storage::{ManagedResource, ResourceHashUsage, ResourceStorage};
}

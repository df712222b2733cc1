//! Error types for the resource cache.
//!
//! Library layers return [`ResourceError`]; binaries and the network layer wrap it
//! with `anyhow` context. Exceeding the GPU cache budget is not an error and never
//! shows up here.

use thiserror::Error;

use crate::hash::ContentHash;

/// Errors surfaced by storage, resource files and the upload path.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Hash unknown to storage and to every registered resource file.
    #[error("resource {0} not found in memory or any registered resource file")]
    NotFound(ContentHash),
    /// Opening, reading or writing a resource file failed.
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    /// The table of contents of a resource file could not be parsed.
    #[error("corrupt resource index: {0}")]
    CorruptIndex(String),
    /// A resource blob could not be decoded or decompressed.
    #[error("corrupt resource data for {hash}: {reason}")]
    CorruptData { hash: ContentHash, reason: String },
    /// The device refused the resource.
    #[error("upload of {hash} failed: {reason}")]
    UploadFailure { hash: ContentHash, reason: String },
    /// Offsets in the file format are 32-bit.
    #[error("resource file exceeds the 4 GiB addressable by its index ({0} bytes)")]
    FileTooLarge(u64),
}

impl ResourceError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ResourceError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn corrupt_data(hash: ContentHash, reason: impl Into<String>) -> Self {
        ResourceError::CorruptData {
            hash,
            reason: reason.into(),
        }
    }
}

/// Convenience alias used across the crate.
pub type ResourceResult<T> = Result<T, ResourceError>;

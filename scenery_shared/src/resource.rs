//! Resources: typed byte blobs identified by their content hash.
//!
//! A resource holds its payload either decoded or LZ4-compressed, never both. The
//! hash is computed on first use and cached; compressing or decompressing only swaps
//! the resident form and never changes the hash.

use std::{
    fmt,
    sync::{OnceLock, PoisonError, RwLock},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    error::{ResourceError, ResourceResult},
    hash::ContentHash,
};

/// Cache flag value telling consumers not to keep the resource around.
pub const DO_NOT_CACHE: u32 = 0;

/// Kinds of resources the renderer knows how to upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResourceType {
    VertexArray = 1,
    IndexArray = 2,
    Texture2D = 3,
    Texture3D = 4,
    TextureCube = 5,
    /// Shader program; compiled asynchronously and expensive to recreate.
    Effect = 6,
}

impl ResourceType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => ResourceType::VertexArray,
            2 => ResourceType::IndexArray,
            3 => ResourceType::Texture2D,
            4 => ResourceType::Texture3D,
            5 => ResourceType::TextureCube,
            6 => ResourceType::Effect,
            _ => return None,
        })
    }

    pub fn is_effect(self) -> bool {
        self == ResourceType::Effect
    }
}

/// Summary of a resource that stays available when its bytes are not resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub resource_type: ResourceType,
    pub hash: ContentHash,
    pub decompressed_size: u32,
    /// Zero when the bytes are (or were stored) uncompressed.
    pub compressed_size: u32,
}

impl ResourceInfo {
    pub fn is_compressed(&self) -> bool {
        self.compressed_size != 0
    }
}

enum Payload {
    Decompressed(Bytes),
    Compressed(Bytes),
}

/// A single resource.
///
/// Shared between threads behind an `Arc`; the interior locks only guard the
/// compress/decompress swap and the memoized hash.
pub struct Resource {
    resource_type: ResourceType,
    name: String,
    cache_flag: u32,
    metadata: Bytes,
    decompressed_size: u32,
    payload: RwLock<Payload>,
    hash: OnceLock<ContentHash>,
}

impl Resource {
    /// Creates a resource from decoded bytes.
    ///
    /// `metadata` is the type-specific header (array layout, texture format, effect
    /// reflection) produced alongside the bytes; it takes part in the hash.
    pub fn new(
        resource_type: ResourceType,
        data: impl Into<Bytes>,
        metadata: impl Into<Bytes>,
        cache_flag: u32,
        name: impl Into<String>,
    ) -> Self {
        let data = data.into();
        Self {
            resource_type,
            name: name.into(),
            cache_flag,
            metadata: metadata.into(),
            decompressed_size: u32::try_from(data.len()).unwrap_or(u32::MAX),
            payload: RwLock::new(Payload::Decompressed(data)),
            hash: OnceLock::new(),
        }
    }

    /// Rebuilds a resource read back from a file or the wire. `hash` must already be
    /// verified against the decoded bytes.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_stored(
        resource_type: ResourceType,
        hash: ContentHash,
        cache_flag: u32,
        name: String,
        metadata: Bytes,
        decompressed_size: u32,
        payload: Bytes,
        compressed: bool,
    ) -> Self {
        let payload = if compressed {
            Payload::Compressed(payload)
        } else {
            Payload::Decompressed(payload)
        };
        let memo = OnceLock::new();
        let _ = memo.set(hash);
        Self {
            resource_type,
            name,
            cache_flag,
            metadata,
            decompressed_size,
            payload: RwLock::new(payload),
            hash: memo,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_flag(&self) -> u32 {
        self.cache_flag
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn decompressed_size(&self) -> u32 {
        self.decompressed_size
    }

    /// Size of the compressed form, or 0 while the decoded form is resident.
    pub fn compressed_size(&self) -> u32 {
        match &*self.read_payload() {
            Payload::Compressed(c) => c.len() as u32,
            Payload::Decompressed(_) => 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(&*self.read_payload(), Payload::Compressed(_))
    }

    /// Bytes currently held in memory for this resource.
    pub fn resident_size(&self) -> usize {
        let payload = match &*self.read_payload() {
            Payload::Compressed(c) => c.len(),
            Payload::Decompressed(d) => d.len(),
        };
        payload + self.metadata.len()
    }

    /// Content hash over type, metadata and decoded bytes. Computed once.
    pub fn hash(&self) -> ContentHash {
        *self.hash.get_or_init(|| {
            match &*self.read_payload() {
                Payload::Decompressed(d) => content_hash(self.resource_type, &self.metadata, d),
                Payload::Compressed(c) => {
                    match decode_lz4(ContentHash::INVALID, c, self.decompressed_size) {
                        Ok(d) => content_hash(self.resource_type, &self.metadata, &d),
                        Err(e) => {
                            error!(name = %self.name, error = %e, "cannot decode payload for hashing");
                            content_hash(self.resource_type, &self.metadata, c)
                        }
                    }
                }
            }
        })
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            resource_type: self.resource_type,
            hash: self.hash(),
            decompressed_size: self.decompressed_size,
            compressed_size: self.compressed_size(),
        }
    }

    /// Replaces the decoded form with its LZ4 compression.
    ///
    /// Returns `false` and keeps the decoded form when compression would not shrink it.
    pub fn compress(&self) -> bool {
        // Fix the hash while the decoded bytes are at hand.
        self.hash();
        let mut payload = self.payload.write().unwrap_or_else(PoisonError::into_inner);
        let compressed = match &*payload {
            Payload::Compressed(_) => return true,
            Payload::Decompressed(d) if d.is_empty() => return false,
            Payload::Decompressed(d) => lz4_flex::compress(d),
        };
        if compressed.len() >= self.decompressed_size as usize {
            return false;
        }
        *payload = Payload::Compressed(Bytes::from(compressed));
        true
    }

    /// Replaces the compressed form with the decoded bytes.
    pub fn decompress(&self) -> ResourceResult<()> {
        let mut payload = self.payload.write().unwrap_or_else(PoisonError::into_inner);
        if let Payload::Compressed(c) = &*payload {
            // A compressed payload always carries its hash; never re-enter `hash()` here.
            let hash = self.hash.get().copied().unwrap_or_default();
            let decoded = decode_lz4(hash, c, self.decompressed_size)?;
            *payload = Payload::Decompressed(decoded);
        }
        Ok(())
    }

    /// Decoded bytes, decompressing in place first if needed.
    pub fn decompressed_data(&self) -> ResourceResult<Bytes> {
        if let Payload::Decompressed(d) = &*self.read_payload() {
            return Ok(d.clone());
        }
        self.decompress()?;
        match &*self.read_payload() {
            Payload::Decompressed(d) => Ok(d.clone()),
            Payload::Compressed(_) => Err(ResourceError::corrupt_data(
                self.hash(),
                "payload was recompressed concurrently",
            )),
        }
    }

    /// Compressed bytes if that is the resident form.
    pub fn compressed_data(&self) -> Option<Bytes> {
        match &*self.read_payload() {
            Payload::Compressed(c) => Some(c.clone()),
            Payload::Decompressed(_) => None,
        }
    }

    /// Resident payload and whether it is compressed.
    pub(crate) fn stored_payload(&self) -> (Bytes, bool) {
        match &*self.read_payload() {
            Payload::Compressed(c) => (c.clone(), true),
            Payload::Decompressed(d) => (d.clone(), false),
        }
    }

    fn read_payload(&self) -> std::sync::RwLockReadGuard<'_, Payload> {
        self.payload.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Content hash of decoded bytes, as [`Resource::hash`] computes it.
pub(crate) fn content_hash(resource_type: ResourceType, metadata: &[u8], data: &[u8]) -> ContentHash {
    ContentHash::compute(&[&resource_type.as_u32().to_le_bytes(), metadata, data])
}

/// Largest output an LZ4 block of `compressed_len` bytes can expand to.
fn max_lz4_output(compressed_len: usize) -> u64 {
    (compressed_len as u64).saturating_mul(255) + 16
}

pub(crate) fn decode_lz4(hash: ContentHash, compressed: &[u8], size: u32) -> ResourceResult<Bytes> {
    if u64::from(size) > max_lz4_output(compressed.len()) {
        return Err(ResourceError::corrupt_data(
            hash,
            format!(
                "{} compressed bytes cannot decode to {size}",
                compressed.len()
            ),
        ));
    }
    let decoded = lz4_flex::decompress(compressed, size as usize)
        .map_err(|e| ResourceError::corrupt_data(hash, e.to_string()))?;
    if decoded.len() != size as usize {
        return Err(ResourceError::corrupt_data(
            hash,
            format!("decoded {} bytes, expected {size}", decoded.len()),
        ));
    }
    Ok(Bytes::from(decoded))
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("type", &self.resource_type)
            .field("name", &self.name)
            .field("hash", &self.hash.get())
            .field("decompressed_size", &self.decompressed_size)
            .field("compressed", &self.is_compressed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(fill: u8, len: usize) -> Resource {
        Resource::new(
            ResourceType::Texture2D,
            vec![fill; len],
            &b"rgba8 32x32"[..],
            DO_NOT_CACHE,
            "tex",
        )
    }

    #[test]
    fn lz4_rejects_impossible_decoded_size() {
        let packed = lz4_flex::compress(&[0u8; 64]);
        let err = decode_lz4(ContentHash::INVALID, &packed, u32::MAX).unwrap_err();
        assert!(matches!(err, ResourceError::CorruptData { .. }), "{err}");
        assert_eq!(decode_lz4(ContentHash::INVALID, &packed, 64).unwrap().len(), 64);
    }

    #[test]
    fn hash_ignores_name_and_cache_flag() {
        let a = texture(7, 64);
        let b = Resource::new(
            ResourceType::Texture2D,
            vec![7u8; 64],
            &b"rgba8 32x32"[..],
            3,
            "other name",
        );
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_depends_on_type_and_metadata() {
        let tex = texture(1, 16);
        let arr = Resource::new(ResourceType::VertexArray, vec![1u8; 16], &b"rgba8 32x32"[..], 0, "");
        let other_meta = Resource::new(ResourceType::Texture2D, vec![1u8; 16], &b"r8 64x16"[..], 0, "");
        assert_ne!(tex.hash(), arr.hash());
        assert_ne!(tex.hash(), other_meta.hash());
    }

    #[test]
    fn compress_swaps_resident_form_and_keeps_hash() {
        let res = texture(9, 4096);
        let hash = res.hash();
        assert!(res.compress());
        assert!(res.is_compressed());
        assert!(res.compressed_size() > 0);
        assert!(res.resident_size() < 4096);
        assert_eq!(res.hash(), hash);

        let data = res.decompressed_data().unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|b| *b == 9));
        assert!(!res.is_compressed());
        assert_eq!(res.compressed_size(), 0);
    }

    #[test]
    fn incompressible_payload_stays_decoded() {
        let noise: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let res = Resource::new(ResourceType::IndexArray, noise, Bytes::new(), 0, "noise");
        assert!(!res.compress());
        assert!(!res.is_compressed());
    }

    #[test]
    fn hash_of_compressed_stored_resource_is_trusted() {
        let original = texture(3, 2000);
        let compressed = lz4_flex::compress(&vec![3u8; 2000]);
        let stored = Resource::from_stored(
            ResourceType::Texture2D,
            original.hash(),
            0,
            "tex".into(),
            Bytes::from_static(b"rgba8 32x32"),
            2000,
            Bytes::from(compressed),
            true,
        );
        assert_eq!(stored.hash(), original.hash());
        assert_eq!(stored.decompressed_data().unwrap(), original.decompressed_data().unwrap());
    }

    #[test]
    fn corrupt_compressed_payload_reports_error() {
        let stored = Resource::from_stored(
            ResourceType::Texture2D,
            ContentHash::new(1, 1),
            0,
            String::new(),
            Bytes::new(),
            100,
            Bytes::from_static(&[0xff, 0x00, 0x01]),
            true,
        );
        assert!(matches!(
            stored.decompressed_data(),
            Err(ResourceError::CorruptData { .. })
        ));
    }

    #[test]
    fn resource_type_u32_roundtrip() {
        for t in [
            ResourceType::VertexArray,
            ResourceType::IndexArray,
            ResourceType::Texture2D,
            ResourceType::Texture3D,
            ResourceType::TextureCube,
            ResourceType::Effect,
        ] {
            assert_eq!(ResourceType::from_u32(t.as_u32()), Some(t));
        }
        assert_eq!(ResourceType::from_u32(0), None);
    }
}

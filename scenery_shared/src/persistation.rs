//! Resource blobs and resource files.
//!
//! A resource file is a run of blobs followed by a [`TableOfContents`]. Each blob is:
//!
//! ```text
//! type: u32, hash: 16 bytes, cache_flag: u32,
//! name_len: u32, name: utf-8, metadata_len: u32, metadata,
//! decompressed_size: u32, compressed_size: u32 (0 = stored raw),
//! payload
//! ```
//!
//! The same blob encoding is used on the wire, so a receiving process rebuilds a
//! resource with the identical hash.

use std::{
    collections::BTreeMap,
    io::{Read, Seek, SeekFrom, Write},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::{
    error::{ResourceError, ResourceResult},
    hash::{ContentHash, CONTENT_HASH_BYTES},
    resource::{content_hash, decode_lz4, Resource, ResourceInfo, ResourceType},
    storage::ManagedResource,
    toc::{ResourceFileEntry, TableOfContents},
};

/// Resources at or below this decoded size are stored raw.
pub const COMPRESSION_THRESHOLD: u32 = 1000;

/// An encoded blob plus the info that goes into the index.
#[derive(Debug, Clone)]
pub struct EncodedBlob {
    pub bytes: BytesMut,
    pub info: ResourceInfo,
}

fn blob_payload(resource: &Resource, compress: bool) -> ResourceResult<(Bytes, u32)> {
    let (stored, is_compressed) = resource.stored_payload();
    let size = resource.decompressed_size();
    let want_compressed = compress && size > COMPRESSION_THRESHOLD;
    match (is_compressed, want_compressed) {
        (true, true) => {
            let len = stored.len() as u32;
            Ok((stored, len))
        }
        (true, false) => Ok((decode_lz4(resource.hash(), &stored, size)?, 0)),
        (false, true) => {
            let packed = lz4_flex::compress(&stored);
            if packed.len() < stored.len() {
                let len = packed.len() as u32;
                Ok((Bytes::from(packed), len))
            } else {
                Ok((stored, 0))
            }
        }
        (false, false) => Ok((stored, 0)),
    }
}

/// Encodes one resource, compressing it when `compress` is set and it is large enough.
pub fn encode_resource(resource: &Resource, compress: bool) -> ResourceResult<EncodedBlob> {
    let hash = resource.hash();
    let (payload, compressed_size) = blob_payload(resource, compress)?;
    let name = resource.name().as_bytes();
    let metadata = resource.metadata();

    let mut buf = BytesMut::with_capacity(
        4 + CONTENT_HASH_BYTES + 4 + 4 + name.len() + 4 + metadata.len() + 8 + payload.len(),
    );
    buf.put_u32_le(resource.resource_type().as_u32());
    buf.put_slice(&hash.to_le_bytes());
    buf.put_u32_le(resource.cache_flag());
    buf.put_u32_le(name.len() as u32);
    buf.put_slice(name);
    buf.put_u32_le(metadata.len() as u32);
    buf.put_slice(metadata);
    buf.put_u32_le(resource.decompressed_size());
    buf.put_u32_le(compressed_size);
    buf.put_slice(&payload);

    Ok(EncodedBlob {
        bytes: buf,
        info: ResourceInfo {
            resource_type: resource.resource_type(),
            hash,
            decompressed_size: resource.decompressed_size(),
            compressed_size,
        },
    })
}

fn take_len_prefixed(blob: &mut &[u8], hash: ContentHash, what: &str) -> ResourceResult<Bytes> {
    if blob.remaining() < 4 {
        return Err(ResourceError::corrupt_data(hash, format!("missing {what} length")));
    }
    let len = blob.get_u32_le() as usize;
    if blob.remaining() < len {
        return Err(ResourceError::corrupt_data(hash, format!("{what} truncated")));
    }
    Ok(blob.copy_to_bytes(len))
}

/// Decodes a single blob produced by [`encode_resource`] and checks its content
/// against the stored hash. The payload stays in the form it was stored in.
pub fn decode_resource(mut blob: &[u8]) -> ResourceResult<Resource> {
    const HEADER: usize = 4 + CONTENT_HASH_BYTES + 4;
    if blob.remaining() < HEADER {
        return Err(ResourceError::corrupt_data(
            ContentHash::INVALID,
            "blob shorter than its header",
        ));
    }
    let raw_type = blob.get_u32_le();
    let mut hash = [0u8; CONTENT_HASH_BYTES];
    blob.copy_to_slice(&mut hash);
    let hash = ContentHash::from_le_bytes(hash);
    let resource_type = ResourceType::from_u32(raw_type)
        .ok_or_else(|| ResourceError::corrupt_data(hash, format!("unknown type {raw_type}")))?;
    let cache_flag = blob.get_u32_le();

    let name = take_len_prefixed(&mut blob, hash, "name")?;
    let name = String::from_utf8(name.to_vec())
        .map_err(|_| ResourceError::corrupt_data(hash, "name is not utf-8"))?;
    let metadata = take_len_prefixed(&mut blob, hash, "metadata")?;

    if blob.remaining() < 8 {
        return Err(ResourceError::corrupt_data(hash, "missing sizes"));
    }
    let decompressed_size = blob.get_u32_le();
    let compressed_size = blob.get_u32_le();
    let expected = if compressed_size == 0 {
        decompressed_size
    } else {
        compressed_size
    };
    if blob.remaining() != expected as usize {
        return Err(ResourceError::corrupt_data(
            hash,
            format!("payload is {} bytes, expected {expected}", blob.remaining()),
        ));
    }
    let payload = blob.copy_to_bytes(expected as usize);

    let decoded = if compressed_size == 0 {
        payload.clone()
    } else {
        decode_lz4(hash, &payload, decompressed_size)?
    };
    let actual = content_hash(resource_type, &metadata, &decoded);
    if actual != hash {
        return Err(ResourceError::corrupt_data(
            hash,
            format!("content hashes to {actual}"),
        ));
    }

    Ok(Resource::from_stored(
        resource_type,
        hash,
        cache_flag,
        name,
        metadata,
        decompressed_size,
        payload,
        compressed_size != 0,
    ))
}

/// Writes one blob and returns its size.
pub fn write_one_resource<W: Write>(
    out: &mut W,
    resource: &Resource,
    compress: bool,
) -> ResourceResult<u32> {
    let blob = encode_resource(resource, compress)?;
    let size = u32::try_from(blob.bytes.len())
        .map_err(|_| ResourceError::FileTooLarge(blob.bytes.len() as u64))?;
    out.write_all(&blob.bytes)
        .map_err(|e| ResourceError::io(format!("write resource {}", blob.info.hash), e))?;
    Ok(size)
}

/// Writes a deduplicated, hash-sorted set of resources followed by their index.
///
/// `out` must be positioned at the start of the file; offsets in the index are
/// relative to where this call starts writing.
pub fn write_named_resources_with_toc<W: Write>(
    out: &mut W,
    resources: &[ManagedResource],
    compress: bool,
) -> ResourceResult<TableOfContents> {
    let unique: BTreeMap<ContentHash, &ManagedResource> =
        resources.iter().map(|r| (r.hash(), r)).collect();

    let mut toc = TableOfContents::new();
    let mut offset: u64 = 0;
    for (hash, resource) in unique {
        let blob = encode_resource(resource, compress)?;
        let start = u32::try_from(offset).map_err(|_| ResourceError::FileTooLarge(offset))?;
        let size = u32::try_from(blob.bytes.len())
            .map_err(|_| ResourceError::FileTooLarge(blob.bytes.len() as u64))?;
        out.write_all(&blob.bytes)
            .map_err(|e| ResourceError::io(format!("write resource {hash}"), e))?;
        debug!(%hash, offset, size, compressed = blob.info.is_compressed(), "resource written");
        toc.register_contents(blob.info, start, size);
        offset += u64::from(size);
    }
    if offset > u64::from(u32::MAX) {
        return Err(ResourceError::FileTooLarge(offset));
    }
    toc.write_with_footer(out, offset)?;
    Ok(toc)
}

/// Reads exactly the blob described by `entry`.
pub fn read_blob<R: Read + Seek>(
    stream: &mut R,
    entry: &ResourceFileEntry,
) -> ResourceResult<Vec<u8>> {
    let mut blob = vec![0u8; entry.size as usize];
    stream
        .seek(SeekFrom::Start(u64::from(entry.offset)))
        .and_then(|_| stream.read_exact(&mut blob))
        .map_err(|e| ResourceError::io(format!("read resource {}", entry.info.hash), e))?;
    Ok(blob)
}

/// Loads the resource described by `entry`, checking it is the one the index promised.
pub fn retrieve_resource<R: Read + Seek>(
    stream: &mut R,
    entry: &ResourceFileEntry,
) -> ResourceResult<Resource> {
    let blob = read_blob(stream, entry)?;
    let resource = decode_resource(&blob)?;
    let expected = entry.info.hash;
    if resource.hash() != expected || resource.resource_type() != entry.info.resource_type {
        return Err(ResourceError::corrupt_data(
            expected,
            format!("blob holds {} instead", resource.hash()),
        ));
    }
    Ok(resource)
}

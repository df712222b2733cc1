//! Table of contents of a resource file.
//!
//! Layout, all little-endian, written after the resource blobs:
//!
//! ```text
//! count: u32
//! count × { hash: 16 bytes, offset: u32, size: u32,
//!           type: u32, decompressed_size: u32, compressed_size: u32 }
//! toc_offset: u64   (file footer)
//! ```
//!
//! Entries are written in hash order so identical inputs produce identical files.

use std::{
    collections::BTreeMap,
    io::{Read, Seek, SeekFrom, Write},
};

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    error::{ResourceError, ResourceResult},
    hash::{ContentHash, CONTENT_HASH_BYTES},
    resource::{ResourceInfo, ResourceType},
};

/// Bytes per serialized TOC entry.
pub const TOC_ENTRY_BYTES: usize = CONTENT_HASH_BYTES + 4 * 5;
/// Bytes of the trailing TOC offset.
pub const TOC_FOOTER_BYTES: usize = 8;

/// Where one resource lives inside its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceFileEntry {
    pub offset: u32,
    pub size: u32,
    pub info: ResourceInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOfContents {
    entries: BTreeMap<ContentHash, ResourceFileEntry>,
}

impl TableOfContents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_contents(&mut self, info: ResourceInfo, offset: u32, size: u32) {
        self.entries
            .insert(info.hash, ResourceFileEntry { offset, size, info });
    }

    pub fn contains(&self, hash: ContentHash) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn entry(&self, hash: ContentHash) -> Option<&ResourceFileEntry> {
        self.entries.get(&hash)
    }

    /// Entries in hash order.
    pub fn entries(&self) -> impl Iterator<Item = &ResourceFileEntry> {
        self.entries.values()
    }

    pub fn hashes(&self) -> impl Iterator<Item = ContentHash> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the TOC body (without footer).
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4 + self.entries.len() * TOC_ENTRY_BYTES);
        buf.put_u32_le(self.entries.len() as u32);
        for (hash, e) in &self.entries {
            buf.put_slice(&hash.to_le_bytes());
            buf.put_u32_le(e.offset);
            buf.put_u32_le(e.size);
            buf.put_u32_le(e.info.resource_type.as_u32());
            buf.put_u32_le(e.info.decompressed_size);
            buf.put_u32_le(e.info.compressed_size);
        }
        buf
    }

    /// Writes body and footer. `toc_offset` is the stream position the body starts at.
    pub fn write_with_footer<W: Write>(&self, out: &mut W, toc_offset: u64) -> ResourceResult<()> {
        let mut buf = self.encode();
        buf.put_u64_le(toc_offset);
        out.write_all(&buf)
            .map_err(|e| ResourceError::io("write table of contents", e))
    }

    /// Parses a TOC body. `blob_area_end` bounds every entry's byte range.
    pub fn decode(mut body: &[u8], blob_area_end: u64) -> ResourceResult<Self> {
        if body.remaining() < 4 {
            return Err(ResourceError::CorruptIndex("missing entry count".into()));
        }
        let count = body.get_u32_le() as usize;
        if body.remaining() != count * TOC_ENTRY_BYTES {
            return Err(ResourceError::CorruptIndex(format!(
                "{count} entries need {} bytes, found {}",
                count * TOC_ENTRY_BYTES,
                body.remaining()
            )));
        }

        let mut toc = TableOfContents::new();
        for _ in 0..count {
            let mut hash = [0u8; CONTENT_HASH_BYTES];
            body.copy_to_slice(&mut hash);
            let hash = ContentHash::from_le_bytes(hash);
            let offset = body.get_u32_le();
            let size = body.get_u32_le();
            let raw_type = body.get_u32_le();
            let decompressed_size = body.get_u32_le();
            let compressed_size = body.get_u32_le();

            let resource_type = ResourceType::from_u32(raw_type).ok_or_else(|| {
                ResourceError::CorruptIndex(format!("unknown resource type {raw_type} for {hash}"))
            })?;
            if u64::from(offset) + u64::from(size) > blob_area_end {
                return Err(ResourceError::CorruptIndex(format!(
                    "entry {hash} range {offset}+{size} exceeds blob area of {blob_area_end} bytes"
                )));
            }
            if toc.contains(hash) {
                return Err(ResourceError::CorruptIndex(format!("duplicate entry {hash}")));
            }
            toc.register_contents(
                ResourceInfo {
                    resource_type,
                    hash,
                    decompressed_size,
                    compressed_size,
                },
                offset,
                size,
            );
        }
        Ok(toc)
    }

    /// Reads the footer, then the TOC it points at.
    ///
    /// On any error nothing is returned; a file is either fully indexed or rejected.
    pub fn read_from_stream<R: Read + Seek>(stream: &mut R) -> ResourceResult<Self> {
        let file_len = stream
            .seek(SeekFrom::End(0))
            .map_err(|e| ResourceError::io("seek resource file end", e))?;
        if file_len < (TOC_FOOTER_BYTES + 4) as u64 {
            return Err(ResourceError::CorruptIndex(format!(
                "file of {file_len} bytes is too short for an index"
            )));
        }

        let footer_pos = file_len - TOC_FOOTER_BYTES as u64;
        let mut footer = [0u8; TOC_FOOTER_BYTES];
        stream
            .seek(SeekFrom::Start(footer_pos))
            .and_then(|_| stream.read_exact(&mut footer))
            .map_err(|e| ResourceError::io("read index offset", e))?;
        let toc_offset = u64::from_le_bytes(footer);
        if toc_offset > footer_pos {
            return Err(ResourceError::CorruptIndex(format!(
                "index offset {toc_offset} points past the footer at {footer_pos}"
            )));
        }

        let mut body = vec![0u8; (footer_pos - toc_offset) as usize];
        stream
            .seek(SeekFrom::Start(toc_offset))
            .and_then(|_| stream.read_exact(&mut body))
            .map_err(|e| ResourceError::io("read index", e))?;
        Self::decode(&body, toc_offset)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn info(low: u64, ty: ResourceType, decompressed: u32, compressed: u32) -> ResourceInfo {
        ResourceInfo {
            resource_type: ty,
            hash: ContentHash::new(low, 0),
            decompressed_size: decompressed,
            compressed_size: compressed,
        }
    }

    fn file_with(toc: &TableOfContents, blob_area: usize) -> Vec<u8> {
        let mut file = vec![0xAAu8; blob_area];
        toc.write_with_footer(&mut file, blob_area as u64).unwrap();
        file
    }

    #[test]
    fn encodes_exact_layout() {
        let mut toc = TableOfContents::new();
        toc.register_contents(info(7, ResourceType::Effect, 500, 0), 0, 520);
        let body = toc.encode();
        assert_eq!(body.len(), 4 + TOC_ENTRY_BYTES);
        assert_eq!(&body[..4], &1u32.to_le_bytes());
        assert_eq!(&body[4..20], &ContentHash::new(7, 0).to_le_bytes());
        assert_eq!(&body[20..24], &0u32.to_le_bytes());
        assert_eq!(&body[24..28], &520u32.to_le_bytes());
        assert_eq!(&body[28..32], &6u32.to_le_bytes());
        assert_eq!(&body[32..36], &500u32.to_le_bytes());
        assert_eq!(&body[36..40], &0u32.to_le_bytes());
    }

    #[test]
    fn reads_back_written_index() {
        let mut toc = TableOfContents::new();
        toc.register_contents(info(2, ResourceType::Texture2D, 2000, 60), 0, 100);
        toc.register_contents(info(1, ResourceType::Effect, 500, 0), 100, 540);
        let file = file_with(&toc, 640);

        let read = TableOfContents::read_from_stream(&mut Cursor::new(file)).unwrap();
        assert_eq!(read, toc);
        let hashes: Vec<_> = read.hashes().collect();
        assert_eq!(hashes, vec![ContentHash::new(1, 0), ContentHash::new(2, 0)]);
        assert!(read.entry(ContentHash::new(2, 0)).unwrap().info.is_compressed());
    }

    #[test]
    fn empty_index_is_valid() {
        let file = file_with(&TableOfContents::new(), 0);
        let read = TableOfContents::read_from_stream(&mut Cursor::new(file)).unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn rejects_truncated_file() {
        let err = TableOfContents::read_from_stream(&mut Cursor::new(vec![0u8; 5])).unwrap_err();
        assert!(matches!(err, ResourceError::CorruptIndex(_)));
    }

    #[test]
    fn rejects_footer_past_end() {
        let mut file = file_with(&TableOfContents::new(), 16);
        let n = file.len();
        file[n - 8..].copy_from_slice(&10_000u64.to_le_bytes());
        let err = TableOfContents::read_from_stream(&mut Cursor::new(file)).unwrap_err();
        assert!(matches!(err, ResourceError::CorruptIndex(_)));
    }

    #[test]
    fn rejects_range_outside_blob_area() {
        let mut toc = TableOfContents::new();
        toc.register_contents(info(3, ResourceType::IndexArray, 10, 0), 8, 100);
        let file = file_with(&toc, 32);
        let err = TableOfContents::read_from_stream(&mut Cursor::new(file)).unwrap_err();
        assert!(matches!(err, ResourceError::CorruptIndex(_)));
    }

    #[test]
    fn rejects_unknown_type_and_wrong_count() {
        let mut toc = TableOfContents::new();
        toc.register_contents(info(4, ResourceType::VertexArray, 4, 0), 0, 4);
        let mut body = toc.encode().to_vec();
        body[28..32].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            TableOfContents::decode(&body, 4),
            Err(ResourceError::CorruptIndex(_))
        ));

        let mut body = toc.encode().to_vec();
        body[..4].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            TableOfContents::decode(&body, 4),
            Err(ResourceError::CorruptIndex(_))
        ));
    }
}

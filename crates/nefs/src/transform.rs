//! Description of how an item's bytes are chunked, compressed and encrypted.

use std::sync::Arc;

/// Compression applied to each chunk, at most one kind per item
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum NefsCompression {
    /// Stores the chunk as it is
    #[default]
    None,

    /// Compress each chunk with zlib
    Zlib,

    /// Compress each chunk with the game's LZSS variant
    Lzss,
}

/// Per item transform: chunk size, compression and optional AES-256 encryption
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NefsDataTransform {
    chunk_size: u32,
    compression: NefsCompression,
    aes_key: Option<[u8; 32]>,
}

const BLOCK_KIND_ZLIB: u16 = 0x1;
const BLOCK_KIND_LZSS: u16 = 0x2;
const BLOCK_KIND_AES: u16 = 0x4;

impl NefsDataTransform {
    /// A transform that only slices bytes into chunks of `chunk_size`
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size,
            compression: NefsCompression::None,
            aes_key: None,
        }
    }

    pub fn with_compression(mut self, compression: NefsCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_aes_key(mut self, key: Option<[u8; 32]>) -> Self {
        self.aes_key = key;
        self
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn compression(&self) -> NefsCompression {
        self.compression
    }

    pub fn aes_key(&self) -> Option<&[u8; 32]> {
        self.aes_key.as_ref()
    }

    pub fn is_zlib_compressed(&self) -> bool {
        self.compression == NefsCompression::Zlib
    }

    pub fn is_lzss_compressed(&self) -> bool {
        self.compression == NefsCompression::Lzss
    }

    pub fn is_encrypted(&self) -> bool {
        self.aes_key.is_some()
    }

    /// Transform described by the kind bits of one block table row
    ///
    /// Returns `None` when the kind asks for AES but no key is given.
    pub fn from_block_kind(chunk_size: u32, kind: u16, aes_key: Option<[u8; 32]>) -> Option<Self> {
        let compression = if kind & BLOCK_KIND_ZLIB != 0 {
            NefsCompression::Zlib
        } else if kind & BLOCK_KIND_LZSS != 0 {
            NefsCompression::Lzss
        } else {
            NefsCompression::None
        };
        let aes_key = match kind & BLOCK_KIND_AES {
            0 => None,
            _ => Some(aes_key?),
        };

        Some(
            Self::new(chunk_size)
                .with_compression(compression)
                .with_aes_key(aes_key),
        )
    }

    /// Kind bits stored per chunk in block tables that carry them
    pub fn block_kind(&self) -> u16 {
        let compression = match self.compression {
            NefsCompression::None => 0,
            NefsCompression::Zlib => BLOCK_KIND_ZLIB,
            NefsCompression::Lzss => BLOCK_KIND_LZSS,
        };
        if self.is_encrypted() {
            compression | BLOCK_KIND_AES
        } else {
            compression
        }
    }
}

/// One stored chunk of an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NefsDataChunk {
    size: u32,
    cumulative_size: u32,
    checksum: u16,
    transform: Arc<NefsDataTransform>,
}

impl NefsDataChunk {
    pub fn new(
        size: u32,
        cumulative_size: u32,
        checksum: u16,
        transform: Arc<NefsDataTransform>,
    ) -> Self {
        Self {
            size,
            cumulative_size,
            checksum,
            transform,
        }
    }

    /// Builds a chunk list from running totals, deriving each chunk's own size
    pub fn create_chunk_list(
        cumulative_sizes: &[u32],
        transform: &Arc<NefsDataTransform>,
    ) -> Vec<NefsDataChunk> {
        let with_checksums: Vec<(u32, u16)> = cumulative_sizes.iter().map(|c| (*c, 0)).collect();
        Self::create_chunk_list_with_checksums(&with_checksums, transform)
    }

    /// Like [`NefsDataChunk::create_chunk_list`], keeping a checksum per chunk
    pub fn create_chunk_list_with_checksums(
        cumulative_sizes: &[(u32, u16)],
        transform: &Arc<NefsDataTransform>,
    ) -> Vec<NefsDataChunk> {
        let mut previous = 0u32;
        cumulative_sizes
            .iter()
            .map(|(cumulative, checksum)| {
                let chunk = NefsDataChunk::new(
                    cumulative.saturating_sub(previous),
                    *cumulative,
                    *checksum,
                    Arc::clone(transform),
                );
                previous = *cumulative;
                chunk
            })
            .collect()
    }

    /// Transformed size of this chunk
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Transformed size of this chunk and all chunks before it
    pub fn cumulative_size(&self) -> u32 {
        self.cumulative_size
    }

    /// Offset of this chunk relative to the item's first stored byte
    pub fn start(&self) -> u32 {
        self.cumulative_size - self.size
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn transform(&self) -> &Arc<NefsDataTransform> {
        &self.transform
    }
}

/// Extracted size of an item and the chunks it is stored as
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NefsItemSize {
    extracted_size: u64,
    chunks: Vec<NefsDataChunk>,
}

impl NefsItemSize {
    /// Size of an item stored without chunks
    pub const fn new(extracted_size: u64) -> Self {
        Self {
            extracted_size,
            chunks: Vec::new(),
        }
    }

    pub fn with_chunks(extracted_size: u64, chunks: Vec<NefsDataChunk>) -> Self {
        Self {
            extracted_size,
            chunks,
        }
    }

    pub fn extracted_size(&self) -> u64 {
        self.extracted_size
    }

    /// Stored size: the last chunk's running total, or the extracted size without chunks
    pub fn transformed_size(&self) -> u64 {
        self.chunks
            .last()
            .map_or(self.extracted_size, |c| u64::from(c.cumulative_size))
    }

    pub fn chunks(&self) -> &[NefsDataChunk] {
        &self.chunks
    }

    /// Whether the stored bytes are the extracted bytes
    pub fn is_uncompressed(&self) -> bool {
        self.transformed_size() == self.extracted_size
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use crate::transform::{NefsCompression, NefsDataChunk, NefsDataTransform, NefsItemSize};

    #[test]
    fn chunk_sizes_from_running_totals() {
        let transform = Arc::new(NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib));
        let chunks = NefsDataChunk::create_chunk_list(&[11, 12, 13], &transform);

        let sizes: Vec<u32> = chunks.iter().map(NefsDataChunk::size).collect();
        let cumulative: Vec<u32> = chunks.iter().map(NefsDataChunk::cumulative_size).collect();
        let starts: Vec<u32> = chunks.iter().map(NefsDataChunk::start).collect();

        assert_eq!(sizes, vec![11, 1, 1]);
        assert_eq!(cumulative, vec![11, 12, 13]);
        assert_eq!(starts, vec![0, 11, 12]);
        assert!(chunks.iter().all(|c| Arc::ptr_eq(c.transform(), &transform)));
    }

    #[test]
    fn transformed_size_without_chunks() {
        let size = NefsItemSize::new(42);
        assert_eq!(size.transformed_size(), 42);
        assert!(size.is_uncompressed());
    }

    #[test]
    fn transformed_size_with_chunks() {
        let transform = Arc::new(NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib));
        let size = NefsItemSize::with_chunks(
            0x18000,
            NefsDataChunk::create_chunk_list(&[0x2000, 0x2800], &transform),
        );
        assert_eq!(size.transformed_size(), 0x2800);
        assert!(!size.is_uncompressed());
    }

    #[test]
    fn block_kind_bits() {
        let zlib = NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib);
        let lzss_aes = NefsDataTransform::new(0x10000)
            .with_compression(NefsCompression::Lzss)
            .with_aes_key(Some([1; 32]));

        assert_eq!(zlib.block_kind(), 0x1);
        assert_eq!(lzss_aes.block_kind(), 0x6);
        assert_eq!(NefsDataTransform::new(0x10000).block_kind(), 0);
    }

    #[test]
    fn transform_from_block_kind() {
        let key = [1; 32];
        for kind in [0x0, 0x1, 0x6] {
            let transform = NefsDataTransform::from_block_kind(0x10000, kind, Some(key));
            assert_eq!(transform.map(|t| t.block_kind()), Some(kind));
        }

        assert_eq!(NefsDataTransform::from_block_kind(0x10000, 0x4, None), None);
        assert_eq!(
            NefsDataTransform::from_block_kind(0x10000, 0x1, None),
            Some(NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib))
        );
    }
}

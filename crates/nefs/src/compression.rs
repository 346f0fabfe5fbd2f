//! Chunk compression and encryption.
//!
//! The byte level primitives are consumed through [`NefsTransformer`], so callers can plug in
//! codecs this crate does not ship (the games' LZSS variant in particular).

use std::io::{self, Read, Write};

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::transform::{NefsCompression, NefsDataTransform};

const AES_BLOCK: usize = 16;

/// Provider of the per chunk byte transforms
pub trait NefsTransformer: Send + Sync {
    /// Compresses one chunk
    fn compress(&self, method: NefsCompression, input: &[u8]) -> Result<Vec<u8>>;

    /// Decompresses one chunk, `extracted_len` is the expected output size
    fn decompress(&self, method: NefsCompression, input: &[u8], extracted_len: usize)
        -> Result<Vec<u8>>;

    /// Encrypts one chunk in place
    fn encrypt(&self, key: &[u8; 32], data: &mut [u8]) -> Result<()>;

    /// Decrypts one chunk in place
    fn decrypt(&self, key: &[u8; 32], data: &mut [u8]) -> Result<()>;
}

/// zlib through [`flate2`] and AES-256 through [`aes`]
///
/// AES runs in ECB mode over every whole 16 byte block of a chunk; a trailing partial block is
/// stored as it is. LZSS is not provided.
#[derive(Debug, Clone, Copy)]
pub struct StandardTransformer {
    level: Compression,
}

impl Default for StandardTransformer {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl StandardTransformer {
    /// Uses the given zlib level, 0 through 9
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    fn cipher(key: &[u8; 32]) -> Result<Aes256> {
        Aes256::new_from_slice(key).map_err(|_| Error::invalid_argument("invalid AES-256 key"))
    }
}

impl NefsTransformer for StandardTransformer {
    #[instrument(skip(self, input), fields(len = input.len()), err)]
    fn compress(&self, method: NefsCompression, input: &[u8]) -> Result<Vec<u8>> {
        match method {
            NefsCompression::None => Ok(input.to_vec()),
            NefsCompression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len() / 2), self.level);
                encoder.write_all(input)?;
                Ok(encoder.finish()?)
            }
            NefsCompression::Lzss => Err(Error::unsupported("LZSS compression")),
        }
    }

    #[instrument(skip(self, input), fields(len = input.len()), err)]
    fn decompress(
        &self,
        method: NefsCompression,
        input: &[u8],
        extracted_len: usize,
    ) -> Result<Vec<u8>> {
        match method {
            NefsCompression::None => Ok(input.to_vec()),
            NefsCompression::Zlib => {
                let mut output = Vec::with_capacity(extracted_len);
                ZlibDecoder::new(input).read_to_end(&mut output)?;
                Ok(output)
            }
            NefsCompression::Lzss => Err(Error::unsupported("LZSS decompression")),
        }
    }

    fn encrypt(&self, key: &[u8; 32], data: &mut [u8]) -> Result<()> {
        let cipher = Self::cipher(key)?;
        data.chunks_exact_mut(AES_BLOCK)
            .for_each(|block| cipher.encrypt_block(Block::from_mut_slice(block)));
        Ok(())
    }

    fn decrypt(&self, key: &[u8; 32], data: &mut [u8]) -> Result<()> {
        let cipher = Self::cipher(key)?;
        data.chunks_exact_mut(AES_BLOCK)
            .for_each(|block| cipher.decrypt_block(Block::from_mut_slice(block)));
        Ok(())
    }
}

/// Compresses then encrypts one chunk of extracted bytes
pub(crate) fn transform_chunk(
    transformer: &dyn NefsTransformer,
    transform: &NefsDataTransform,
    raw: &[u8],
) -> Result<Vec<u8>> {
    let mut stored = transformer.compress(transform.compression(), raw)?;
    if let Some(key) = transform.aes_key() {
        transformer.encrypt(key, &mut stored)?;
    }
    Ok(stored)
}

/// Decrypts then decompresses one stored chunk into exactly `extracted_len` bytes
///
/// Bytes past `extracted_len` are dropped; a chunk restoring to fewer bytes is corrupt.
pub(crate) fn restore_chunk(
    transformer: &dyn NefsTransformer,
    transform: &NefsDataTransform,
    mut stored: Vec<u8>,
    extracted_len: usize,
) -> Result<Vec<u8>> {
    if let Some(key) = transform.aes_key() {
        transformer.decrypt(key, &mut stored)?;
    }
    let mut restored = if transform.compression() == NefsCompression::None {
        stored
    } else {
        transformer.decompress(transform.compression(), &stored, extracted_len)?
    };

    if restored.len() < extracted_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "chunk restored to {} bytes, expected {extracted_len}",
                restored.len()
            ),
        )
        .into());
    }
    restored.truncate(extracted_len);
    Ok(restored)
}

/// Checksum stored per chunk by block tables that carry one
pub fn chunk_checksum(stored: &[u8]) -> u16 {
    crc::Crc::<u16>::new(&crc::CRC_16_ARC).checksum(stored)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::compression::{
        chunk_checksum, restore_chunk, transform_chunk, NefsTransformer, StandardTransformer,
    };
    use crate::error::{Error, Result};
    use crate::transform::{NefsCompression, NefsDataTransform};

    #[test]
    fn zlib_chunk_round_trip() -> Result<()> {
        let transformer = StandardTransformer::default();
        let transform = NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib);
        let raw = b"Hello World".repeat(32);

        let stored = transform_chunk(&transformer, &transform, &raw)?;
        assert!(stored.len() < raw.len());
        assert_eq!(&stored[..2], &[0x78, 0x9C]);

        assert_eq!(restore_chunk(&transformer, &transform, stored, raw.len())?, raw);
        Ok(())
    }

    #[test]
    fn aes_leaves_partial_block_untouched() -> Result<()> {
        let transformer = StandardTransformer::default();
        let key = [0x42; 32];
        let raw: Vec<u8> = (0u8..20).collect();

        let mut data = raw.clone();
        transformer.encrypt(&key, &mut data)?;
        assert_ne!(&data[..16], &raw[..16]);
        assert_eq!(&data[16..], &raw[16..]);

        transformer.decrypt(&key, &mut data)?;
        assert_eq!(data, raw);
        Ok(())
    }

    #[test]
    fn compressed_and_encrypted_round_trip() -> Result<()> {
        let transformer = StandardTransformer::with_level(9);
        let transform = NefsDataTransform::new(0x10000)
            .with_compression(NefsCompression::Zlib)
            .with_aes_key(Some([7; 32]));
        let raw: Vec<u8> = (0u32..2000).map(|i| (i * 7 % 251) as u8).collect();

        let stored = transform_chunk(&transformer, &transform, &raw)?;
        assert_ne!(&stored[..2], &[0x78, 0xDA]);
        assert_eq!(restore_chunk(&transformer, &transform, stored, raw.len())?, raw);
        Ok(())
    }

    #[test]
    fn short_chunks_are_corrupt() -> Result<()> {
        let transformer = StandardTransformer::default();
        let transform = NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib);
        let stored = transform_chunk(&transformer, &transform, b"abc")?;

        let result = restore_chunk(&transformer, &transform, stored, 10);
        assert!(matches!(
            result,
            Err(Error::IOError(err)) if err.kind() == std::io::ErrorKind::InvalidData
        ));

        let raw = NefsDataTransform::new(0x10000);
        assert!(restore_chunk(&transformer, &raw, b"abc".to_vec(), 4).is_err());
        assert_eq!(restore_chunk(&transformer, &raw, b"abcd".to_vec(), 3)?, b"abc");
        Ok(())
    }

    #[test]
    fn lzss_is_not_provided() {
        let transformer = StandardTransformer::default();
        let result = transformer.compress(NefsCompression::Lzss, b"data");
        assert!(matches!(result, Err(Error::UnsupportedOperation(_))));
    }

    #[test]
    fn checksum_is_crc16_arc() {
        assert_eq!(chunk_checksum(b"123456789"), 0xBB3D);
    }
}

//! Types for reading NeFS archives
//!

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use bon::Builder;
use tracing::{debug, instrument, warn};

use crate::{
    archive::NefsArchive,
    compression::{restore_chunk, NefsTransformer, StandardTransformer},
    error::{Error, Result},
    header::{tables::NO_BLOCK, NefsHeader},
    item::{NefsItem, NefsItemAttributes, NefsItemId, NefsItemList},
    progress::NefsProgress,
    source::{NefsDataSource, NefsVolumeLocation, NefsVolumeSource, SourceReader},
    transform::{NefsDataChunk, NefsDataTransform, NefsItemSize},
};

/// What to do when the stored header hash does not match the header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashPolicy {
    /// Do not check the hash
    Ignore,
    /// Log a warning and keep reading
    #[default]
    Warn,
    /// Fail with [`Error::HashMismatch`]
    Strict,
}

/// Options for how an archive should be read
#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct NefsReaderOptions {
    /// How a header hash mismatch is handled
    #[builder(default)]
    pub hash_policy: HashPolicy,
}

/// NeFS archive reader
///
/// ```no_run
/// use nefs::{progress::NefsProgress, read::NefsReader};
///
/// fn list_archive(path: &str) -> nefs::error::Result<()> {
///     let archive = NefsReader::default().read(path, &NefsProgress::new())?;
///
///     for item in archive.items().enumerate_depth_first_by_name() {
///         println!("{}", archive.items().get_item_file_path(item.id())?);
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct NefsReader {
    options: NefsReaderOptions,
    transformer: Arc<dyn NefsTransformer>,
}

impl Debug for NefsReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NefsReader({:?})", self.options)
    }
}

impl Default for NefsReader {
    fn default() -> Self {
        Self::new(NefsReaderOptions::default())
    }
}

impl NefsReader {
    pub fn new(options: NefsReaderOptions) -> Self {
        Self {
            options,
            transformer: Arc::new(StandardTransformer::default()),
        }
    }

    /// Uses `transformer` to restore item data of the archives this reader opens
    pub fn with_transformer(mut self, transformer: Arc<dyn NefsTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Reads the header and item tree of the archive at `path`
    #[instrument(skip(self, path, progress), fields(path = %path.as_ref().display()), err)]
    pub fn read(&self, path: impl AsRef<Path>, progress: &NefsProgress) -> Result<NefsArchive> {
        let path = path.as_ref();
        let _task = progress.begin_task(1.0, format!("Opening {}", path.display()))?;

        let header = {
            let _task = progress.begin_task(0.5, "Reading header")?;
            let mut reader = BufReader::new(File::open(path)?);
            NefsHeader::read_from(&mut reader)?
        };
        self.check_hash(&header)?;

        let items = {
            let _task = progress.begin_task(0.5, "Building items")?;
            build_items(&header, path)
        };
        progress.check_cancelled()?;

        debug!(
            version = %header.version(),
            items = items.len(),
            encrypted = header.is_encrypted(),
            "archive read"
        );
        Ok(NefsArchive::new(header, items, Arc::clone(&self.transformer)))
    }

    fn check_hash(&self, header: &NefsHeader) -> Result<()> {
        match self.options.hash_policy {
            HashPolicy::Ignore => Ok(()),
            HashPolicy::Warn => {
                if let Err(err) = header.verify_hash() {
                    warn!(%err, "header hash does not match");
                }
                Ok(())
            }
            HashPolicy::Strict => header.verify_hash(),
        }
    }
}

/// Builds the item tree described by `header`, read from the archive at `path`
///
/// Items are added in entry table order. An item that cannot be resolved (a dangling table
/// index, a missing name, a parent that was itself skipped) is logged and skipped.
pub fn build_items(header: &NefsHeader, path: &Path) -> NefsItemList {
    let mut items = NefsItemList::new(path);
    let volumes = volume_locations(header, path);

    for index in 0..header.entries().len() {
        let result = build_item(header, index, &volumes).and_then(|item| items.add(item));
        if let Err(err) = result {
            warn!(id = index, %err, "skipping item");
        }
    }

    items
}

fn build_item(header: &NefsHeader, index: usize, volumes: &[NefsVolumeLocation]) -> Result<NefsItem> {
    let id = NefsItemId(u32::try_from(index).map_err(|_| Error::InvalidArchive)?);
    let layout = header.layout();
    let entry = &header.entries()[index];

    let shared = header
        .shared_infos()
        .get(entry.shared_info_index as usize)
        .ok_or_else(|| {
            Error::invalid_argument(format!("shared info {} is missing", entry.shared_info_index))
        })?;
    let file_name = header.file_name(shared.name_offset).ok_or_else(|| {
        Error::invalid_argument(format!("no name at offset {:#x}", shared.name_offset))
    })?;

    let (volume, flags) = header.item_flags(index).unwrap_or_default();
    let attributes = NefsItemAttributes::from_flags(flags, volume, &layout.flags);

    let first_duplicate_id = NefsItemId(shared.first_duplicate_id);
    let directory_id = if shared.parent_id == shared.first_duplicate_id {
        id
    } else {
        NefsItemId(shared.parent_id)
    };

    let builder = NefsItem::builder()
        .id(id)
        .first_duplicate_id(first_duplicate_id)
        .directory_id(directory_id)
        .file_name(file_name)
        .attributes(attributes);

    if attributes.is_directory {
        return Ok(builder.build());
    }

    let location = volumes
        .get(usize::from(volume))
        .ok_or_else(|| Error::invalid_argument(format!("volume {volume} is missing")))?;

    let (transform, size) = if entry.first_block == NO_BLOCK {
        (None, NefsItemSize::new(shared.extracted_size))
    } else {
        let transform = item_transform(header, &attributes)?;
        let size = chunked_size(header, entry.first_block, shared.extracted_size, &transform)?;
        (Some(transform), size)
    };

    let source = NefsDataSource::Volume(NefsVolumeSource::new(
        location.clone(),
        entry.data_offset,
        size,
    ));
    Ok(builder
        .data_source(source)
        .maybe_transform(transform)
        .build())
}

fn item_transform(header: &NefsHeader, attributes: &NefsItemAttributes) -> Result<NefsDataTransform> {
    let key = if attributes.is_aes_encrypted {
        let key = header
            .aes_key()
            .ok_or_else(|| Error::invalid_argument("item is encrypted but the header has no key"))?;
        Some(key)
    } else {
        None
    };

    Ok(NefsDataTransform::new(header.block_size())
        .with_compression(attributes.compression())
        .with_aes_key(key))
}

fn chunked_size(
    header: &NefsHeader,
    first_block: u32,
    extracted_size: u64,
    transform: &NefsDataTransform,
) -> Result<NefsItemSize> {
    let block_size = u64::from(header.block_size());
    if block_size == 0 {
        return Err(Error::InvalidArchive);
    }

    let count = extracted_size.div_ceil(block_size) as usize;
    let start = first_block as usize;
    let rows = header
        .blocks()
        .get(start..start + count)
        .ok_or_else(|| Error::invalid_argument(format!("blocks {start}..{} are missing", start + count)))?;

    // rows of 1.6.0 onwards name the transform of their own chunk
    let per_chunk_kind = header.layout().block.transform.is_present();
    let mut by_kind = HashMap::from([(transform.block_kind(), Arc::new(transform.clone()))]);

    let mut previous = 0u32;
    let mut chunks = Vec::with_capacity(rows.len());
    for row in rows {
        let kind = if per_chunk_kind {
            row.transform
        } else {
            transform.block_kind()
        };
        let chunk_transform = match by_kind.get(&kind) {
            Some(existing) => Arc::clone(existing),
            None => {
                let created = NefsDataTransform::from_block_kind(
                    transform.chunk_size(),
                    kind,
                    header.aes_key(),
                )
                .map(Arc::new)
                .ok_or_else(|| {
                    Error::invalid_argument("chunk is encrypted but the header has no key")
                })?;
                by_kind.insert(kind, Arc::clone(&created));
                created
            }
        };

        chunks.push(NefsDataChunk::new(
            row.cumulative_size.saturating_sub(previous),
            row.cumulative_size,
            row.checksum,
            chunk_transform,
        ));
        previous = row.cumulative_size;
    }
    Ok(NefsItemSize::with_chunks(extracted_size, chunks))
}

/// Where every volume of the archive at `path` lives
///
/// The first volume is always the archive file itself, whatever name the header records; the
/// others sit next to it under their recorded names.
fn volume_locations(header: &NefsHeader, path: &Path) -> Vec<NefsVolumeLocation> {
    let split_size = header.split_size();
    let base = split_base(path, split_size);

    header
        .volumes()
        .into_iter()
        .enumerate()
        .map(|(index, volume)| {
            let volume_path = if index == 0 {
                base.clone()
            } else {
                base.with_file_name(&volume.name)
            };
            if split_size == 0 {
                NefsVolumeLocation::new(volume_path)
            } else {
                NefsVolumeLocation::split(volume_path, split_size)
            }
        })
        .collect()
}

/// Strips the `.000` style suffix of the first split file
fn split_base(path: &Path, split_size: u64) -> PathBuf {
    let is_split_part = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.len() == 3 && ext.bytes().all(|b| b.is_ascii_digit()));

    if split_size != 0 && is_split_part {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// A reader over the extracted bytes of one item
///
/// Transformed chunks are read, decrypted and decompressed one at a time.
pub struct NefsItemReader {
    source: SourceReader,
    transformer: Arc<dyn NefsTransformer>,
    chunks: std::vec::IntoIter<NefsDataChunk>,
    transformed: bool,
    chunk_size: u64,
    remaining: u64,
    buffer: Vec<u8>,
    position: usize,
}

impl Debug for NefsItemReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NefsItemReader(remaining: {})", self.remaining)
    }
}

impl NefsItemReader {
    /// Opens the data source of a file item
    pub fn new(item: &NefsItem, transformer: Arc<dyn NefsTransformer>) -> Result<Self> {
        if item.is_directory() {
            return Err(Error::invalid_argument(format!(
                "{} is a directory",
                item.file_name()
            )));
        }

        let source = item.data_source();
        let size = source.size();
        let chunks = size.chunks().to_vec();
        let transformed = source.is_transformed() && !chunks.is_empty();
        let chunk_size = chunks
            .first()
            .map_or(0, |chunk| u64::from(chunk.transform().chunk_size()));

        Ok(Self {
            source: source.open()?,
            transformer,
            chunks: chunks.into_iter(),
            transformed,
            chunk_size,
            remaining: size.extracted_size(),
            buffer: Vec::new(),
            position: 0,
        })
    }

    fn next_chunk(&mut self) -> Result<bool> {
        let Some(chunk) = self.chunks.next() else {
            return Ok(false);
        };

        let mut stored = vec![0u8; chunk.size() as usize];
        self.source.read_exact(&mut stored)?;

        let extracted_len = self.chunk_size.min(self.remaining) as usize;
        self.buffer = restore_chunk(
            self.transformer.as_ref(),
            chunk.transform(),
            stored,
            extracted_len,
        )?;
        self.position = 0;
        Ok(true)
    }

    fn truncated(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("item data ends {} bytes early", self.remaining),
        )
    }
}

impl Read for NefsItemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        if !self.transformed {
            let limit = buf.len().min(self.remaining as usize);
            let read = self.source.read(&mut buf[..limit])?;
            if read == 0 {
                return Err(self.truncated());
            }
            self.remaining -= read as u64;
            return Ok(read);
        }

        if self.position == self.buffer.len() {
            let more = self.next_chunk().map_err(io::Error::other)?;
            if !more || self.buffer.is_empty() {
                return Err(self.truncated());
            }
        }

        let available = &self.buffer[self.position..];
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        self.position += len;
        self.remaining -= len as u64;
        Ok(len)
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, Read};
    use std::path::Path;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use crate::compression::{transform_chunk, StandardTransformer};
    use crate::error::Result;
    use crate::item::{NefsItem, NefsItemId};
    use crate::read::{split_base, NefsItemReader};
    use crate::source::{NefsDataSource, NefsFileSource};
    use crate::transform::{NefsCompression, NefsDataChunk, NefsDataTransform, NefsItemSize};

    fn read_item(
        stored: &[u8],
        size: NefsItemSize,
        transform: Option<NefsDataTransform>,
    ) -> Result<io::Result<Vec<u8>>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stored.bin");
        std::fs::write(&path, stored)?;

        let transformed = transform.is_some();
        let item = NefsItem::builder()
            .id(NefsItemId(0))
            .file_name("item.bin")
            .data_source(NefsDataSource::File(NefsFileSource::new(
                path,
                0,
                size,
                transformed,
            )))
            .maybe_transform(transform)
            .build();

        let mut reader = NefsItemReader::new(&item, Arc::new(StandardTransformer::default()))?;
        let mut output = Vec::new();
        Ok(reader.read_to_end(&mut output).map(|_| output))
    }

    fn zlib() -> NefsDataTransform {
        NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib)
    }

    #[test]
    fn chunk_restoring_short_fails_the_read() -> Result<()> {
        let transform = Arc::new(zlib());
        let stored = transform_chunk(&StandardTransformer::default(), &transform, b"abc")?;
        let chunks =
            NefsDataChunk::create_chunk_list(&[stored.len() as u32], &transform);

        let result = read_item(&stored, NefsItemSize::with_chunks(10, chunks), Some(zlib()))?;
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn missing_chunks_fail_the_read() -> Result<()> {
        let transform = Arc::new(zlib());
        let raw = vec![0x5Au8; 0x10000];
        let stored = transform_chunk(&StandardTransformer::default(), &transform, &raw)?;
        let chunks =
            NefsDataChunk::create_chunk_list(&[stored.len() as u32], &transform);

        let result = read_item(&stored, NefsItemSize::with_chunks(0x18000, chunks), Some(zlib()))?;
        assert!(matches!(result, Err(err) if err.kind() == io::ErrorKind::UnexpectedEof));
        Ok(())
    }

    #[test]
    fn short_raw_source_fails_the_read() -> Result<()> {
        let result = read_item(b"abc", NefsItemSize::new(10), None)?;
        assert!(matches!(result, Err(err) if err.kind() == io::ErrorKind::UnexpectedEof));

        assert_eq!(read_item(b"abc", NefsItemSize::new(3), None)??, b"abc");
        Ok(())
    }

    #[test]
    fn split_base_strips_part_number() {
        assert_eq!(split_base(Path::new("game.nefs.000"), 0x8000), Path::new("game.nefs"));
        assert_eq!(split_base(Path::new("game.nefs.000"), 0), Path::new("game.nefs.000"));
        assert_eq!(split_base(Path::new("game.nefs"), 0x8000), Path::new("game.nefs"));
    }
}

//! Types for writing NeFS archives
//!

use std::{
    fmt::{self, Debug},
    fs::File,
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Arc,
};

use bon::Builder;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, Level};

use crate::{
    archive::NefsArchive,
    compression::{chunk_checksum, transform_chunk, NefsTransformer, StandardTransformer},
    error::{Error, Result},
    header::{
        builder::{build_header, surviving_items},
        tables::HashDigest,
        DEFAULT_HASH_BLOCK_SIZE,
    },
    item::{NefsItem, NefsItemList, NefsItemState},
    progress::NefsProgress,
    read::NefsItemReader,
    source::{NefsDataSource, NefsVolumeLocation, NefsVolumeSource},
    transform::{NefsDataChunk, NefsDataTransform, NefsItemSize},
    version::NefsVersion,
};

/// Options for how the archive should be written
#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct NefsWriterOptions {
    /// Header version to write, the archive's own version when unset
    pub version: Option<NefsVersion>,

    /// Chunk size, kept from the archive when unset
    pub block_size: Option<u32>,

    /// Payload bytes covered by one hash digest, for versions that store digests
    pub hash_block_size: Option<u32>,
}

/// NeFS archive writer
///
/// The payload is spooled to a temporary file next to the destination first, so an archive
/// can be saved over the file it was read from.
///
/// ```no_run
/// # fn doit() -> nefs::error::Result<()>
/// # {
/// use nefs::{progress::NefsProgress, version::NefsVersion, write::NefsWriterOptions, NefsArchive};
///
/// let archive = NefsArchive::open("game.nefs")?;
/// let options = NefsWriterOptions::builder().version(NefsVersion::V200).build();
/// let saved = archive.save("converted.nefs", options, &NefsProgress::new())?;
/// assert_eq!(saved.header().version(), NefsVersion::V200);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NefsWriter {
    options: NefsWriterOptions,
    transformer: Arc<dyn NefsTransformer>,
}

impl Debug for NefsWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NefsWriter({:?})", self.options)
    }
}

impl Default for NefsWriter {
    fn default() -> Self {
        Self::new(NefsWriterOptions::default())
    }
}

impl NefsWriter {
    pub fn new(options: NefsWriterOptions) -> Self {
        Self {
            options,
            transformer: Arc::new(StandardTransformer::default()),
        }
    }

    /// Uses `transformer` to restore and transform item data
    pub fn with_transformer(mut self, transformer: Arc<dyn NefsTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Writes `archive` to `destination` and returns the archive describing the new file
    ///
    /// Archives with an encrypted header cannot be saved; the destination is not touched in
    /// that case.
    #[instrument(skip(self, archive, destination, progress), fields(destination = %destination.as_ref().display()), err)]
    pub fn write(
        &self,
        archive: &NefsArchive,
        destination: impl AsRef<Path>,
        progress: &NefsProgress,
    ) -> Result<NefsArchive> {
        let destination = destination.as_ref();
        let source_header = archive.header();
        if source_header.is_encrypted() {
            return Err(Error::unsupported("saving an archive with an encrypted header"));
        }

        let version = self.options.version.unwrap_or(source_header.version());
        let layout = version.layout();
        let same_family = source_header.version().family() == version.family();
        let block_size = self
            .options
            .block_size
            .or_else(|| (same_family && source_header.block_size() != 0).then(|| source_header.block_size()))
            .unwrap_or(layout.default_block_size);
        let hash_block_size = self
            .options
            .hash_block_size
            .or_else(|| (source_header.hash_block_size() != 0).then(|| source_header.hash_block_size()))
            .unwrap_or(DEFAULT_HASH_BLOCK_SIZE);

        let _task = progress.begin_task(1.0, format!("Saving {}", destination.display()))?;

        let directory = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let digest_block = if layout.has_hash_digests {
            u64::from(hash_block_size)
        } else {
            0
        };
        let mut spool = PayloadSpool::new(tempfile::tempfile_in(directory)?, digest_block);

        let staged = {
            let _task = progress.begin_task(0.8, "Writing items")?;
            self.spool_items(archive.items(), destination, block_size, &mut spool, progress)?
        };
        let (mut payload, payload_size, digests) = spool.finish()?;

        let built = {
            let _task = progress.begin_task(0.1, "Building header")?;
            build_header()
                .version(version)
                .items(&staged)
                .volume_path(destination)
                .template(source_header)
                .payload_size(payload_size)
                .hash_digests(digests)
                .block_size(block_size)
                .hash_block_size(hash_block_size)
                .call()?
        };

        {
            let _task = progress.begin_task(0.1, "Writing archive")?;
            let header_bytes = built.header.to_bytes()?;
            let data_start = built.header.data_start();
            let padding = data_start
                .checked_sub(header_bytes.len() as u64)
                .ok_or(Error::InvalidArchive)?;

            let mut writer = BufWriter::new(File::create(destination)?);
            writer.write_all(&header_bytes)?;
            io::copy(&mut io::repeat(0).take(padding), &mut writer)?;
            payload.seek(SeekFrom::Start(0))?;
            io::copy(&mut payload, &mut writer)?;
            writer.flush()?;
        }

        debug!(
            %version,
            items = built.items.len(),
            payload_size,
            "archive written"
        );
        Ok(NefsArchive::new(
            built.header,
            built.items,
            Arc::clone(&self.transformer),
        ))
    }

    /// Writes the stored bytes of every surviving file to the spool, returning the items with
    /// sources pointing into the payload
    fn spool_items(
        &self,
        items: &NefsItemList,
        destination: &Path,
        block_size: u32,
        spool: &mut PayloadSpool,
        progress: &NefsProgress,
    ) -> Result<NefsItemList> {
        let survivors = surviving_items(items)?;
        let weight = 1.0 / survivors.len().max(1) as f32;
        let volume = NefsVolumeLocation::new(destination);
        let mut staged = NefsItemList::new(destination);

        for item in survivors {
            let _task = progress.begin_task(weight, item.file_name())?;

            let builder = NefsItem::builder()
                .id(item.id())
                .first_duplicate_id(item.first_duplicate_id())
                .directory_id(item.directory_id())
                .file_name(item.file_name())
                .attributes(*item.attributes());

            if item.is_directory() {
                staged.add(builder.build())?;
                continue;
            }

            let offset = spool.position();
            let transform = item.transform().map(|t| {
                NefsDataTransform::new(block_size)
                    .with_compression(t.compression())
                    .with_aes_key(t.aes_key().copied())
            });
            let size = match &transform {
                None => self.copy_raw(item, spool, progress)?,
                Some(target) if can_copy_chunks(item, target) => {
                    self.copy_chunks(item, target, spool, progress)?
                }
                Some(target) => self.transform_item(item, target, spool, progress)?,
            };

            let source = NefsDataSource::Volume(NefsVolumeSource::new(volume.clone(), offset, size));
            staged.add(
                builder
                    .data_source(source)
                    .maybe_transform(transform)
                    .state(NefsItemState::None)
                    .build(),
            )?;
        }

        Ok(staged)
    }

    /// Copies the extracted bytes of an item stored without chunks
    #[instrument(level = Level::TRACE, skip_all, fields(id = %item.id()), err)]
    fn copy_raw(
        &self,
        item: &NefsItem,
        spool: &mut PayloadSpool,
        progress: &NefsProgress,
    ) -> Result<NefsItemSize> {
        if item.data_source() == &NefsDataSource::Empty {
            return Ok(NefsItemSize::new(0));
        }

        let mut reader = NefsItemReader::new(item, Arc::clone(&self.transformer))?;
        let mut buffer = vec![0u8; 0x10000];
        let mut written = 0u64;
        loop {
            progress.check_cancelled()?;
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            spool.write_all(&buffer[..read])?;
            written += read as u64;
        }

        Ok(NefsItemSize::new(written))
    }

    /// Copies already transformed chunks verbatim
    #[instrument(level = Level::TRACE, skip_all, fields(id = %item.id()), err)]
    fn copy_chunks(
        &self,
        item: &NefsItem,
        target: &NefsDataTransform,
        spool: &mut PayloadSpool,
        progress: &NefsProgress,
    ) -> Result<NefsItemSize> {
        let size = item.data_source().size();
        let mut reader = item.data_source().open()?;
        let mut marks = Vec::with_capacity(size.chunks().len());
        let mut cumulative = 0u64;

        for chunk in size.chunks() {
            progress.check_cancelled()?;
            let mut stored = vec![0u8; chunk.size() as usize];
            reader.read_exact(&mut stored)?;
            spool.write_all(&stored)?;

            cumulative += stored.len() as u64;
            marks.push((to_cumulative(cumulative)?, chunk_checksum(&stored)));
        }

        Ok(NefsItemSize::with_chunks(
            size.extracted_size(),
            NefsDataChunk::create_chunk_list_with_checksums(&marks, &Arc::new(target.clone())),
        ))
    }

    /// Slices the extracted bytes into chunks and transforms each of them
    #[instrument(level = Level::TRACE, skip_all, fields(id = %item.id()), err)]
    fn transform_item(
        &self,
        item: &NefsItem,
        target: &NefsDataTransform,
        spool: &mut PayloadSpool,
        progress: &NefsProgress,
    ) -> Result<NefsItemSize> {
        let transform = Arc::new(target.clone());
        if item.data_source() == &NefsDataSource::Empty {
            return Ok(NefsItemSize::with_chunks(0, Vec::new()));
        }

        let mut reader = NefsItemReader::new(item, Arc::clone(&self.transformer))?;
        let mut raw = vec![0u8; target.chunk_size() as usize];
        let mut marks = Vec::new();
        let mut extracted = 0u64;
        let mut cumulative = 0u64;

        loop {
            progress.check_cancelled()?;
            let read = read_full(&mut reader, &mut raw)?;
            if read == 0 {
                break;
            }

            let stored = transform_chunk(self.transformer.as_ref(), target, &raw[..read])?;
            spool.write_all(&stored)?;

            extracted += read as u64;
            cumulative += stored.len() as u64;
            marks.push((to_cumulative(cumulative)?, chunk_checksum(&stored)));
        }

        Ok(NefsItemSize::with_chunks(
            extracted,
            NefsDataChunk::create_chunk_list_with_checksums(&marks, &transform),
        ))
    }
}

/// Whether the stored chunks of `item` can be kept as they are under `target`
fn can_copy_chunks(item: &NefsItem, target: &NefsDataTransform) -> bool {
    let source = item.data_source();
    let chunks = source.size().chunks();
    source.is_transformed()
        && !chunks.is_empty()
        && chunks.iter().all(|chunk| chunk.transform().as_ref() == target)
}

fn to_cumulative(size: u64) -> Result<u32> {
    u32::try_from(size).map_err(|_| Error::invalid_argument("item exceeds 4 GiB once stored"))
}

/// Fills `buf` unless the reader ends first, returning the bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

/// Temporary payload file hashed in fixed size blocks as it is written
struct PayloadSpool {
    file: BufWriter<File>,
    written: u64,
    digest_block: u64,
    in_block: u64,
    hasher: Sha256,
    digests: Vec<HashDigest>,
}

impl PayloadSpool {
    /// `digest_block` of zero disables hashing
    fn new(file: File, digest_block: u64) -> Self {
        Self {
            file: BufWriter::new(file),
            written: 0,
            digest_block,
            in_block: 0,
            hasher: Sha256::new(),
            digests: Vec::new(),
        }
    }

    fn position(&self) -> u64 {
        self.written
    }

    fn hash(&mut self, mut data: &[u8]) {
        if self.digest_block == 0 {
            return;
        }
        while !data.is_empty() {
            let take = (self.digest_block - self.in_block).min(data.len() as u64) as usize;
            self.hasher.update(&data[..take]);
            self.in_block += take as u64;
            data = &data[take..];

            if self.in_block == self.digest_block {
                self.digests.push(HashDigest(self.hasher.finalize_reset().into()));
                self.in_block = 0;
            }
        }
    }

    /// The spooled payload, its size and one digest per started hash block
    fn finish(mut self) -> Result<(File, u64, Vec<HashDigest>)> {
        if self.in_block > 0 {
            self.digests.push(HashDigest(self.hasher.finalize_reset().into()));
        }
        let file = self.file.into_inner().map_err(|err| err.into_error())?;
        Ok((file, self.written, self.digests))
    }
}

impl Write for PayloadSpool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.hash(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Seek, SeekFrom, Write};

    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};

    use crate::error::Result;
    use crate::header::tables::HashDigest;
    use crate::write::{read_full, PayloadSpool};

    #[test]
    fn spool_hashes_every_started_block() -> Result<()> {
        let mut spool = PayloadSpool::new(tempfile::tempfile()?, 4);
        spool.write_all(b"abc")?;
        spool.write_all(b"defgh")?;
        spool.write_all(b"ij")?;
        assert_eq!(spool.position(), 10);

        let (mut file, size, digests) = spool.finish()?;
        assert_eq!(size, 10);

        let expected: Vec<HashDigest> = [&b"abcd"[..], b"efgh", b"ij"]
            .into_iter()
            .map(|block| HashDigest(Sha256::digest(block).into()))
            .collect();
        assert_eq!(digests, expected);

        let mut payload = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut payload)?;
        assert_eq!(payload, b"abcdefghij");
        Ok(())
    }

    #[test]
    fn spool_without_digests() -> Result<()> {
        let mut spool = PayloadSpool::new(tempfile::tempfile()?, 0);
        spool.write_all(b"payload")?;

        let (_, size, digests) = spool.finish()?;
        assert_eq!(size, 7);
        assert!(digests.is_empty());
        Ok(())
    }

    #[test]
    fn read_full_stops_at_end() -> Result<()> {
        let mut reader = &b"12345"[..];
        let mut buf = [0u8; 4];

        assert_eq!(read_full(&mut reader, &mut buf)?, 4);
        assert_eq!(read_full(&mut reader, &mut buf)?, 1);
        assert_eq!(read_full(&mut reader, &mut buf)?, 0);
        Ok(())
    }
}

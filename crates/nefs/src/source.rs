//! Where an item's bytes come from.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use tracing::{instrument, trace};

use crate::error::{Error, Result};
use crate::transform::NefsItemSize;

static EMPTY_SIZE: NefsItemSize = NefsItemSize::new(0);

/// A physical volume, optionally continued in numbered split files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NefsVolumeLocation {
    path: PathBuf,
    split_size: u64,
}

impl NefsVolumeLocation {
    /// A volume stored in a single file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            split_size: 0,
        }
    }

    /// A volume stored as `path.000`, `path.001`, ... of `split_size` bytes each
    pub fn split(path: impl Into<PathBuf>, split_size: u64) -> Self {
        Self {
            path: path.into(),
            split_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn split_size(&self) -> u64 {
        self.split_size
    }

    pub fn is_split(&self) -> bool {
        self.split_size != 0
    }

    /// Physical file and offset inside it for a logical volume position
    pub fn locate(&self, position: u64) -> (PathBuf, u64) {
        if !self.is_split() {
            return (self.path.clone(), position);
        }

        let index = position / self.split_size;
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index:03}"));
        (PathBuf::from(name), position % self.split_size)
    }
}

/// Replacement bytes on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NefsFileSource {
    path: PathBuf,
    offset: u64,
    size: NefsItemSize,
    transformed: bool,
}

impl NefsFileSource {
    /// `transformed` tells whether the bytes are already compressed/encrypted as `size` says
    pub fn new(path: impl Into<PathBuf>, offset: u64, size: NefsItemSize, transformed: bool) -> Self {
        Self {
            path: path.into(),
            offset,
            size,
            transformed,
        }
    }

    /// Raw bytes of the whole file at `path`
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let len = std::fs::metadata(&path)?.len();
        Ok(Self::new(path, 0, NefsItemSize::new(len), false))
    }
}

/// Bytes already stored in an archive volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NefsVolumeSource {
    volume: NefsVolumeLocation,
    offset: u64,
    size: NefsItemSize,
}

impl NefsVolumeSource {
    pub fn new(volume: NefsVolumeLocation, offset: u64, size: NefsItemSize) -> Self {
        Self {
            volume,
            offset,
            size,
        }
    }

    pub fn volume(&self) -> &NefsVolumeLocation {
        &self.volume
    }
}

/// Source of an item's bytes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NefsDataSource {
    /// No bytes, used by directories
    #[default]
    Empty,

    /// Replacement bytes in a standalone file
    File(NefsFileSource),

    /// Bytes inside a written archive volume
    Volume(NefsVolumeSource),
}

impl NefsDataSource {
    /// File the bytes are read from; for split volumes the base name
    pub fn path(&self) -> Option<&Path> {
        match self {
            NefsDataSource::Empty => None,
            NefsDataSource::File(f) => Some(&f.path),
            NefsDataSource::Volume(v) => Some(v.volume.path()),
        }
    }

    /// Offset of the first stored byte
    pub fn offset(&self) -> u64 {
        match self {
            NefsDataSource::Empty => 0,
            NefsDataSource::File(f) => f.offset,
            NefsDataSource::Volume(v) => v.offset,
        }
    }

    pub fn size(&self) -> &NefsItemSize {
        match self {
            NefsDataSource::Empty => &EMPTY_SIZE,
            NefsDataSource::File(f) => &f.size,
            NefsDataSource::Volume(v) => &v.size,
        }
    }

    /// Whether the stored bytes already carry the item's transform
    pub fn is_transformed(&self) -> bool {
        match self {
            NefsDataSource::Empty => true,
            NefsDataSource::File(f) => f.transformed,
            NefsDataSource::Volume(_) => true,
        }
    }

    /// Whether every file backing this source exists
    pub fn exists(&self) -> bool {
        match self {
            NefsDataSource::Empty => true,
            NefsDataSource::File(f) => f.path.is_file(),
            NefsDataSource::Volume(v) => {
                let end = v.offset + v.size.transformed_size();
                let (first, _) = v.volume.locate(v.offset);
                let (last, _) = v.volume.locate(end.saturating_sub(1).max(v.offset));
                first.is_file() && last.is_file()
            }
        }
    }

    /// Same source moved `delta` bytes further into its file
    pub(crate) fn rebased(&self, delta: u64) -> Self {
        let mut source = self.clone();
        match &mut source {
            NefsDataSource::Empty => {}
            NefsDataSource::File(f) => f.offset += delta,
            NefsDataSource::Volume(v) => v.offset += delta,
        }
        source
    }

    /// Opens a reader over the stored bytes
    #[instrument(skip(self), err)]
    pub fn open(&self) -> Result<SourceReader> {
        match self {
            NefsDataSource::Empty => Err(Error::invalid_argument(
                "an empty data source cannot be opened",
            )),
            NefsDataSource::File(f) => {
                let mut file = File::open(&f.path)?;
                file.seek(SeekFrom::Start(f.offset))?;
                Ok(SourceReader::File(file.take(f.size.transformed_size())))
            }
            NefsDataSource::Volume(v) => Ok(SourceReader::Volume(SplitVolumeReader::new(
                v.volume.clone(),
                v.offset,
                v.size.transformed_size(),
            ))),
        }
    }
}

/// Reader over the stored bytes of a [`NefsDataSource`]
pub enum SourceReader {
    File(io::Take<File>),
    Volume(SplitVolumeReader),
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SourceReader::File(r) => r.read(buf),
            SourceReader::Volume(r) => r.read(buf),
        }
    }
}

/// Reads a logical byte range of a volume, crossing into the next split file as needed
pub struct SplitVolumeReader {
    volume: NefsVolumeLocation,
    position: u64,
    remaining: u64,
    current: Option<(PathBuf, File)>,
}

impl SplitVolumeReader {
    pub fn new(volume: NefsVolumeLocation, position: u64, len: u64) -> Self {
        Self {
            volume,
            position,
            remaining: len,
            current: None,
        }
    }
}

impl Read for SplitVolumeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let (path, in_file) = self.volume.locate(self.position);
        let reopen = !matches!(&self.current, Some((open, _)) if *open == path);
        if reopen {
            trace!(path = %path.display(), "opening volume file");
            self.current = Some((path.clone(), File::open(&path)?));
        }
        let Some((_, file)) = self.current.as_mut() else {
            return Ok(0);
        };

        let mut limit = self.remaining.min(buf.len() as u64);
        if self.volume.is_split() {
            limit = limit.min(self.volume.split_size() - in_file);
        }

        file.seek(SeekFrom::Start(in_file))?;
        let read = file.read(&mut buf[..limit as usize])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("volume {} ended early", path.display()),
            ));
        }

        self.position += read as u64;
        self.remaining -= read as u64;
        Ok(read)
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use crate::error::Result;
    use crate::source::{NefsDataSource, NefsFileSource, NefsVolumeLocation, NefsVolumeSource};
    use crate::transform::NefsItemSize;

    #[test]
    fn locate_in_split_volume() {
        let volume = NefsVolumeLocation::split("data/game.nefs", 0x100);

        assert_eq!(volume.locate(0x10), (PathBuf::from("data/game.nefs.000"), 0x10));
        assert_eq!(volume.locate(0x100), (PathBuf::from("data/game.nefs.001"), 0));
        assert_eq!(volume.locate(0x2FF), (PathBuf::from("data/game.nefs.002"), 0xFF));
    }

    #[test]
    fn locate_in_single_volume() {
        let volume = NefsVolumeLocation::new("game.nefs");
        assert_eq!(volume.locate(0x12345), (PathBuf::from("game.nefs"), 0x12345));
    }

    #[test]
    fn read_across_split_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("game.nefs");
        std::fs::write(dir.path().join("game.nefs.000"), b"abcdefgh")?;
        std::fs::write(dir.path().join("game.nefs.001"), b"ijklmnop")?;

        let source = NefsDataSource::Volume(NefsVolumeSource::new(
            NefsVolumeLocation::split(&base, 8),
            5,
            NefsItemSize::new(6),
        ));
        assert!(source.exists());

        let mut actual = Vec::new();
        source.open()?.read_to_end(&mut actual)?;
        assert_eq!(actual, b"fghijk");
        Ok(())
    }

    #[test]
    fn read_file_source_window() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("replacement.bin");
        std::fs::write(&path, b"0123456789")?;

        let source = NefsDataSource::File(NefsFileSource::new(&path, 2, NefsItemSize::new(4), false));
        let mut actual = Vec::new();
        source.open()?.read_to_end(&mut actual)?;

        assert_eq!(actual, b"2345");
        assert!(!source.is_transformed());
        Ok(())
    }

    #[test]
    fn empty_source_cannot_be_opened() {
        let source = NefsDataSource::Empty;
        assert!(source.open().is_err());
        assert!(source.is_transformed());
        assert_eq!(source.size().extracted_size(), 0);
    }
}

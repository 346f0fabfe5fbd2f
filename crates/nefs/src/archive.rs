//! The archive aggregate: a header and the item tree it describes.

use std::{
    fmt::{self, Debug},
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use tracing::{info, instrument, warn};

use crate::{
    compression::{NefsTransformer, StandardTransformer},
    error::{Error, Result},
    header::{builder::build_header, NefsHeader},
    item::{NefsItemId, NefsItemList},
    progress::NefsProgress,
    read::{NefsItemReader, NefsReader},
    version::NefsVersion,
    write::{NefsWriter, NefsWriterOptions},
};

/// Outcome of [`NefsArchive::extract_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Files written to disk
    pub extracted: usize,
    /// Directories created
    pub directories: usize,
    /// Items that could not be extracted
    pub failed: Vec<NefsItemId>,
}

/// An opened NeFS archive
///
/// Saving does not modify an archive; it returns a new one describing the written file.
#[derive(Clone)]
pub struct NefsArchive {
    header: NefsHeader,
    items: NefsItemList,
    transformer: Arc<dyn NefsTransformer>,
}

impl Debug for NefsArchive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NefsArchive")
            .field("path", &self.path())
            .field("version", &self.header.version())
            .field("items", &self.items.len())
            .finish()
    }
}

impl NefsArchive {
    pub(crate) fn new(
        header: NefsHeader,
        items: NefsItemList,
        transformer: Arc<dyn NefsTransformer>,
    ) -> Self {
        Self {
            header,
            items,
            transformer,
        }
    }

    /// A new archive without items, to be filled through [`NefsArchive::items_mut`] and saved
    ///
    /// Nothing is written until the archive is saved.
    pub fn create(path: impl AsRef<Path>, version: NefsVersion) -> Result<Self> {
        let path = path.as_ref();
        let items = NefsItemList::new(path);
        let built = build_header()
            .version(version)
            .items(&items)
            .volume_path(path)
            .call()?;

        Ok(Self::new(
            built.header,
            built.items,
            Arc::new(StandardTransformer::default()),
        ))
    }

    /// Reads the archive at `path` with the default reader
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        NefsReader::default().read(path, &NefsProgress::new())
    }

    /// Path of the archive file
    pub fn path(&self) -> &Path {
        self.items.data_file_path()
    }

    pub fn header(&self) -> &NefsHeader {
        &self.header
    }

    pub fn items(&self) -> &NefsItemList {
        &self.items
    }

    /// Item tree, for staging edits picked up by the next save
    pub fn items_mut(&mut self) -> &mut NefsItemList {
        &mut self.items
    }

    pub fn transformer(&self) -> &Arc<dyn NefsTransformer> {
        &self.transformer
    }

    /// Writes the archive, including staged edits, to `destination`
    pub fn save(
        &self,
        destination: impl AsRef<Path>,
        options: NefsWriterOptions,
        progress: &NefsProgress,
    ) -> Result<NefsArchive> {
        NefsWriter::new(options)
            .with_transformer(Arc::clone(&self.transformer))
            .write(self, destination, progress)
    }

    /// Opens a reader over the extracted bytes of a file item
    pub fn open_item(&self, id: NefsItemId) -> Result<NefsItemReader> {
        let item = self.items.get(id).ok_or(Error::ItemNotFound(id))?;
        NefsItemReader::new(item, Arc::clone(&self.transformer))
    }

    /// Writes the extracted bytes of a file item to `writer`, returning the byte count
    #[instrument(skip(self, writer), err)]
    pub fn extract_item(&self, id: NefsItemId, writer: &mut impl Write) -> Result<u64> {
        let mut reader = self.open_item(id)?;
        Ok(io::copy(&mut reader, writer)?)
    }

    /// Extracts every item below `directory`, recreating the archive's hierarchy
    ///
    /// A failing item is logged and recorded in the summary, and extraction carries on with
    /// the next item. Items whose path would leave `directory` are refused.
    #[instrument(skip(self, directory, progress), fields(directory = %directory.as_ref().display()), err)]
    pub fn extract_all(
        &self,
        directory: impl AsRef<Path>,
        progress: &NefsProgress,
    ) -> Result<ExtractSummary> {
        let directory = directory.as_ref();
        let _task = progress.begin_task(1.0, "Extracting")?;
        fs::create_dir_all(directory)?;

        let items = self.items.enumerate_depth_first_by_id();
        let weight = 1.0 / items.len().max(1) as f32;
        let mut summary = ExtractSummary::default();

        for item in items {
            let _item_task = progress.begin_task(weight, item.file_name())?;
            let id = item.id();

            let result = self.items.get_item_file_path(id).and_then(|path| {
                let target = safe_join(directory, &path)?;
                if item.is_directory() {
                    fs::create_dir_all(&target)?;
                    summary.directories += 1;
                } else {
                    self.extract_to(id, &target)?;
                    summary.extracted += 1;
                }
                Ok(())
            });

            if let Err(err) = result {
                warn!(%id, name = item.file_name(), %err, "failed to extract item");
                summary.failed.push(id);
            }
        }

        info!(
            extracted = summary.extracted,
            failed = summary.failed.len(),
            "extraction finished"
        );
        Ok(summary)
    }

    fn extract_to(&self, id: NefsItemId, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(target)?);
        self.extract_item(id, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Joins an archive path below `root`, refusing anything that would escape it
fn safe_join(root: &Path, archive_path: &str) -> Result<PathBuf> {
    let mut joined = root.to_path_buf();
    for component in Path::new(archive_path).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid_argument(format!(
                    "refusing to extract {archive_path:?} outside the target directory"
                )))
            }
        }
    }
    Ok(joined)
}

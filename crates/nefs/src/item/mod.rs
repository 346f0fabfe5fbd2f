//! Files and directories of an archive.

mod list;

use bon::bon;
use derive_more::{Display, From, Into};

pub use list::NefsItemList;

use crate::error::{Error, Result};
use crate::source::NefsDataSource;
use crate::transform::{NefsCompression, NefsDataTransform};
use crate::version::FlagBits;

/// Identifies an item; also the item's entry table row
#[derive(Debug, Display, From, Into, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NefsItemId(pub u32);

impl NefsItemId {
    /// Id that never names an item
    pub const INVALID: NefsItemId = NefsItemId(0xFFFF_FFFF);

    pub fn value(self) -> u32 {
        self.0
    }
}

/// Pending edit of an item, consumed by the next save
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum NefsItemState {
    /// Unchanged since the archive was read
    #[default]
    None,
    /// Added since the archive was read
    Added,
    /// Dropped on the next save, together with everything below it
    Removed,
    /// Data source replaced since the archive was read
    Replaced,
}

/// Attribute flags of an item
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct NefsItemAttributes {
    pub is_directory: bool,
    pub is_cacheable: bool,
    pub is_duplicated: bool,
    pub is_patched: bool,
    pub is_last_sibling: bool,
    pub is_zlib_compressed: bool,
    pub is_lzss_compressed: bool,
    pub is_aes_encrypted: bool,
    /// Index of the volume holding the item's bytes
    pub volume: u16,
}

impl NefsItemAttributes {
    /// Attributes of a directory
    pub fn directory() -> Self {
        Self {
            is_directory: true,
            ..Default::default()
        }
    }

    /// Decodes a flag field with the bit assignment of one revision
    pub fn from_flags(flags: u16, volume: u16, bits: &FlagBits) -> Self {
        let has = |bit: u16| bit != 0 && flags & bit == bit;
        Self {
            is_directory: has(bits.directory),
            is_cacheable: has(bits.cacheable),
            is_duplicated: has(bits.duplicated),
            is_patched: has(bits.patched),
            is_last_sibling: has(bits.last_sibling),
            is_zlib_compressed: has(bits.zlib),
            is_lzss_compressed: has(bits.lzss),
            is_aes_encrypted: has(bits.aes),
            volume,
        }
    }

    /// Encodes the flag field; attributes the revision has no bit for are dropped
    pub fn to_flags(&self, bits: &FlagBits) -> u16 {
        [
            (self.is_directory, bits.directory),
            (self.is_cacheable, bits.cacheable),
            (self.is_duplicated, bits.duplicated),
            (self.is_patched, bits.patched),
            (self.is_last_sibling, bits.last_sibling),
            (self.is_zlib_compressed, bits.zlib),
            (self.is_lzss_compressed, bits.lzss),
            (self.is_aes_encrypted, bits.aes),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |flags, (_, bit)| flags | bit)
    }

    /// Compression named by the flags, zlib winning if both are set
    pub fn compression(&self) -> NefsCompression {
        if self.is_zlib_compressed {
            NefsCompression::Zlib
        } else if self.is_lzss_compressed {
            NefsCompression::Lzss
        } else {
            NefsCompression::None
        }
    }
}

/// A file or directory
#[derive(Debug, Clone, PartialEq)]
pub struct NefsItem {
    id: NefsItemId,
    first_duplicate_id: NefsItemId,
    directory_id: NefsItemId,
    file_name: String,
    data_source: NefsDataSource,
    transform: Option<NefsDataTransform>,
    attributes: NefsItemAttributes,
    state: NefsItemState,
}

#[bon]
impl NefsItem {
    /// Creates an item
    ///
    /// `first_duplicate_id` defaults to `id` (not a duplicate) and `directory_id` defaults to
    /// `id` (a root item).
    #[builder]
    pub fn new(
        id: NefsItemId,
        first_duplicate_id: Option<NefsItemId>,
        directory_id: Option<NefsItemId>,
        #[builder(into)] file_name: String,
        #[builder(default)] data_source: NefsDataSource,
        transform: Option<NefsDataTransform>,
        #[builder(default)] attributes: NefsItemAttributes,
        #[builder(default)] state: NefsItemState,
    ) -> Self {
        Self {
            id,
            first_duplicate_id: first_duplicate_id.unwrap_or(id),
            directory_id: directory_id.unwrap_or(id),
            file_name,
            data_source,
            transform,
            attributes,
            state,
        }
    }
}

impl NefsItem {
    pub fn id(&self) -> NefsItemId {
        self.id
    }

    /// Id of the item owning this item's duplicate group, own id if unique
    pub fn first_duplicate_id(&self) -> NefsItemId {
        self.first_duplicate_id
    }

    /// Id of the parent directory, own id for root items
    pub fn directory_id(&self) -> NefsItemId {
        self.directory_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn data_source(&self) -> &NefsDataSource {
        &self.data_source
    }

    pub fn transform(&self) -> Option<&NefsDataTransform> {
        self.transform.as_ref()
    }

    pub fn attributes(&self) -> &NefsItemAttributes {
        &self.attributes
    }

    pub fn state(&self) -> NefsItemState {
        self.state
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.is_directory
    }

    pub fn is_root(&self) -> bool {
        self.directory_id == self.id
    }

    /// Whether this item is a later member of a duplicate group
    pub fn is_duplicate(&self) -> bool {
        self.first_duplicate_id != self.id
    }

    pub fn extracted_size(&self) -> u64 {
        self.data_source.size().extracted_size()
    }

    pub fn transformed_size(&self) -> u64 {
        self.data_source.size().transformed_size()
    }

    pub fn update_state(&mut self, state: NefsItemState) {
        self.state = state;
    }

    /// Replaces the bytes of a file
    pub fn update_data_source(&mut self, source: NefsDataSource, state: NefsItemState) -> Result<()> {
        if self.is_directory() {
            return Err(Error::invalid_argument(format!(
                "directory {} has no data source",
                self.file_name
            )));
        }

        self.data_source = source;
        self.state = state;
        Ok(())
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut NefsItemAttributes {
        &mut self.attributes
    }
}

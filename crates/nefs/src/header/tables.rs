//! Read-only projections of the header tables.

use crate::codec::{RecordCodec, TableRecord};
use crate::error::Result;
use crate::version::VersionLayout;

/// Block index of a file stored without chunks
pub const NO_BLOCK: u32 = 0xFFFF_FFFF;

/// One entry table row, describing where an item's data is placed
#[derive(Debug, Clone, Default)]
pub struct EntryRow {
    /// Absolute offset of the stored bytes inside the item's volume
    pub data_offset: u64,
    /// Volume index, only stored here by revisions without a writeable entry table
    pub volume: u16,
    /// Item flags, only stored here by revisions without a writeable entry table
    pub flags: u16,
    /// Index into the shared-info table
    pub shared_info_index: u32,
    /// Index of the first block table row, or [`NO_BLOCK`]
    pub first_block: u32,
    /// Id of the next item of the duplicate group, own id when last
    pub next_duplicate: u32,
    preserved: Box<[u8]>,
}

/// One shared-info table row, shared by an item and all of its duplicates
#[derive(Debug, Clone, Default)]
pub struct SharedInfoRow {
    /// Id of the parent directory, own id for root items
    pub parent_id: u32,
    /// Id of the lowest id child, own id when there is none
    pub first_child_id: u32,
    /// Offset of the name inside the name table
    pub name_offset: u32,
    pub extracted_size: u64,
    pub first_duplicate_id: u32,
    preserved: Box<[u8]>,
}

/// One block table row, describing one stored chunk
#[derive(Debug, Clone, Default)]
pub struct BlockRow {
    /// Running total of transformed bytes up to and including this chunk
    pub cumulative_size: u32,
    /// Transform kind bits, see [`crate::transform::NefsDataTransform::block_kind`]
    pub transform: u16,
    pub checksum: u16,
    preserved: Box<[u8]>,
}

/// One volume-info table row
#[derive(Debug, Clone, Default)]
pub struct VolumeInfoRow {
    pub size: u64,
    pub name_offset: u32,
    /// Offset of the first payload byte inside the volume
    pub data_offset: u32,
    preserved: Box<[u8]>,
}

/// One writeable entry table row
#[derive(Debug, Clone, Default)]
pub struct WriteableEntryRow {
    pub volume: u16,
    pub flags: u16,
    preserved: Box<[u8]>,
}

/// One writeable shared-info table row
#[derive(Debug, Clone, Default)]
pub struct WriteableSharedInfoRow {
    pub id: u32,
    pub sibling_id: u32,
    pub patch_id: u32,
    preserved: Box<[u8]>,
}

/// SHA-256 digest of one payload block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashDigest(pub [u8; 32]);

impl EntryRow {
    pub fn new(
        data_offset: u64,
        shared_info_index: u32,
        first_block: u32,
        next_duplicate: u32,
    ) -> Self {
        Self {
            data_offset,
            shared_info_index,
            first_block,
            next_duplicate,
            ..Default::default()
        }
    }
}

impl SharedInfoRow {
    pub fn new(
        parent_id: u32,
        first_child_id: u32,
        name_offset: u32,
        extracted_size: u64,
        first_duplicate_id: u32,
    ) -> Self {
        Self {
            parent_id,
            first_child_id,
            name_offset,
            extracted_size,
            first_duplicate_id,
            ..Default::default()
        }
    }
}

impl BlockRow {
    pub fn new(cumulative_size: u32, transform: u16, checksum: u16) -> Self {
        Self {
            cumulative_size,
            transform,
            checksum,
            ..Default::default()
        }
    }
}

impl VolumeInfoRow {
    pub fn new(size: u64, name_offset: u32, data_offset: u32) -> Self {
        Self {
            size,
            name_offset,
            data_offset,
            ..Default::default()
        }
    }
}

impl WriteableEntryRow {
    pub fn new(volume: u16, flags: u16) -> Self {
        Self {
            volume,
            flags,
            ..Default::default()
        }
    }
}

impl WriteableSharedInfoRow {
    pub fn new(id: u32, sibling_id: u32, patch_id: u32) -> Self {
        Self {
            id,
            sibling_id,
            patch_id,
            ..Default::default()
        }
    }
}

impl TableRecord for EntryRow {
    fn record_size(layout: &VersionLayout) -> usize {
        layout.entry.size
    }

    fn decode(codec: &RecordCodec, layout: &VersionLayout, record: &[u8]) -> Self {
        let fields = &layout.entry;
        Self {
            data_offset: codec.get(record, fields.data_offset),
            volume: codec.get(record, fields.volume) as u16,
            flags: codec.get(record, fields.flags) as u16,
            shared_info_index: codec.get(record, fields.shared_info_index) as u32,
            first_block: codec.get(record, fields.first_block) as u32,
            next_duplicate: codec.get(record, fields.next_duplicate) as u32,
            preserved: record.into(),
        }
    }

    fn encode(&self, codec: &RecordCodec, layout: &VersionLayout, record: &mut [u8]) -> Result<()> {
        let fields = &layout.entry;
        codec.put(record, fields.data_offset, self.data_offset)?;
        codec.put(record, fields.volume, self.volume.into())?;
        codec.put(record, fields.flags, self.flags.into())?;
        codec.put(record, fields.shared_info_index, self.shared_info_index.into())?;
        codec.put(record, fields.first_block, self.first_block.into())?;
        codec.put(record, fields.next_duplicate, self.next_duplicate.into())
    }

    fn preserved(&self) -> &[u8] {
        &self.preserved
    }
}

impl TableRecord for SharedInfoRow {
    fn record_size(layout: &VersionLayout) -> usize {
        layout.shared_info.size
    }

    fn decode(codec: &RecordCodec, layout: &VersionLayout, record: &[u8]) -> Self {
        let fields = &layout.shared_info;
        Self {
            parent_id: codec.get(record, fields.parent_id) as u32,
            first_child_id: codec.get(record, fields.first_child_id) as u32,
            name_offset: codec.get(record, fields.name_offset) as u32,
            extracted_size: codec.get(record, fields.extracted_size),
            first_duplicate_id: codec.get(record, fields.first_duplicate_id) as u32,
            preserved: record.into(),
        }
    }

    fn encode(&self, codec: &RecordCodec, layout: &VersionLayout, record: &mut [u8]) -> Result<()> {
        let fields = &layout.shared_info;
        codec.put(record, fields.parent_id, self.parent_id.into())?;
        codec.put(record, fields.first_child_id, self.first_child_id.into())?;
        codec.put(record, fields.name_offset, self.name_offset.into())?;
        codec.put(record, fields.extracted_size, self.extracted_size)?;
        codec.put(record, fields.first_duplicate_id, self.first_duplicate_id.into())
    }

    fn preserved(&self) -> &[u8] {
        &self.preserved
    }
}

impl TableRecord for BlockRow {
    fn record_size(layout: &VersionLayout) -> usize {
        layout.block.size
    }

    fn decode(codec: &RecordCodec, layout: &VersionLayout, record: &[u8]) -> Self {
        let fields = &layout.block;
        Self {
            cumulative_size: codec.get(record, fields.cumulative_size) as u32,
            transform: codec.get(record, fields.transform) as u16,
            checksum: codec.get(record, fields.checksum) as u16,
            preserved: record.into(),
        }
    }

    fn encode(&self, codec: &RecordCodec, layout: &VersionLayout, record: &mut [u8]) -> Result<()> {
        let fields = &layout.block;
        codec.put(record, fields.cumulative_size, self.cumulative_size.into())?;
        codec.put(record, fields.transform, self.transform.into())?;
        codec.put(record, fields.checksum, self.checksum.into())
    }

    fn preserved(&self) -> &[u8] {
        &self.preserved
    }
}

impl TableRecord for VolumeInfoRow {
    fn record_size(layout: &VersionLayout) -> usize {
        layout.volume_info.size
    }

    fn decode(codec: &RecordCodec, layout: &VersionLayout, record: &[u8]) -> Self {
        let fields = &layout.volume_info;
        Self {
            size: codec.get(record, fields.volume_size),
            name_offset: codec.get(record, fields.name_offset) as u32,
            data_offset: codec.get(record, fields.data_offset) as u32,
            preserved: record.into(),
        }
    }

    fn encode(&self, codec: &RecordCodec, layout: &VersionLayout, record: &mut [u8]) -> Result<()> {
        let fields = &layout.volume_info;
        codec.put(record, fields.volume_size, self.size)?;
        codec.put(record, fields.name_offset, self.name_offset.into())?;
        codec.put(record, fields.data_offset, self.data_offset.into())
    }

    fn preserved(&self) -> &[u8] {
        &self.preserved
    }
}

impl TableRecord for WriteableEntryRow {
    fn record_size(layout: &VersionLayout) -> usize {
        layout.writeable_entry.as_ref().map_or(0, |l| l.size)
    }

    fn decode(codec: &RecordCodec, layout: &VersionLayout, record: &[u8]) -> Self {
        let Some(fields) = &layout.writeable_entry else {
            return Self::default();
        };
        Self {
            volume: codec.get(record, fields.volume) as u16,
            flags: codec.get(record, fields.flags) as u16,
            preserved: record.into(),
        }
    }

    fn encode(&self, codec: &RecordCodec, layout: &VersionLayout, record: &mut [u8]) -> Result<()> {
        let Some(fields) = &layout.writeable_entry else {
            return Ok(());
        };
        codec.put(record, fields.volume, self.volume.into())?;
        codec.put(record, fields.flags, self.flags.into())
    }

    fn preserved(&self) -> &[u8] {
        &self.preserved
    }
}

impl TableRecord for WriteableSharedInfoRow {
    fn record_size(layout: &VersionLayout) -> usize {
        layout.writeable_shared_info.as_ref().map_or(0, |l| l.size)
    }

    fn decode(codec: &RecordCodec, layout: &VersionLayout, record: &[u8]) -> Self {
        let Some(fields) = &layout.writeable_shared_info else {
            return Self::default();
        };
        Self {
            id: codec.get(record, fields.id) as u32,
            sibling_id: codec.get(record, fields.sibling_id) as u32,
            patch_id: codec.get(record, fields.patch_id) as u32,
            preserved: record.into(),
        }
    }

    fn encode(&self, codec: &RecordCodec, layout: &VersionLayout, record: &mut [u8]) -> Result<()> {
        let Some(fields) = &layout.writeable_shared_info else {
            return Ok(());
        };
        codec.put(record, fields.id, self.id.into())?;
        codec.put(record, fields.sibling_id, self.sibling_id.into())?;
        codec.put(record, fields.patch_id, self.patch_id.into())
    }

    fn preserved(&self) -> &[u8] {
        &self.preserved
    }
}

impl TableRecord for HashDigest {
    fn record_size(layout: &VersionLayout) -> usize {
        if layout.has_hash_digests {
            32
        } else {
            0
        }
    }

    fn decode(_codec: &RecordCodec, _layout: &VersionLayout, record: &[u8]) -> Self {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(record);
        Self(digest)
    }

    fn encode(&self, _codec: &RecordCodec, _layout: &VersionLayout, record: &mut [u8]) -> Result<()> {
        record.copy_from_slice(&self.0);
        Ok(())
    }

    fn preserved(&self) -> &[u8] {
        &[]
    }
}

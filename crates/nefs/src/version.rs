//! Header revisions and the per-revision record layouts.
//!
//! Each revision gets a [`VersionLayout`] listing where every known field of every table record
//! lives. [`crate::codec::RecordCodec`] reads and writes records through these descriptors.

use std::{fmt, str::FromStr};

use binrw::Endian;

use crate::codec::Field;
use crate::error::{Error, Result};

/// Identifies a NeFS header revision
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NefsVersion {
    /// 0.1.0, the earliest known revision
    V010,
    /// 1.5.0
    V150,
    /// 1.5.1, the big-endian console variant of 1.5.0
    V151,
    /// 1.6.0
    V160,
    /// 2.0.0
    V200,
}

/// Groups revisions that share an intro and table of contents shape
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderFamily {
    /// 0.1.0
    V010,
    /// 1.5.0 and 1.5.1
    V150,
    /// 1.6.0 and 2.0.0
    V160,
}

/// How the archive wide AES key is stored in the intro
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AesKeyEncoding {
    /// The revision has no key field
    None,
    /// 32 raw key bytes
    Raw,
    /// 64 ASCII hex characters
    Hex,
}

impl NefsVersion {
    /// All supported revisions, oldest first
    pub const ALL: [NefsVersion; 5] = [
        NefsVersion::V010,
        NefsVersion::V150,
        NefsVersion::V151,
        NefsVersion::V160,
        NefsVersion::V200,
    ];

    /// The value stored in the header's version field
    pub const fn raw(self) -> u32 {
        match self {
            NefsVersion::V010 => 0x0000_0100,
            NefsVersion::V150 => 0x0001_0500,
            NefsVersion::V151 => 0x0001_0501,
            NefsVersion::V160 => 0x0001_0600,
            NefsVersion::V200 => 0x0002_0000,
        }
    }

    /// Maps a raw version field back to a revision
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.raw() == raw)
            .ok_or(Error::UnsupportedVersion(raw))
    }

    /// Byte order of every multi-byte field in the header
    pub const fn endian(self) -> Endian {
        match self {
            NefsVersion::V151 => Endian::Big,
            _ => Endian::Little,
        }
    }

    /// The intro/table of contents family of this revision
    pub const fn family(self) -> HeaderFamily {
        match self {
            NefsVersion::V010 => HeaderFamily::V010,
            NefsVersion::V150 | NefsVersion::V151 => HeaderFamily::V150,
            NefsVersion::V160 | NefsVersion::V200 => HeaderFamily::V160,
        }
    }

    /// Table record layouts of this revision
    pub fn layout(self) -> &'static VersionLayout {
        match self {
            NefsVersion::V010 => &LAYOUT_010,
            NefsVersion::V150 | NefsVersion::V151 => &LAYOUT_150,
            NefsVersion::V160 => &LAYOUT_160,
            NefsVersion::V200 => &LAYOUT_200,
        }
    }
}

impl fmt::Display for NefsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.raw();
        write!(f, "{}.{}.{}", raw >> 16, (raw >> 8) & 0xFF, raw & 0xFF)
    }
}

impl FromStr for NefsVersion {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != '.').collect();
        match compact.as_str() {
            "010" => Ok(NefsVersion::V010),
            "150" => Ok(NefsVersion::V150),
            "151" => Ok(NefsVersion::V151),
            "160" => Ok(NefsVersion::V160),
            "200" => Ok(NefsVersion::V200),
            _ => Err(format!("unknown nefs version '{s}'")),
        }
    }
}

/// Entry table record
#[derive(Debug)]
pub struct EntryLayout {
    pub size: usize,
    pub data_offset: Field,
    pub volume: Field,
    pub flags: Field,
    pub shared_info_index: Field,
    pub first_block: Field,
    pub next_duplicate: Field,
}

/// Shared-info table record
#[derive(Debug)]
pub struct SharedInfoLayout {
    pub size: usize,
    pub parent_id: Field,
    pub first_child_id: Field,
    pub name_offset: Field,
    pub extracted_size: Field,
    pub first_duplicate_id: Field,
}

/// Block table record
#[derive(Debug)]
pub struct BlockLayout {
    pub size: usize,
    pub cumulative_size: Field,
    pub transform: Field,
    pub checksum: Field,
}

/// Volume-info table record
#[derive(Debug)]
pub struct VolumeInfoLayout {
    pub size: usize,
    pub volume_size: Field,
    pub name_offset: Field,
    pub data_offset: Field,
}

/// Writeable entry table record
#[derive(Debug)]
pub struct WriteableEntryLayout {
    pub size: usize,
    pub volume: Field,
    pub flags: Field,
}

/// Writeable shared-info table record
#[derive(Debug)]
pub struct WriteableSharedInfoLayout {
    pub size: usize,
    pub id: Field,
    pub sibling_id: Field,
    pub patch_id: Field,
}

/// Item flag bits, zero when the revision cannot express the attribute
#[derive(Debug)]
pub struct FlagBits {
    pub zlib: u16,
    pub aes: u16,
    pub directory: u16,
    pub duplicated: u16,
    pub cacheable: u16,
    pub last_sibling: u16,
    pub patched: u16,
    pub lzss: u16,
}

/// Everything that varies between revisions below the table of contents
#[derive(Debug)]
pub struct VersionLayout {
    pub entry: EntryLayout,
    pub shared_info: SharedInfoLayout,
    pub block: BlockLayout,
    pub volume_info: VolumeInfoLayout,
    pub writeable_entry: Option<WriteableEntryLayout>,
    pub writeable_shared_info: Option<WriteableSharedInfoLayout>,
    pub flags: FlagBits,
    pub aes_key: AesKeyEncoding,
    pub has_hash_digests: bool,
    pub has_split_size: bool,
    pub default_block_size: u32,
}

const VOLUME_INFO: VolumeInfoLayout = VolumeInfoLayout {
    size: 0x10,
    volume_size: Field::new(0x00, 8),
    name_offset: Field::new(0x08, 4),
    data_offset: Field::new(0x0C, 4),
};

const SHARED_INFO_V1: SharedInfoLayout = SharedInfoLayout {
    size: 0x14,
    parent_id: Field::new(0x00, 4),
    first_child_id: Field::new(0x04, 4),
    name_offset: Field::new(0x08, 4),
    extracted_size: Field::new(0x0C, 4),
    first_duplicate_id: Field::new(0x10, 4),
};

const ENTRY_V15: EntryLayout = EntryLayout {
    size: 0x14,
    data_offset: Field::new(0x00, 8),
    volume: Field::ABSENT,
    flags: Field::ABSENT,
    shared_info_index: Field::new(0x08, 4),
    first_block: Field::new(0x0C, 4),
    next_duplicate: Field::new(0x10, 4),
};

const BLOCK_PLAIN: BlockLayout = BlockLayout {
    size: 0x04,
    cumulative_size: Field::new(0x00, 4),
    transform: Field::ABSENT,
    checksum: Field::ABSENT,
};

const BLOCK_TAGGED: BlockLayout = BlockLayout {
    size: 0x08,
    cumulative_size: Field::new(0x00, 4),
    transform: Field::new(0x04, 2),
    checksum: Field::new(0x06, 2),
};

const WRITEABLE_ENTRY: WriteableEntryLayout = WriteableEntryLayout {
    size: 0x04,
    volume: Field::new(0x00, 2),
    flags: Field::new(0x02, 2),
};

const WRITEABLE_SHARED_INFO_V16: WriteableSharedInfoLayout = WriteableSharedInfoLayout {
    size: 0x0C,
    id: Field::new(0x00, 4),
    sibling_id: Field::new(0x04, 4),
    patch_id: Field::new(0x08, 4),
};

const FLAGS_V16: FlagBits = FlagBits {
    last_sibling: 0x01,
    directory: 0x02,
    duplicated: 0x04,
    cacheable: 0x08,
    patched: 0x10,
    zlib: 0x20,
    lzss: 0x40,
    aes: 0x80,
};

static LAYOUT_010: VersionLayout = VersionLayout {
    entry: EntryLayout {
        size: 0x18,
        data_offset: Field::new(0x00, 8),
        volume: Field::new(0x08, 2),
        flags: Field::new(0x0A, 2),
        shared_info_index: Field::new(0x0C, 4),
        first_block: Field::new(0x10, 4),
        next_duplicate: Field::new(0x14, 4),
    },
    shared_info: SHARED_INFO_V1,
    block: BLOCK_PLAIN,
    volume_info: VOLUME_INFO,
    writeable_entry: None,
    writeable_shared_info: None,
    flags: FlagBits {
        zlib: 0x01,
        directory: 0x02,
        duplicated: 0x04,
        last_sibling: 0x08,
        aes: 0,
        cacheable: 0,
        patched: 0,
        lzss: 0,
    },
    aes_key: AesKeyEncoding::None,
    has_hash_digests: false,
    has_split_size: false,
    default_block_size: 0x10000,
};

static LAYOUT_150: VersionLayout = VersionLayout {
    entry: ENTRY_V15,
    shared_info: SHARED_INFO_V1,
    block: BLOCK_PLAIN,
    volume_info: VOLUME_INFO,
    writeable_entry: Some(WRITEABLE_ENTRY),
    writeable_shared_info: Some(WriteableSharedInfoLayout {
        size: 0x08,
        id: Field::new(0x00, 4),
        sibling_id: Field::new(0x04, 4),
        patch_id: Field::ABSENT,
    }),
    flags: FlagBits {
        zlib: 0x01,
        aes: 0x02,
        directory: 0x04,
        duplicated: 0x08,
        cacheable: 0x10,
        last_sibling: 0x20,
        patched: 0x40,
        lzss: 0x80,
    },
    aes_key: AesKeyEncoding::Raw,
    has_hash_digests: false,
    has_split_size: true,
    default_block_size: 0x10000,
};

static LAYOUT_160: VersionLayout = VersionLayout {
    entry: ENTRY_V15,
    shared_info: SHARED_INFO_V1,
    block: BLOCK_TAGGED,
    volume_info: VOLUME_INFO,
    writeable_entry: Some(WRITEABLE_ENTRY),
    writeable_shared_info: Some(WRITEABLE_SHARED_INFO_V16),
    flags: FLAGS_V16,
    aes_key: AesKeyEncoding::Hex,
    has_hash_digests: true,
    has_split_size: true,
    default_block_size: 0x10000,
};

static LAYOUT_200: VersionLayout = VersionLayout {
    entry: EntryLayout {
        size: 0x14,
        data_offset: Field::new(0x00, 8),
        volume: Field::ABSENT,
        flags: Field::ABSENT,
        first_block: Field::new(0x08, 4),
        next_duplicate: Field::new(0x0C, 4),
        shared_info_index: Field::new(0x10, 4),
    },
    shared_info: SharedInfoLayout {
        size: 0x18,
        parent_id: Field::new(0x00, 4),
        first_child_id: Field::new(0x04, 4),
        name_offset: Field::new(0x08, 4),
        first_duplicate_id: Field::new(0x0C, 4),
        extracted_size: Field::new(0x10, 8),
    },
    block: BLOCK_TAGGED,
    volume_info: VOLUME_INFO,
    writeable_entry: Some(WRITEABLE_ENTRY),
    writeable_shared_info: Some(WRITEABLE_SHARED_INFO_V16),
    flags: FLAGS_V16,
    aes_key: AesKeyEncoding::Hex,
    has_hash_digests: true,
    has_split_size: true,
    default_block_size: 0x10000,
};

#[cfg(test)]
mod test {
    use binrw::Endian;
    use pretty_assertions::assert_eq;

    use crate::error::Result;
    use crate::version::NefsVersion;

    #[test]
    fn raw_version_round_trips() -> Result<()> {
        for version in NefsVersion::ALL {
            assert_eq!(NefsVersion::from_raw(version.raw())?, version);
        }
        assert!(NefsVersion::from_raw(0x0001_0700).is_err());
        Ok(())
    }

    #[test]
    fn display_and_parse() {
        assert_eq!(NefsVersion::V151.to_string(), "1.5.1");
        assert_eq!(NefsVersion::V010.to_string(), "0.1.0");
        assert_eq!("2.0.0".parse::<NefsVersion>(), Ok(NefsVersion::V200));
        assert_eq!("160".parse::<NefsVersion>(), Ok(NefsVersion::V160));
        assert!("3.0.0".parse::<NefsVersion>().is_err());
    }

    #[test]
    fn only_151_is_big_endian() {
        for version in NefsVersion::ALL {
            let expected = if version == NefsVersion::V151 {
                Endian::Big
            } else {
                Endian::Little
            };
            assert_eq!(version.endian(), expected);
        }
    }

    #[test]
    fn record_fields_fit_their_records() {
        for version in NefsVersion::ALL {
            let layout = version.layout();
            for field in [
                layout.entry.data_offset,
                layout.entry.volume,
                layout.entry.flags,
                layout.entry.shared_info_index,
                layout.entry.first_block,
                layout.entry.next_duplicate,
            ] {
                assert!(field.end() <= layout.entry.size, "{version} entry");
            }
            for field in [
                layout.shared_info.parent_id,
                layout.shared_info.first_child_id,
                layout.shared_info.name_offset,
                layout.shared_info.extracted_size,
                layout.shared_info.first_duplicate_id,
            ] {
                assert!(field.end() <= layout.shared_info.size, "{version} shared info");
            }
        }
    }
}

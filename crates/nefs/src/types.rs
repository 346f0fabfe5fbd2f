//! Base types for the intro and table of contents of each header family.
//!
//! These are read and written with the byte order of the concrete revision, passed to binrw at
//! runtime, so 1.5.0 and 1.5.1 share [`Intro150`] even though 1.5.1 is big-endian.

use binrw::{BinRead, BinWrite};

/// Fixed magic at the start of every NeFS header
pub const NEFS_MAGIC: &[u8; 4] = b"NeFS";

/// Header intro for revision 0.1.0
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[brw(magic = b"NeFS")]
pub struct Intro010 {
    /// SHA-256 of the header, see [`crate::header::NefsHeader::compute_hash`]
    pub hash: [u8; 32],

    /// Size in bytes of the intro, table of contents and all tables
    pub header_size: u32,

    /// Raw version, always `0x00000100`
    pub version: u32,

    /// Number of entry table rows
    pub entry_count: u32,

    /// Game specific value with no meaning to the archive itself
    pub user_value: u32,

    #[allow(dead_code)]
    pub reserved: [u8; 12],

    /// Table of contents directly following the intro
    pub toc: Toc010,
}

/// Table of contents for revision 0.1.0
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
pub struct Toc010 {
    pub entry_table_start: u32,
    pub shared_info_table_start: u32,
    pub name_table_start: u32,
    pub block_table_start: u32,
    pub volume_info_table_start: u32,

    /// Number of volume-info rows
    pub volume_count: u16,

    /// Chunk size items are sliced into, stored shifted right by 15
    #[br(map = |raw: u16| u32::from(raw) << 15)]
    #[bw(map = |size: &u32| (*size >> 15) as u16)]
    pub block_size: u32,

    #[allow(dead_code)]
    pub reserved: [u8; 8],
}

/// Header intro for revisions 1.5.0 and 1.5.1
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[brw(magic = b"NeFS")]
pub struct Intro150 {
    pub header_size: u32,
    pub version: u32,
    pub entry_count: u32,
    pub user_value: u32,

    /// Archive wide AES-256 key, all zero when items are not encrypted
    pub aes_key: [u8; 32],

    pub hash: [u8; 32],

    /// Bit 0 marks an encrypted header
    pub header_flags: u32,

    #[allow(dead_code)]
    pub reserved: [u8; 8],

    pub toc: Toc150,
}

/// Table of contents for revisions 1.5.0 and 1.5.1
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
pub struct Toc150 {
    pub entry_table_start: u32,
    pub shared_info_table_start: u32,
    pub name_table_start: u32,
    pub block_table_start: u32,
    pub volume_info_table_start: u32,
    pub writeable_entry_table_start: u32,
    pub writeable_shared_info_table_start: u32,
    pub volume_count: u16,

    #[allow(dead_code)]
    pub reserved0: u16,

    #[br(map = |raw: u32| raw << 15)]
    #[bw(map = |size: &u32| *size >> 15)]
    pub block_size: u32,

    /// Size after which a volume continues in the next numbered split file, zero if unsplit
    #[br(map = |raw: u32| u64::from(raw) << 15)]
    #[bw(map = |size: &u64| (*size >> 15) as u32)]
    pub split_size: u64,

    #[allow(dead_code)]
    pub reserved1: [u8; 24],
}

/// Header intro for revisions 1.6.0 and 2.0.0
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[brw(magic = b"NeFS")]
pub struct Intro160 {
    pub hash: [u8; 32],

    /// Archive wide AES-256 key as 64 ASCII hex characters, all zero when unused
    pub aes_key_hex: [u8; 64],

    pub header_size: u32,
    pub version: u32,
    pub entry_count: u32,
    pub user_value: u32,

    /// Bit 0 marks an encrypted header
    pub header_flags: u32,

    #[allow(dead_code)]
    pub reserved: [u8; 8],

    pub toc: Toc160,
}

/// Table of contents for revisions 1.6.0 and 2.0.0
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
pub struct Toc160 {
    pub volume_count: u16,

    /// Payload block size covered by one hash digest, stored shifted right by 15
    #[br(map = |raw: u16| u32::from(raw) << 15)]
    #[bw(map = |size: &u32| (*size >> 15) as u16)]
    pub hash_block_size: u32,

    pub entry_table_start: u32,
    pub shared_info_table_start: u32,
    pub name_table_start: u32,
    pub block_table_start: u32,
    pub volume_info_table_start: u32,
    pub writeable_entry_table_start: u32,
    pub writeable_shared_info_table_start: u32,
    pub hash_digest_table_start: u32,

    #[br(map = |raw: u32| raw << 15)]
    #[bw(map = |size: &u32| *size >> 15)]
    pub block_size: u32,

    #[br(map = |raw: u32| u64::from(raw) << 15)]
    #[bw(map = |size: &u64| (*size >> 15) as u32)]
    pub split_size: u64,

    #[allow(dead_code)]
    pub reserved: [u8; 84],
}

impl Intro010 {
    /// Bytes covered by intro and table of contents
    pub const SIZE: usize = 0x60;
    pub const HASH_RANGE: (usize, usize) = (0x04, 0x24);
    pub const VERSION_OFFSET: usize = 0x28;
}

impl Intro150 {
    pub const SIZE: usize = 0xA0;
    pub const HASH_RANGE: (usize, usize) = (0x34, 0x54);
    pub const AES_KEY_RANGE: (usize, usize) = (0x14, 0x34);
    pub const VERSION_OFFSET: usize = 0x08;
}

impl Intro160 {
    pub const SIZE: usize = 0x100;
    pub const HASH_RANGE: (usize, usize) = (0x04, 0x24);
    pub const AES_KEY_RANGE: (usize, usize) = (0x24, 0x64);
    pub const VERSION_OFFSET: usize = 0x68;
}

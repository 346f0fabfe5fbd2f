//! The versioned archive header: intro, table of contents and tables.
//!
//! All five revisions are exposed through [`NefsHeader`]. The intro and table of contents are
//! revision specific [`binrw`] structs wrapped by [`HeaderIntro`]; every table is decoded by
//! the shared record codec with the layout of the revision.

pub mod builder;
pub mod names;
pub mod tables;

use std::io::{Cursor, Read};

use binrw::{BinRead, BinWrite, Endian};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

use crate::codec::{decode_table, encode_table, RecordCodec, TableExtent, TableRecord};
use crate::error::{Error, Result};
use crate::types::{Intro010, Intro150, Intro160, Toc010, Toc150, Toc160, NEFS_MAGIC};
use crate::version::{AesKeyEncoding, HeaderFamily, NefsVersion, VersionLayout};
use names::NameTable;
use tables::{
    BlockRow, EntryRow, HashDigest, SharedInfoRow, VolumeInfoRow, WriteableEntryRow,
    WriteableSharedInfoRow,
};

/// Bit of the header flags marking an encrypted header
pub const HEADER_FLAG_ENCRYPTED: u32 = 0x1;

/// Hash block size used when the caller does not choose one
pub const DEFAULT_HASH_BLOCK_SIZE: u32 = 0x80_0000;

const LARGEST_INTRO: usize = Intro160::SIZE;

macro_rules! any_intro {
    ($intro:expr, $inner:ident => $body:expr) => {
        match $intro {
            HeaderIntro::V010($inner) => $body,
            HeaderIntro::V150($inner) => $body,
            HeaderIntro::V160($inner) => $body,
        }
    };
}

/// Start offsets of every table, zero for tables the revision does not have
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TableOffsets {
    pub entry: u32,
    pub shared_info: u32,
    pub name: u32,
    pub block: u32,
    pub volume_info: u32,
    pub writeable_entry: u32,
    pub writeable_shared_info: u32,
    pub hash_digest: u32,
}

impl TableOffsets {
    /// Offsets in table of contents order, limited to the tables of `family`
    fn in_order(&self, family: HeaderFamily) -> Vec<u32> {
        let all = [
            self.entry,
            self.shared_info,
            self.name,
            self.block,
            self.volume_info,
            self.writeable_entry,
            self.writeable_shared_info,
            self.hash_digest,
        ];
        all[..table_count(family)].to_vec()
    }

    fn from_order(starts: &[u32]) -> Self {
        let at = |index: usize| starts.get(index).copied().unwrap_or(0);
        Self {
            entry: at(0),
            shared_info: at(1),
            name: at(2),
            block: at(3),
            volume_info: at(4),
            writeable_entry: at(5),
            writeable_shared_info: at(6),
            hash_digest: at(7),
        }
    }
}

fn table_count(family: HeaderFamily) -> usize {
    match family {
        HeaderFamily::V010 => 5,
        HeaderFamily::V150 => 7,
        HeaderFamily::V160 => 8,
    }
}

/// Intro and table of contents of one header family
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderIntro {
    V010(Intro010),
    V150(Intro150),
    V160(Intro160),
}

impl HeaderIntro {
    /// A zeroed intro for `version`
    pub fn empty(version: NefsVersion) -> Self {
        let mut intro = match version.family() {
            HeaderFamily::V010 => HeaderIntro::V010(Intro010 {
                hash: [0; 32],
                header_size: 0,
                version: 0,
                entry_count: 0,
                user_value: 0,
                reserved: [0; 12],
                toc: Toc010 {
                    entry_table_start: 0,
                    shared_info_table_start: 0,
                    name_table_start: 0,
                    block_table_start: 0,
                    volume_info_table_start: 0,
                    volume_count: 0,
                    block_size: 0,
                    reserved: [0; 8],
                },
            }),
            HeaderFamily::V150 => HeaderIntro::V150(Intro150 {
                header_size: 0,
                version: 0,
                entry_count: 0,
                user_value: 0,
                aes_key: [0; 32],
                hash: [0; 32],
                header_flags: 0,
                reserved: [0; 8],
                toc: Toc150 {
                    entry_table_start: 0,
                    shared_info_table_start: 0,
                    name_table_start: 0,
                    block_table_start: 0,
                    volume_info_table_start: 0,
                    writeable_entry_table_start: 0,
                    writeable_shared_info_table_start: 0,
                    volume_count: 0,
                    reserved0: 0,
                    block_size: 0,
                    split_size: 0,
                    reserved1: [0; 24],
                },
            }),
            HeaderFamily::V160 => HeaderIntro::V160(Intro160 {
                hash: [0; 32],
                aes_key_hex: [0; 64],
                header_size: 0,
                version: 0,
                entry_count: 0,
                user_value: 0,
                header_flags: 0,
                reserved: [0; 8],
                toc: Toc160 {
                    volume_count: 0,
                    hash_block_size: 0,
                    entry_table_start: 0,
                    shared_info_table_start: 0,
                    name_table_start: 0,
                    block_table_start: 0,
                    volume_info_table_start: 0,
                    writeable_entry_table_start: 0,
                    writeable_shared_info_table_start: 0,
                    hash_digest_table_start: 0,
                    block_size: 0,
                    split_size: 0,
                    reserved: [0; 84],
                },
            }),
        };
        intro.set_version(version);
        intro
    }

    fn read(bytes: &[u8], version: NefsVersion) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let endian = version.endian();
        Ok(match version.family() {
            HeaderFamily::V010 => HeaderIntro::V010(Intro010::read_options(&mut reader, endian, ())?),
            HeaderFamily::V150 => HeaderIntro::V150(Intro150::read_options(&mut reader, endian, ())?),
            HeaderFamily::V160 => HeaderIntro::V160(Intro160::read_options(&mut reader, endian, ())?),
        })
    }

    fn to_bytes(&self, endian: Endian) -> Result<Vec<u8>> {
        let mut writer = Cursor::new(Vec::with_capacity(self.size()));
        any_intro!(self, intro => intro.write_options(&mut writer, endian, ())?);
        Ok(writer.into_inner())
    }

    pub fn family(&self) -> HeaderFamily {
        match self {
            HeaderIntro::V010(_) => HeaderFamily::V010,
            HeaderIntro::V150(_) => HeaderFamily::V150,
            HeaderIntro::V160(_) => HeaderFamily::V160,
        }
    }

    /// Bytes taken by the intro and table of contents
    pub fn size(&self) -> usize {
        match self {
            HeaderIntro::V010(_) => Intro010::SIZE,
            HeaderIntro::V150(_) => Intro150::SIZE,
            HeaderIntro::V160(_) => Intro160::SIZE,
        }
    }

    pub fn header_size(&self) -> u32 {
        any_intro!(self, intro => intro.header_size)
    }

    pub fn version_raw(&self) -> u32 {
        any_intro!(self, intro => intro.version)
    }

    pub fn entry_count(&self) -> u32 {
        any_intro!(self, intro => intro.entry_count)
    }

    pub fn user_value(&self) -> u32 {
        any_intro!(self, intro => intro.user_value)
    }

    pub fn hash(&self) -> [u8; 32] {
        any_intro!(self, intro => intro.hash)
    }

    /// Header flags, always zero for 0.1.0
    pub fn header_flags(&self) -> u32 {
        match self {
            HeaderIntro::V010(_) => 0,
            HeaderIntro::V150(intro) => intro.header_flags,
            HeaderIntro::V160(intro) => intro.header_flags,
        }
    }

    pub fn volume_count(&self) -> u16 {
        any_intro!(self, intro => intro.toc.volume_count)
    }

    pub fn block_size(&self) -> u32 {
        any_intro!(self, intro => intro.toc.block_size)
    }

    /// Split size, zero for unsplit volumes and for 0.1.0
    pub fn split_size(&self) -> u64 {
        match self {
            HeaderIntro::V010(_) => 0,
            HeaderIntro::V150(intro) => intro.toc.split_size,
            HeaderIntro::V160(intro) => intro.toc.split_size,
        }
    }

    /// Payload bytes covered by one hash digest, zero before 1.6.0
    pub fn hash_block_size(&self) -> u32 {
        match self {
            HeaderIntro::V160(intro) => intro.toc.hash_block_size,
            _ => 0,
        }
    }

    /// Hash field, as a byte range of the header
    pub fn hash_range(&self) -> (usize, usize) {
        match self {
            HeaderIntro::V010(_) => Intro010::HASH_RANGE,
            HeaderIntro::V150(_) => Intro150::HASH_RANGE,
            HeaderIntro::V160(_) => Intro160::HASH_RANGE,
        }
    }

    /// AES key field, as a byte range of the header
    pub fn aes_key_range(&self) -> Option<(usize, usize)> {
        match self {
            HeaderIntro::V010(_) => None,
            HeaderIntro::V150(_) => Some(Intro150::AES_KEY_RANGE),
            HeaderIntro::V160(_) => Some(Intro160::AES_KEY_RANGE),
        }
    }

    pub fn table_offsets(&self) -> TableOffsets {
        match self {
            HeaderIntro::V010(intro) => TableOffsets {
                entry: intro.toc.entry_table_start,
                shared_info: intro.toc.shared_info_table_start,
                name: intro.toc.name_table_start,
                block: intro.toc.block_table_start,
                volume_info: intro.toc.volume_info_table_start,
                ..Default::default()
            },
            HeaderIntro::V150(intro) => TableOffsets {
                entry: intro.toc.entry_table_start,
                shared_info: intro.toc.shared_info_table_start,
                name: intro.toc.name_table_start,
                block: intro.toc.block_table_start,
                volume_info: intro.toc.volume_info_table_start,
                writeable_entry: intro.toc.writeable_entry_table_start,
                writeable_shared_info: intro.toc.writeable_shared_info_table_start,
                ..Default::default()
            },
            HeaderIntro::V160(intro) => TableOffsets {
                entry: intro.toc.entry_table_start,
                shared_info: intro.toc.shared_info_table_start,
                name: intro.toc.name_table_start,
                block: intro.toc.block_table_start,
                volume_info: intro.toc.volume_info_table_start,
                writeable_entry: intro.toc.writeable_entry_table_start,
                writeable_shared_info: intro.toc.writeable_shared_info_table_start,
                hash_digest: intro.toc.hash_digest_table_start,
            },
        }
    }

    fn set_table_offsets(&mut self, offsets: &TableOffsets) {
        match self {
            HeaderIntro::V010(intro) => {
                intro.toc.entry_table_start = offsets.entry;
                intro.toc.shared_info_table_start = offsets.shared_info;
                intro.toc.name_table_start = offsets.name;
                intro.toc.block_table_start = offsets.block;
                intro.toc.volume_info_table_start = offsets.volume_info;
            }
            HeaderIntro::V150(intro) => {
                intro.toc.entry_table_start = offsets.entry;
                intro.toc.shared_info_table_start = offsets.shared_info;
                intro.toc.name_table_start = offsets.name;
                intro.toc.block_table_start = offsets.block;
                intro.toc.volume_info_table_start = offsets.volume_info;
                intro.toc.writeable_entry_table_start = offsets.writeable_entry;
                intro.toc.writeable_shared_info_table_start = offsets.writeable_shared_info;
            }
            HeaderIntro::V160(intro) => {
                intro.toc.entry_table_start = offsets.entry;
                intro.toc.shared_info_table_start = offsets.shared_info;
                intro.toc.name_table_start = offsets.name;
                intro.toc.block_table_start = offsets.block;
                intro.toc.volume_info_table_start = offsets.volume_info;
                intro.toc.writeable_entry_table_start = offsets.writeable_entry;
                intro.toc.writeable_shared_info_table_start = offsets.writeable_shared_info;
                intro.toc.hash_digest_table_start = offsets.hash_digest;
            }
        }
    }

    fn set_version(&mut self, version: NefsVersion) {
        any_intro!(self, intro => intro.version = version.raw());
    }

    fn set_header_size(&mut self, size: u32) {
        any_intro!(self, intro => intro.header_size = size);
    }

    fn set_entry_count(&mut self, count: u32) {
        any_intro!(self, intro => intro.entry_count = count);
    }

    fn set_user_value(&mut self, value: u32) {
        any_intro!(self, intro => intro.user_value = value);
    }

    fn set_hash(&mut self, hash: [u8; 32]) {
        any_intro!(self, intro => intro.hash = hash);
    }

    fn set_volume_count(&mut self, count: u16) {
        any_intro!(self, intro => intro.toc.volume_count = count);
    }

    fn set_block_size(&mut self, size: u32) {
        any_intro!(self, intro => intro.toc.block_size = size);
    }

    fn set_header_flags(&mut self, flags: u32) {
        match self {
            HeaderIntro::V010(_) => {}
            HeaderIntro::V150(intro) => intro.header_flags = flags,
            HeaderIntro::V160(intro) => intro.header_flags = flags,
        }
    }

    fn set_split_size(&mut self, size: u64) {
        match self {
            HeaderIntro::V010(_) => {}
            HeaderIntro::V150(intro) => intro.toc.split_size = size,
            HeaderIntro::V160(intro) => intro.toc.split_size = size,
        }
    }

    fn set_hash_block_size(&mut self, size: u32) {
        if let HeaderIntro::V160(intro) = self {
            intro.toc.hash_block_size = size;
        }
    }

    /// Archive wide AES key, `None` when the field is absent, all zero or malformed
    pub fn aes_key(&self) -> Option<[u8; 32]> {
        match self {
            HeaderIntro::V010(_) => None,
            HeaderIntro::V150(intro) => {
                (intro.aes_key != [0; 32]).then_some(intro.aes_key)
            }
            HeaderIntro::V160(intro) => {
                if intro.aes_key_hex.iter().all(|b| *b == 0) {
                    return None;
                }
                let mut key = [0u8; 32];
                match hex::decode_to_slice(intro.aes_key_hex, &mut key) {
                    Ok(()) => Some(key),
                    Err(err) => {
                        warn!(%err, "ignoring malformed AES key");
                        None
                    }
                }
            }
        }
    }

    fn set_aes_key(&mut self, key: Option<[u8; 32]>) -> Result<()> {
        match self {
            HeaderIntro::V010(_) if key.is_some() => Err(Error::unsupported(
                "version 0.1.0 cannot store an AES key",
            )),
            HeaderIntro::V010(_) => Ok(()),
            HeaderIntro::V150(intro) => {
                intro.aes_key = key.unwrap_or([0; 32]);
                Ok(())
            }
            HeaderIntro::V160(intro) => {
                intro.aes_key_hex = [0; 64];
                if let Some(key) = key {
                    intro.aes_key_hex.copy_from_slice(hex::encode_upper(key).as_bytes());
                }
                Ok(())
            }
        }
    }
}

/// One volume of an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NefsVolume {
    /// File name of the volume
    pub name: String,
    /// Offset of the first payload byte
    pub data_offset: u32,
    /// Size of the whole volume file
    pub size: u64,
}

/// A parsed or freshly built NeFS header
#[derive(Debug, Clone)]
pub struct NefsHeader {
    version: NefsVersion,
    intro: HeaderIntro,
    entries: Vec<EntryRow>,
    shared_infos: Vec<SharedInfoRow>,
    names: NameTable,
    blocks: Vec<BlockRow>,
    volume_infos: Vec<VolumeInfoRow>,
    writeable_entries: Vec<WriteableEntryRow>,
    writeable_shared_infos: Vec<WriteableSharedInfoRow>,
    hash_digests: Vec<HashDigest>,
    /// Header bytes the tables are written over, keeping bytes outside any known field
    raw: Vec<u8>,
}

impl NefsHeader {
    /// Detects the revision of the header at the start of `bytes`
    pub fn detect_version(bytes: &[u8]) -> Result<NefsVersion> {
        if bytes.len() < NEFS_MAGIC.len() || &bytes[..4] != NEFS_MAGIC {
            return Err(Error::InvalidArchive);
        }

        let le = |offset: usize| bytes.get(offset..offset + 4).map(LittleEndian::read_u32);
        let be = |offset: usize| bytes.get(offset..offset + 4).map(BigEndian::read_u32);

        let candidates = [
            (le(Intro150::VERSION_OFFSET), NefsVersion::V150),
            (be(Intro150::VERSION_OFFSET), NefsVersion::V151),
            (le(Intro160::VERSION_OFFSET), NefsVersion::V160),
            (le(Intro160::VERSION_OFFSET), NefsVersion::V200),
            (le(Intro010::VERSION_OFFSET), NefsVersion::V010),
        ];

        candidates
            .into_iter()
            .find_map(|(raw, version)| (raw == Some(version.raw())).then_some(version))
            .ok_or(Error::InvalidArchive)
    }

    /// Reads a header from the start of `reader`, consuming exactly the header bytes
    #[instrument(skip_all, err)]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = Vec::with_capacity(LARGEST_INTRO);
        reader.by_ref().take(NEFS_MAGIC.len() as u64).read_to_end(&mut bytes)?;
        if bytes[..] != NEFS_MAGIC[..] {
            return Err(Error::InvalidArchive);
        }

        // the intro of every revision ends before 0x100 and holds the header size
        let version = loop {
            match Self::detect_version(&bytes) {
                Ok(version) => break version,
                Err(_) if bytes.len() < LARGEST_INTRO => {
                    let before = bytes.len();
                    reader.by_ref().take(4).read_to_end(&mut bytes)?;
                    if bytes.len() == before {
                        return Err(Error::InvalidArchive);
                    }
                }
                Err(err) => return Err(err),
            }
        };

        let intro_size = HeaderIntro::empty(version).size();
        if bytes.len() < intro_size {
            let missing = (intro_size - bytes.len()) as u64;
            reader.by_ref().take(missing).read_to_end(&mut bytes)?;
        }
        let header_size = HeaderIntro::read(&bytes, version)?.header_size() as usize;
        if bytes.len() < header_size {
            let missing = (header_size - bytes.len()) as u64;
            reader.by_ref().take(missing).read_to_end(&mut bytes)?;
        }

        Self::read(&bytes)
    }

    /// Parses the header at the start of `bytes`
    ///
    /// Fails when `bytes` ends before the header size the intro claims. Tables are decoded
    /// leniently: a table reaching past the end of the header is cut short rather than failing
    /// the whole header. The tables of an encrypted header are not decoded.
    #[instrument(skip_all, fields(len = bytes.len()), err)]
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let version = Self::detect_version(bytes)?;
        let intro = HeaderIntro::read(bytes, version)?;

        let header_size = intro.header_size() as usize;
        if header_size < intro.size() {
            return Err(Error::InvalidArchive);
        }
        if bytes.len() < header_size {
            warn!(header_size, available = bytes.len(), "header size exceeds the available bytes");
            return Err(Error::InvalidArchive);
        }

        let raw = bytes[..header_size].to_vec();

        let mut header = Self::empty(version, intro, raw);
        if header.is_encrypted() {
            warn!(%version, "header is encrypted, its tables were not decoded");
            return Ok(header);
        }

        header.decode_tables();
        Ok(header)
    }

    fn empty(version: NefsVersion, intro: HeaderIntro, raw: Vec<u8>) -> Self {
        Self {
            version,
            intro,
            entries: Vec::new(),
            shared_infos: Vec::new(),
            names: NameTable::default(),
            blocks: Vec::new(),
            volume_infos: Vec::new(),
            writeable_entries: Vec::new(),
            writeable_shared_infos: Vec::new(),
            hash_digests: Vec::new(),
            raw,
        }
    }

    fn decode_tables(&mut self) {
        let codec = self.codec();
        let layout = self.layout();
        let offsets = self.intro.table_offsets();
        let ends = self.table_ends();
        let buffer = self.raw.as_slice();

        let entry_count = self.intro.entry_count() as usize;
        let span = |start: u32, end: usize| TableExtent::Size(end.saturating_sub(start as usize));

        self.entries = decode_table(
            buffer,
            &codec,
            layout,
            offsets.entry.into(),
            TableExtent::Count(entry_count),
        );
        self.shared_infos = decode_table(
            buffer,
            &codec,
            layout,
            offsets.shared_info.into(),
            span(offsets.shared_info, ends[1]),
        );
        self.names = NameTable::read(
            buffer,
            offsets.name.into(),
            ends[2].saturating_sub(offsets.name as usize),
        );
        self.blocks = decode_table(
            buffer,
            &codec,
            layout,
            offsets.block.into(),
            span(offsets.block, ends[3]),
        );
        self.volume_infos = decode_table(
            buffer,
            &codec,
            layout,
            offsets.volume_info.into(),
            TableExtent::Count(self.intro.volume_count().into()),
        );

        if layout.writeable_entry.is_some() {
            self.writeable_entries = decode_table(
                buffer,
                &codec,
                layout,
                offsets.writeable_entry.into(),
                TableExtent::Count(entry_count),
            );
        }
        if layout.writeable_shared_info.is_some() {
            self.writeable_shared_infos = decode_table(
                buffer,
                &codec,
                layout,
                offsets.writeable_shared_info.into(),
                span(offsets.writeable_shared_info, ends[6]),
            );
        }
        if layout.has_hash_digests {
            self.hash_digests = decode_table(
                buffer,
                &codec,
                layout,
                offsets.hash_digest.into(),
                span(offsets.hash_digest, ends[7]),
            );
        }
    }

    /// End of each table: the start of the next table in table of contents order, or the
    /// header size when that would precede the table's own start
    fn table_ends(&self) -> [usize; 8] {
        let starts = self.intro.table_offsets().in_order(self.intro.family());
        let header_size = self.header_size() as usize;

        let mut ends = [header_size; 8];
        for (index, start) in starts.iter().enumerate() {
            if let Some(next) = starts.get(index + 1) {
                if next >= start {
                    ends[index] = *next as usize;
                }
            }
        }
        ends
    }

    /// Places every table after the intro in table of contents order, each aligned to four
    /// bytes, and updates the table of contents, counts and header size to match
    pub(crate) fn layout_tables(&mut self) -> Result<()> {
        let layout = self.layout();
        let sizes = [
            self.entries.len() * EntryRow::record_size(layout),
            self.shared_infos.len() * SharedInfoRow::record_size(layout),
            self.names.as_bytes().len(),
            self.blocks.len() * BlockRow::record_size(layout),
            self.volume_infos.len() * VolumeInfoRow::record_size(layout),
            self.writeable_entries.len() * WriteableEntryRow::record_size(layout),
            self.writeable_shared_infos.len() * WriteableSharedInfoRow::record_size(layout),
            self.hash_digests.len() * HashDigest::record_size(layout),
        ];

        let mut position = self.intro.size();
        let mut starts = Vec::with_capacity(sizes.len());
        for size in &sizes[..table_count(self.intro.family())] {
            position = position.next_multiple_of(4);
            starts.push(to_u32(position, "table offset")?);
            position += size;
        }

        self.intro.set_table_offsets(&TableOffsets::from_order(&starts));
        self.intro.set_header_size(to_u32(position, "header size")?);
        self.intro.set_entry_count(to_u32(self.entries.len(), "entry count")?);
        self.intro.set_volume_count(
            u16::try_from(self.volume_infos.len())
                .map_err(|_| Error::invalid_argument("too many volumes"))?,
        );
        self.raw = vec![0; position];
        Ok(())
    }

    /// Serializes the header
    ///
    /// A parsed header serializes to the bytes it was parsed from.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let codec = self.codec();
        let layout = self.layout();
        let offsets = self.intro.table_offsets();

        let mut bytes = self.raw.clone();
        bytes.resize(self.header_size() as usize, 0);

        place(&mut bytes, 0, &self.intro.to_bytes(self.endian())?)?;
        place(&mut bytes, offsets.entry, &encode_table(&self.entries, &codec, layout)?)?;
        place(
            &mut bytes,
            offsets.shared_info,
            &encode_table(&self.shared_infos, &codec, layout)?,
        )?;
        place(&mut bytes, offsets.name, self.names.as_bytes())?;
        place(&mut bytes, offsets.block, &encode_table(&self.blocks, &codec, layout)?)?;
        place(
            &mut bytes,
            offsets.volume_info,
            &encode_table(&self.volume_infos, &codec, layout)?,
        )?;
        place(
            &mut bytes,
            offsets.writeable_entry,
            &encode_table(&self.writeable_entries, &codec, layout)?,
        )?;
        place(
            &mut bytes,
            offsets.writeable_shared_info,
            &encode_table(&self.writeable_shared_infos, &codec, layout)?,
        )?;
        place(
            &mut bytes,
            offsets.hash_digest,
            &encode_table(&self.hash_digests, &codec, layout)?,
        )?;

        Ok(bytes)
    }

    /// SHA-256 over the serialized header, skipping the hash field and, for an encrypted
    /// header, the AES key field
    pub fn compute_hash(&self) -> Result<[u8; 32]> {
        let bytes = self.to_bytes()?;

        let mut skipped = vec![self.intro.hash_range()];
        if self.is_encrypted() {
            skipped.extend(self.intro.aes_key_range());
        }
        skipped.sort_unstable();

        let mut hasher = Sha256::new();
        let mut position = 0;
        for (start, end) in skipped {
            if start > position {
                hasher.update(&bytes[position..start.min(bytes.len())]);
            }
            position = position.max(end);
        }
        if position < bytes.len() {
            hasher.update(&bytes[position..]);
        }
        Ok(hasher.finalize().into())
    }

    /// Checks the stored hash against [`NefsHeader::compute_hash`]
    pub fn verify_hash(&self) -> Result<()> {
        let actual = self.compute_hash()?;
        let expected = self.hash();
        if actual == expected {
            Ok(())
        } else {
            Err(Error::HashMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            })
        }
    }

    pub(crate) fn update_hash(&mut self) -> Result<()> {
        let hash = self.compute_hash()?;
        self.intro.set_hash(hash);
        Ok(())
    }

    pub fn version(&self) -> NefsVersion {
        self.version
    }

    pub fn endian(&self) -> Endian {
        self.version.endian()
    }

    pub fn layout(&self) -> &'static VersionLayout {
        self.version.layout()
    }

    pub fn intro(&self) -> &HeaderIntro {
        &self.intro
    }

    fn codec(&self) -> RecordCodec {
        RecordCodec::new(self.endian())
    }

    pub fn is_encrypted(&self) -> bool {
        self.intro.header_flags() & HEADER_FLAG_ENCRYPTED != 0
    }

    /// Key encrypted items are stored with
    pub fn aes_key(&self) -> Option<[u8; 32]> {
        match self.layout().aes_key {
            AesKeyEncoding::None => None,
            AesKeyEncoding::Raw | AesKeyEncoding::Hex => self.intro.aes_key(),
        }
    }

    pub fn hash(&self) -> [u8; 32] {
        self.intro.hash()
    }

    pub fn header_size(&self) -> u32 {
        self.intro.header_size()
    }

    /// Chunk size items are sliced into
    pub fn block_size(&self) -> u32 {
        self.intro.block_size()
    }

    pub fn split_size(&self) -> u64 {
        self.intro.split_size()
    }

    pub fn hash_block_size(&self) -> u32 {
        self.intro.hash_block_size()
    }

    pub fn entry_count(&self) -> u32 {
        self.intro.entry_count()
    }

    pub fn user_value(&self) -> u32 {
        self.intro.user_value()
    }

    /// Offset of the first payload byte of the primary volume
    pub fn data_start(&self) -> u64 {
        self.volume_infos.first().map_or_else(
            || u64::from(self.header_size()).next_multiple_of(16),
            |volume| volume.data_offset.into(),
        )
    }

    /// Name stored at `offset` of the name table
    pub fn file_name(&self, offset: u32) -> Option<&str> {
        self.names.get(offset)
    }

    /// Volumes with their names resolved
    pub fn volumes(&self) -> Vec<NefsVolume> {
        self.volume_infos
            .iter()
            .map(|info| NefsVolume {
                name: self.file_name(info.name_offset).unwrap_or_default().to_owned(),
                data_offset: info.data_offset,
                size: info.size,
            })
            .collect()
    }

    /// Volume index and flags of entry `index`, taken from the writeable entry table when the
    /// revision has one
    pub fn item_flags(&self, index: usize) -> Option<(u16, u16)> {
        if self.layout().writeable_entry.is_some() {
            self.writeable_entries
                .get(index)
                .map(|row| (row.volume, row.flags))
        } else {
            self.entries.get(index).map(|row| (row.volume, row.flags))
        }
    }

    pub fn entries(&self) -> &[EntryRow] {
        &self.entries
    }

    pub fn shared_infos(&self) -> &[SharedInfoRow] {
        &self.shared_infos
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }

    pub fn blocks(&self) -> &[BlockRow] {
        &self.blocks
    }

    pub fn volume_infos(&self) -> &[VolumeInfoRow] {
        &self.volume_infos
    }

    pub fn writeable_entries(&self) -> &[WriteableEntryRow] {
        &self.writeable_entries
    }

    pub fn writeable_shared_infos(&self) -> &[WriteableSharedInfoRow] {
        &self.writeable_shared_infos
    }

    pub fn hash_digests(&self) -> &[HashDigest] {
        &self.hash_digests
    }
}

fn place(bytes: &mut [u8], offset: u32, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let start = offset as usize;
    let end = start + data.len();
    let target = bytes.get_mut(start..end).ok_or(Error::InvalidArchive)?;
    target.copy_from_slice(data);
    Ok(())
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::invalid_argument(format!("{what} exceeds 4 GiB")))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::error::{Error, Result};
    use crate::header::{HeaderIntro, NefsHeader};
    use crate::version::NefsVersion;

    #[test]
    fn detects_every_version() -> Result<()> {
        for version in NefsVersion::ALL {
            let mut header = NefsHeader::empty(version, HeaderIntro::empty(version), Vec::new());
            header.layout_tables()?;
            let bytes = header.to_bytes()?;

            assert_eq!(NefsHeader::detect_version(&bytes)?, version);
        }
        Ok(())
    }

    #[test]
    fn detection_rejects_bad_magic() {
        assert!(matches!(
            NefsHeader::detect_version(b"NeFZ\0\0\0\0"),
            Err(Error::InvalidArchive)
        ));
        assert!(matches!(NefsHeader::detect_version(b"Ne"), Err(Error::InvalidArchive)));
    }

    #[test]
    fn detection_rejects_unknown_version() {
        let mut bytes = vec![0u8; 0x100];
        bytes[..4].copy_from_slice(b"NeFS");
        bytes[0x08..0x0C].copy_from_slice(&0x0001_0700u32.to_le_bytes());
        assert!(NefsHeader::detect_version(&bytes).is_err());
    }

    #[test]
    fn empty_header_round_trips() -> Result<()> {
        for version in NefsVersion::ALL {
            let mut header = NefsHeader::empty(version, HeaderIntro::empty(version), Vec::new());
            header.layout_tables()?;
            header.update_hash()?;
            let bytes = header.to_bytes()?;

            let parsed = NefsHeader::read(&bytes)?;
            assert_eq!(parsed.version(), version);
            assert_eq!(parsed.to_bytes()?, bytes);
            parsed.verify_hash()?;
        }
        Ok(())
    }

    #[test]
    fn tampering_breaks_the_hash() -> Result<()> {
        let version = NefsVersion::V160;
        let mut header = NefsHeader::empty(version, HeaderIntro::empty(version), Vec::new());
        header.layout_tables()?;
        header.update_hash()?;

        let mut bytes = header.to_bytes()?;
        // user value
        bytes[0x70] ^= 0xFF;

        let parsed = NefsHeader::read(&bytes)?;
        assert!(matches!(parsed.verify_hash(), Err(Error::HashMismatch { .. })));
        Ok(())
    }

    #[test]
    fn header_size_beyond_the_input_is_rejected() -> Result<()> {
        let version = NefsVersion::V160;
        let mut header = NefsHeader::empty(version, HeaderIntro::empty(version), Vec::new());
        header.layout_tables()?;

        let mut bytes = header.to_bytes()?;
        // header size
        bytes[0x64..0x68].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        assert!(matches!(NefsHeader::read(&bytes), Err(Error::InvalidArchive)));

        let mut cursor = std::io::Cursor::new(bytes);
        assert!(matches!(NefsHeader::read_from(&mut cursor), Err(Error::InvalidArchive)));
        Ok(())
    }

    #[test]
    fn aes_key_encodings() -> Result<()> {
        let key = [0xA5; 32];

        let mut hex = HeaderIntro::empty(NefsVersion::V200);
        hex.set_aes_key(Some(key))?;
        assert_eq!(hex.aes_key(), Some(key));

        let mut raw = HeaderIntro::empty(NefsVersion::V151);
        raw.set_aes_key(Some(key))?;
        assert_eq!(raw.aes_key(), Some(key));
        raw.set_aes_key(None)?;
        assert_eq!(raw.aes_key(), None);

        let mut none = HeaderIntro::empty(NefsVersion::V010);
        assert!(matches!(
            none.set_aes_key(Some(key)),
            Err(Error::UnsupportedOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn read_from_consumes_only_the_header() -> Result<()> {
        use std::io::{Cursor, Read};

        let version = NefsVersion::V010;
        let mut header = NefsHeader::empty(version, HeaderIntro::empty(version), Vec::new());
        header.layout_tables()?;
        let mut bytes = header.to_bytes()?;
        let header_len = bytes.len();
        bytes.extend_from_slice(b"payload");

        let mut reader = Cursor::new(bytes);
        let parsed = NefsHeader::read_from(&mut reader)?;
        assert_eq!(parsed.header_size() as usize, header_len);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest)?;
        assert_eq!(rest, b"payload");
        Ok(())
    }
}

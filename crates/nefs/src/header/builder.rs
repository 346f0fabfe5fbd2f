//! Builds a brand new header for an item tree.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use bon::builder;
use tracing::{debug, debug_span};

use crate::error::{Error, Result};
use crate::header::names::NameTable;
use crate::header::tables::{
    BlockRow, EntryRow, HashDigest, SharedInfoRow, VolumeInfoRow, WriteableEntryRow,
    WriteableSharedInfoRow, NO_BLOCK,
};
use crate::header::{HeaderIntro, NefsHeader, DEFAULT_HASH_BLOCK_SIZE, HEADER_FLAG_ENCRYPTED};
use crate::item::{NefsItem, NefsItemAttributes, NefsItemId, NefsItemList, NefsItemState};
use crate::source::{NefsDataSource, NefsVolumeLocation, NefsVolumeSource};
use crate::transform::{NefsDataChunk, NefsDataTransform, NefsItemSize};
use crate::version::{NefsVersion, VersionLayout};

/// Sizes stored `>> 15` must be multiples of this
const SIZE_GRANULARITY: u32 = 0x8000;

/// A freshly built header together with the item tree it describes
#[derive(Debug, Clone)]
pub struct BuiltHeader {
    pub header: NefsHeader,
    /// Surviving items with compacted ids, sources pointing into `volume_path`
    pub items: NefsItemList,
}

/// Builds every table of a `version` header for `items`
///
/// Item data sources must describe the bytes as they will be stored, with offsets relative to
/// the first payload byte. Removed items, and everything below or duplicating them, are
/// dropped and the remaining ids are compacted to entry table rows in depth first by id order.
/// Derived attributes (duplicated, last sibling, compression and encryption) are recomputed.
///
/// Reserved bytes are taken from `template` when it belongs to the same header family.
#[builder]
pub fn build_header(
    version: NefsVersion,
    items: &NefsItemList,
    volume_path: &Path,
    template: Option<&NefsHeader>,
    #[builder(default)] payload_size: u64,
    #[builder(default)] hash_digests: Vec<HashDigest>,
    block_size: Option<u32>,
    hash_block_size: Option<u32>,
) -> Result<BuiltHeader> {
    let _span = debug_span!("build_header", %version, items = items.len()).entered();
    let layout = version.layout();
    let template = template.filter(|t| t.version().family() == version.family());

    let block_size = block_size
        .or_else(|| template.map(NefsHeader::block_size))
        .filter(|size| *size != 0)
        .unwrap_or(layout.default_block_size);
    check_granularity(block_size, "block size")?;

    let hash_block_size = if layout.has_hash_digests {
        let size = hash_block_size.unwrap_or(DEFAULT_HASH_BLOCK_SIZE);
        check_granularity(size, "hash block size")?;
        size
    } else {
        0
    };

    let volume_name = volume_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::invalid_argument("volume path has no file name"))?;

    let survivors = surviving_items(items)?;
    let aes_key = shared_aes_key(&survivors, layout)?;
    let mut list = compact_items(items, &survivors, volume_path, block_size)?;
    derive_attributes(&mut list, layout)?;

    let names = NameTable::build(
        list.enumerate_by_id()
            .filter(|item| !item.is_duplicate())
            .map(NefsItem::file_name),
        &volume_name,
    )?;
    let name_offsets: HashMap<&str, u32> = names.iter().map(|(offset, name)| (name, offset)).collect();
    let name_offset = |name: &str| {
        name_offsets
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("name {name:?} missing from name table")))
    };

    let mut shared_infos = Vec::new();
    let mut shared_index = HashMap::new();
    for item in list.enumerate_depth_first_by_name() {
        if item.is_duplicate() {
            continue;
        }
        let id = item.id();
        shared_index.insert(id, shared_infos.len() as u32);
        shared_infos.push(SharedInfoRow::new(
            list.get_item_parent_id(id)?.unwrap_or(id).value(),
            list.get_item_first_child_id(id)?.value(),
            name_offset(item.file_name())?,
            item.extracted_size(),
            id.value(),
        ));
    }

    let mut entries = Vec::with_capacity(list.len());
    let mut writeable_entries = Vec::new();
    let mut blocks = Vec::new();
    for item in list.enumerate_by_id() {
        let primary = list.get_primary_id(item.id())?;
        let first_block = match item.transform() {
            _ if item.is_directory() => 0,
            None => NO_BLOCK,
            Some(_) => {
                let first = u32::try_from(blocks.len())
                    .map_err(|_| Error::invalid_argument("too many chunks"))?;
                blocks.extend(item.data_source().size().chunks().iter().map(|chunk| {
                    BlockRow::new(
                        chunk.cumulative_size(),
                        chunk.transform().block_kind(),
                        chunk.checksum(),
                    )
                }));
                first
            }
        };

        let mut entry = EntryRow::new(
            item.data_source().offset(),
            shared_index.get(&primary).copied().ok_or(Error::ItemNotFound(primary))?,
            first_block,
            next_duplicate(&list, item.id())?.value(),
        );
        let flags = item.attributes().to_flags(&layout.flags);
        let volume = item.attributes().volume;
        if layout.writeable_entry.is_some() {
            writeable_entries.push(WriteableEntryRow::new(volume, flags));
        } else {
            entry.volume = volume;
            entry.flags = flags;
        }
        entries.push(entry);
    }

    let mut writeable_shared_infos = Vec::new();
    if layout.writeable_shared_info.is_some() {
        for item in list.enumerate_depth_first_by_id() {
            if item.is_duplicate() {
                continue;
            }
            let id = item.id();
            let patch_id = list
                .get_item_duplicates(id)?
                .last()
                .map_or(id, |duplicate| duplicate.id());
            writeable_shared_infos.push(WriteableSharedInfoRow::new(
                id.value(),
                list.get_item_sibling_id(id)?.value(),
                patch_id.value(),
            ));
        }
    }

    let mut intro = match template {
        Some(template) => template.intro().clone(),
        None => HeaderIntro::empty(version),
    };
    intro.set_version(version);
    intro.set_header_flags(intro.header_flags() & !HEADER_FLAG_ENCRYPTED);
    intro.set_aes_key(aes_key)?;
    intro.set_block_size(block_size);
    intro.set_split_size(0);
    intro.set_hash_block_size(hash_block_size);
    intro.set_hash([0; 32]);

    let volume_info = VolumeInfoRow::new(0, name_offset(&volume_name)?, 0);
    let mut header = NefsHeader {
        version,
        intro,
        entries,
        shared_infos,
        names,
        blocks,
        volume_infos: vec![volume_info],
        writeable_entries,
        writeable_shared_infos,
        hash_digests: if layout.has_hash_digests { hash_digests } else { Vec::new() },
        raw: Vec::new(),
    };
    header.layout_tables()?;

    let data_start = u64::from(header.header_size()).next_multiple_of(16);
    for (entry, item) in header.entries.iter_mut().zip(list.enumerate_by_id()) {
        if !item.is_directory() {
            entry.data_offset += data_start;
        }
    }
    if let Some(volume) = header.volume_infos.first_mut() {
        volume.data_offset = u32::try_from(data_start)
            .map_err(|_| Error::invalid_argument("header exceeds 4 GiB"))?;
        volume.size = data_start + payload_size;
    }
    header.update_hash()?;

    let ids: Vec<NefsItemId> = list.enumerate_by_id().map(NefsItem::id).collect();
    for id in ids {
        if let Some(item) = list.get_mut(id) {
            if !item.is_directory() {
                let source = item.data_source().rebased(data_start);
                item.update_data_source(source, NefsItemState::None)?;
            }
        }
    }

    debug!(
        header_size = header.header_size(),
        entries = header.entries.len(),
        blocks = header.blocks.len(),
        "header built"
    );
    Ok(BuiltHeader {
        header,
        items: list,
    })
}

fn check_granularity(size: u32, what: &str) -> Result<()> {
    if size == 0 || size % SIZE_GRANULARITY != 0 {
        return Err(Error::invalid_argument(format!(
            "{what} {size:#x} is not a non-zero multiple of {SIZE_GRANULARITY:#x}"
        )));
    }
    Ok(())
}

/// Items that survive a save, in depth first by id order
pub(crate) fn surviving_items(items: &NefsItemList) -> Result<Vec<&NefsItem>> {
    let mut dropped = HashSet::new();
    let mut survivors = Vec::with_capacity(items.len());

    for item in items.enumerate_depth_first_by_id() {
        let id = item.id();
        let parent_dropped = items
            .get_item_parent_id(id)?
            .is_some_and(|parent| dropped.contains(&parent));
        let primary_dropped = dropped.contains(&items.get_primary_id(id)?);

        if item.state() == NefsItemState::Removed || parent_dropped || primary_dropped {
            dropped.insert(id);
        } else {
            survivors.push(item);
        }
    }

    Ok(survivors)
}

/// The one AES key every encrypted item uses
fn shared_aes_key(survivors: &[&NefsItem], layout: &VersionLayout) -> Result<Option<[u8; 32]>> {
    let mut key = None;
    for transform in survivors.iter().filter_map(|item| item.transform()) {
        let lzss_unsupported = transform.is_lzss_compressed() && layout.flags.lzss == 0;
        if lzss_unsupported {
            return Err(Error::unsupported("this version cannot store LZSS compressed items"));
        }

        let Some(item_key) = transform.aes_key() else {
            continue;
        };
        if layout.flags.aes == 0 {
            return Err(Error::unsupported("this version cannot store encrypted items"));
        }
        match key {
            None => key = Some(*item_key),
            Some(existing) if existing != *item_key => {
                return Err(Error::invalid_argument(
                    "encrypted items must all use the archive's AES key",
                ));
            }
            Some(_) => {}
        }
    }
    Ok(key)
}

/// Copies the survivors into a new list with ids equal to their entry table row
fn compact_items(
    items: &NefsItemList,
    survivors: &[&NefsItem],
    volume_path: &Path,
    block_size: u32,
) -> Result<NefsItemList> {
    let new_ids: HashMap<NefsItemId, NefsItemId> = survivors
        .iter()
        .enumerate()
        .map(|(row, item)| (item.id(), NefsItemId(row as u32)))
        .collect();
    let new_id = |id: NefsItemId| new_ids.get(&id).copied().ok_or(Error::ItemNotFound(id));

    let volume = NefsVolumeLocation::new(volume_path);
    let mut list = NefsItemList::new(volume_path);

    for item in survivors {
        let id = new_id(item.id())?;
        let primary = items.get_primary_id(item.id())?;
        let first_duplicate_id = new_id(primary)?;
        let directory_id = match items.get_item_parent_id(item.id())? {
            Some(parent) => new_id(parent)?,
            None => id,
        };
        let primary_item = items.get(primary).ok_or(Error::ItemNotFound(primary))?;
        let file_name = primary_item.file_name();
        if item.extracted_size() != primary_item.extracted_size() {
            return Err(Error::invalid_argument(format!(
                "duplicate {} of {primary} has a different extracted size",
                item.id()
            )));
        }

        let builder = NefsItem::builder()
            .id(id)
            .first_duplicate_id(first_duplicate_id)
            .directory_id(directory_id)
            .file_name(file_name);

        let stored = if item.is_directory() {
            let attributes = NefsItemAttributes {
                is_cacheable: item.attributes().is_cacheable,
                is_patched: item.attributes().is_patched,
                ..NefsItemAttributes::directory()
            };
            builder.attributes(attributes).build()
        } else {
            let transform = item.transform().map(|t| {
                Arc::new(
                    NefsDataTransform::new(block_size)
                        .with_compression(t.compression())
                        .with_aes_key(t.aes_key().copied()),
                )
            });
            let size = restamp_chunks(item.data_source().size(), transform.as_ref());
            let source = NefsDataSource::Volume(NefsVolumeSource::new(
                volume.clone(),
                item.data_source().offset(),
                size,
            ));
            let attributes = NefsItemAttributes {
                is_cacheable: item.attributes().is_cacheable,
                is_patched: item.attributes().is_patched,
                is_zlib_compressed: transform.as_ref().is_some_and(|t| t.is_zlib_compressed()),
                is_lzss_compressed: transform.as_ref().is_some_and(|t| t.is_lzss_compressed()),
                is_aes_encrypted: transform.as_ref().is_some_and(|t| t.is_encrypted()),
                ..Default::default()
            };

            builder
                .data_source(source)
                .maybe_transform(transform.map(|t| (*t).clone()))
                .attributes(attributes)
                .build()
        };

        list.add(stored)?;
    }

    Ok(list)
}

/// Points every chunk at `transform`, or at a transform of the same chunk size when the chunk
/// was stored differently from the rest of its item
fn restamp_chunks(size: &NefsItemSize, transform: Option<&Arc<NefsDataTransform>>) -> NefsItemSize {
    let Some(transform) = transform else {
        return NefsItemSize::new(size.extracted_size());
    };

    let chunks = size
        .chunks()
        .iter()
        .map(|chunk| {
            let own = chunk.transform();
            let chunk_transform =
                if own.compression() == transform.compression() && own.aes_key() == transform.aes_key() {
                    Arc::clone(transform)
                } else {
                    Arc::new(
                        NefsDataTransform::new(transform.chunk_size())
                            .with_compression(own.compression())
                            .with_aes_key(own.aes_key().copied()),
                    )
                };
            NefsDataChunk::new(
                chunk.size(),
                chunk.cumulative_size(),
                chunk.checksum(),
                chunk_transform,
            )
        })
        .collect();
    NefsItemSize::with_chunks(size.extracted_size(), chunks)
}

/// Sets the duplicated and last sibling flags and drops attributes the revision cannot store
fn derive_attributes(list: &mut NefsItemList, layout: &VersionLayout) -> Result<()> {
    let ids: Vec<NefsItemId> = list.enumerate_by_id().map(NefsItem::id).collect();
    for id in ids {
        let primary = list.get_primary_id(id)?;
        let is_duplicated = primary != id || !list.get_item_duplicates(primary)?.is_empty();
        let is_last_sibling = list.get_item_sibling_id(primary)? == primary;

        if let Some(item) = list.get_mut(id) {
            let attributes = item.attributes_mut();
            attributes.is_duplicated = is_duplicated;
            attributes.is_last_sibling = is_last_sibling;
            *attributes = NefsItemAttributes::from_flags(
                attributes.to_flags(&layout.flags),
                attributes.volume,
                &layout.flags,
            );
        }
    }
    Ok(())
}

/// The next id of the duplicate group, or `id` itself when it is the last
fn next_duplicate(list: &NefsItemList, id: NefsItemId) -> Result<NefsItemId> {
    let primary = list.get_primary_id(id)?;
    let group: Vec<NefsItemId> = std::iter::once(primary)
        .chain(list.get_item_duplicates(primary)?.into_iter().map(NefsItem::id))
        .collect();

    Ok(group
        .iter()
        .position(|member| *member == id)
        .and_then(|position| group.get(position + 1))
        .copied()
        .unwrap_or(id))
}

#[cfg(test)]
mod test {
    use std::{path::Path, sync::Arc};

    use pretty_assertions::assert_eq;

    use crate::error::{Error, Result};
    use crate::header::builder::build_header;
    use crate::header::tables::NO_BLOCK;
    use crate::header::NefsHeader;
    use crate::item::{NefsItem, NefsItemAttributes, NefsItemId, NefsItemList, NefsItemState};
    use crate::read::build_items;
    use crate::source::{NefsDataSource, NefsVolumeLocation, NefsVolumeSource};
    use crate::transform::{NefsCompression, NefsDataChunk, NefsDataTransform, NefsItemSize};
    use crate::version::NefsVersion;

    fn stored(offset: u64, size: NefsItemSize) -> NefsDataSource {
        NefsDataSource::Volume(NefsVolumeSource::new(
            NefsVolumeLocation::new("game.nefs"),
            offset,
            size,
        ))
    }

    fn chunked(transform: &NefsDataTransform) -> NefsItemSize {
        let chunks = NefsDataChunk::create_chunk_list_with_checksums(
            &[(0x20, 0xAAAA), (0x38, 0xBBBB)],
            &Arc::new(transform.clone()),
        );
        NefsItemSize::with_chunks(0x10005, chunks)
    }

    /// textures/ (0), textures/b.bin (1), textures/a.txt (2), duplicate of b.bin (3), readme (4)
    fn sample_items(transform: &NefsDataTransform) -> Result<NefsItemList> {
        let mut items = NefsItemList::new("game.nefs");
        items.add(
            NefsItem::builder()
                .id(NefsItemId(0))
                .file_name("textures")
                .attributes(NefsItemAttributes::directory())
                .build(),
        )?;
        items.add(
            NefsItem::builder()
                .id(NefsItemId(1))
                .directory_id(NefsItemId(0))
                .file_name("b.bin")
                .data_source(stored(0, chunked(transform)))
                .transform(transform.clone())
                .build(),
        )?;
        items.add(
            NefsItem::builder()
                .id(NefsItemId(2))
                .directory_id(NefsItemId(0))
                .file_name("a.txt")
                .data_source(stored(0x38, NefsItemSize::new(5)))
                .build(),
        )?;
        items.add(
            NefsItem::builder()
                .id(NefsItemId(3))
                .first_duplicate_id(NefsItemId(1))
                .directory_id(NefsItemId(0))
                .file_name("b.bin")
                .data_source(stored(0x3D, chunked(transform)))
                .transform(transform.clone())
                .build(),
        )?;
        items.add(
            NefsItem::builder()
                .id(NefsItemId(4))
                .file_name("readme")
                .data_source(stored(0x75, NefsItemSize::new(0)))
                .build(),
        )?;
        Ok(items)
    }

    #[test]
    fn built_headers_read_back_for_every_version() -> Result<()> {
        for version in NefsVersion::ALL {
            let transform = NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib);
            let items = sample_items(&transform)?;
            let built = build_header()
                .version(version)
                .items(&items)
                .volume_path(Path::new("game.nefs"))
                .payload_size(0x75)
                .call()?;

            let bytes = built.header.to_bytes()?;
            let parsed = NefsHeader::read(&bytes)?;
            parsed.verify_hash()?;
            assert_eq!(parsed.version(), version);
            assert_eq!(parsed.to_bytes()?, bytes);

            let read = build_items(&parsed, Path::new("game.nefs"));
            assert_eq!(read.len(), 5, "{version}");
            // depth first by id: the duplicate moves right behind its primary
            assert_eq!(read.get_item_file_path(NefsItemId(3))?, "textures/a.txt");
            assert_eq!(read.get_primary_id(NefsItemId(2))?, NefsItemId(1));
            assert_eq!(read.get_item_file_path(NefsItemId(4))?, "readme");

            let data_start = parsed.data_start();
            assert_eq!(data_start % 16, 0);
            let a_txt = read.get(NefsItemId(3)).ok_or(Error::ItemNotFound(NefsItemId(3)))?;
            assert_eq!(a_txt.data_source().offset(), data_start + 0x38);
            assert_eq!(a_txt.extracted_size(), 5);

            let b_bin = read.get(NefsItemId(1)).ok_or(Error::ItemNotFound(NefsItemId(1)))?;
            let marks: Vec<u32> = b_bin
                .data_source()
                .size()
                .chunks()
                .iter()
                .map(NefsDataChunk::cumulative_size)
                .collect();
            assert_eq!(marks, vec![0x20, 0x38]);
            assert_eq!(b_bin.transform().map(NefsDataTransform::compression), Some(NefsCompression::Zlib));

            assert_eq!(parsed.volumes()[0].name, "game.nefs");
            assert_eq!(parsed.volumes()[0].size, data_start + 0x75);
        }
        Ok(())
    }

    #[test]
    fn block_index_sentinels() -> Result<()> {
        let transform = NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib);
        let items = sample_items(&transform)?;
        let built = build_header()
            .version(NefsVersion::V160)
            .items(&items)
            .volume_path(Path::new("game.nefs"))
            .call()?;

        let first_blocks: Vec<u32> = built
            .header
            .entries()
            .iter()
            .map(|entry| entry.first_block)
            .collect();
        assert_eq!(first_blocks, vec![0, 0, 2, NO_BLOCK, NO_BLOCK]);

        let checksums: Vec<u16> = built.header.blocks().iter().map(|block| block.checksum).collect();
        assert_eq!(checksums, vec![0xAAAA, 0xBBBB, 0xAAAA, 0xBBBB]);
        Ok(())
    }

    #[test]
    fn writeable_shared_infos_follow_the_tree() -> Result<()> {
        let transform = NefsDataTransform::new(0x10000);
        let items = sample_items(&transform)?;
        let built = build_header()
            .version(NefsVersion::V200)
            .items(&items)
            .volume_path(Path::new("game.nefs"))
            .call()?;

        let rows: Vec<(u32, u32, u32)> = built
            .header
            .writeable_shared_infos()
            .iter()
            .map(|row| (row.id, row.sibling_id, row.patch_id))
            .collect();
        assert_eq!(rows, vec![(0, 4, 0), (1, 3, 2), (3, 3, 3), (4, 4, 4)]);

        // shared infos are ordered by name: readme, textures, a.txt, b.bin
        let owners: Vec<u32> = built
            .header
            .shared_infos()
            .iter()
            .map(|row| row.first_duplicate_id)
            .collect();
        assert_eq!(owners, vec![4, 0, 3, 1]);

        let last_siblings: Vec<bool> = built
            .items
            .enumerate_by_id()
            .map(|item| item.attributes().is_last_sibling)
            .collect();
        assert_eq!(last_siblings, vec![false, false, false, true, true]);
        Ok(())
    }

    #[test]
    fn removed_items_are_compacted_away() -> Result<()> {
        let transform = NefsDataTransform::new(0x10000);
        let mut items = sample_items(&transform)?;
        if let Some(textures) = items.get_mut(NefsItemId(0)) {
            textures.update_state(NefsItemState::Removed);
        }

        let built = build_header()
            .version(NefsVersion::V150)
            .items(&items)
            .volume_path(Path::new("game.nefs"))
            .call()?;

        assert_eq!(built.header.entries().len(), 1);
        assert_eq!(built.items.len(), 1);
        assert_eq!(built.items.get_item_file_path(NefsItemId(0))?, "readme");
        Ok(())
    }

    #[test]
    fn rejects_unstorable_encryption() -> Result<()> {
        let encrypted = NefsDataTransform::new(0x10000).with_aes_key(Some([1; 32]));
        let items = sample_items(&encrypted)?;

        let old = build_header()
            .version(NefsVersion::V010)
            .items(&items)
            .volume_path(Path::new("game.nefs"))
            .call();
        assert!(matches!(old, Err(Error::UnsupportedOperation(_))));

        // the duplicate uses a different key than its primary
        let other = NefsDataTransform::new(0x10000).with_aes_key(Some([2; 32]));
        let mut mixed = NefsItemList::new("game.nefs");
        for item in items.enumerate_by_id() {
            let transform = if item.id() == NefsItemId(3) {
                Some(other.clone())
            } else {
                item.transform().cloned()
            };
            mixed.add(
                NefsItem::builder()
                    .id(item.id())
                    .first_duplicate_id(item.first_duplicate_id())
                    .directory_id(item.directory_id())
                    .file_name(item.file_name())
                    .data_source(item.data_source().clone())
                    .maybe_transform(transform)
                    .attributes(*item.attributes())
                    .build(),
            )?;
        }
        let result = build_header()
            .version(NefsVersion::V160)
            .items(&mixed)
            .volume_path(Path::new("game.nefs"))
            .call();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn rejects_unaligned_block_size() -> Result<()> {
        let items = sample_items(&NefsDataTransform::new(0x10000))?;
        let result = build_header()
            .version(NefsVersion::V200)
            .items(&items)
            .volume_path(Path::new("game.nefs"))
            .block_size(0x1234)
            .call();

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        Ok(())
    }
}

mod common;

use std::{fs, path::Path, sync::Arc};

use miette::{IntoDiagnostic, Result};
use nefs::{
    compression::{chunk_checksum, NefsTransformer, StandardTransformer},
    error::Error,
    header::builder::build_header,
    item::{NefsItem, NefsItemId, NefsItemList, NefsItemState},
    progress::NefsProgress,
    read::{HashPolicy, NefsReader, NefsReaderOptions},
    source::{NefsDataSource, NefsVolumeLocation, NefsVolumeSource},
    transform::{NefsCompression, NefsDataChunk, NefsDataTransform, NefsItemSize},
    write::NefsWriterOptions,
    NefsArchive, NefsHeader, NefsVersion,
};
use pretty_assertions::assert_eq;
use tracing::info;
use tracing_test::traced_test;

use common::{expected_files, read_tree, sample_archive, sample_bytes};

fn reader(policy: HashPolicy) -> NefsReader {
    NefsReader::new(NefsReaderOptions::builder().hash_policy(policy).build())
}

/// Saves the sample archive without transforms and returns its path
fn saved_sample(dir: &Path, version: NefsVersion) -> Result<std::path::PathBuf> {
    let path = dir.join("game.nefs");
    sample_archive(dir, version, None)?.save(
        &path,
        NefsWriterOptions::default(),
        &NefsProgress::new(),
    )?;
    Ok(path)
}

#[test]
fn item_tree_matches_the_saved_layout() -> Result<()> {
    let dir = tempfile::tempdir().into_diagnostic()?;
    let path = saved_sample(dir.path(), NefsVersion::V200)?;

    let archive = NefsArchive::open(&path)?;
    let items = archive.items();

    let paths = items
        .enumerate_depth_first_by_id()
        .into_iter()
        .map(|item| items.get_item_file_path(item.id()))
        .collect::<nefs::error::Result<Vec<_>>>()?;
    assert_eq!(
        paths,
        vec!["data", "data/big.bin", "data/small.txt", "data/small.txt", "readme.txt"]
    );

    assert_eq!(items.get_item_first_child_id(NefsItemId(0))?, NefsItemId(1));
    assert_eq!(items.get_item_sibling_id(NefsItemId(0))?, NefsItemId(4));
    assert_eq!(items.get_item_sibling_id(NefsItemId(1))?, NefsItemId(2));
    assert_eq!(items.get_item_sibling_id(NefsItemId(2))?, NefsItemId(2));
    assert_eq!(items.get_item_duplicates(NefsItemId(2))?.len(), 1);
    assert_eq!(items.roots().len(), 2);

    let small = items
        .get(NefsItemId(2))
        .ok_or(Error::ItemNotFound(NefsItemId(2)))?;
    assert!(small.attributes().is_duplicated);
    assert!(small.attributes().is_last_sibling);
    assert!(small.data_source().size().chunks().is_empty());
    Ok(())
}

#[traced_test]
#[test]
fn hash_policy_decides_on_tampered_headers() -> Result<()> {
    let dir = tempfile::tempdir().into_diagnostic()?;
    let path = saved_sample(dir.path(), NefsVersion::V160)?;

    // user value of 1.6.0
    let mut bytes = fs::read(&path).into_diagnostic()?;
    bytes[0x70] ^= 0x5A;
    fs::write(&path, bytes).into_diagnostic()?;

    let strict = reader(HashPolicy::Strict).read(&path, &NefsProgress::new());
    assert!(matches!(strict, Err(Error::HashMismatch { .. })));

    let lenient = reader(HashPolicy::Warn).read(&path, &NefsProgress::new())?;
    assert_eq!(lenient.items().len(), 5);
    assert!(logs_contain("header hash does not match"));

    reader(HashPolicy::Ignore).read(&path, &NefsProgress::new())?;
    Ok(())
}

#[test]
fn rejects_files_that_are_not_archives() -> Result<()> {
    let dir = tempfile::tempdir().into_diagnostic()?;
    let path = dir.path().join("not-an-archive.bin");
    fs::write(&path, b"PK\x03\x04 definitely a zip").into_diagnostic()?;

    assert!(matches!(NefsArchive::open(&path), Err(Error::InvalidArchive)));
    Ok(())
}

#[test]
fn header_round_trips_byte_for_byte() -> Result<()> {
    for version in NefsVersion::ALL {
        let dir = tempfile::tempdir().into_diagnostic()?;
        let path = saved_sample(dir.path(), version)?;
        let bytes = fs::read(&path).into_diagnostic()?;

        let header = NefsHeader::read(&bytes)?;
        let serialized = header.to_bytes()?;
        assert_eq!(serialized.len(), header.header_size() as usize);
        assert!(serialized[..] == bytes[..serialized.len()], "{version}");
    }
    Ok(())
}

#[traced_test]
#[test]
fn reads_across_split_volumes() -> Result<()> {
    let dir = tempfile::tempdir().into_diagnostic()?;
    let path = saved_sample(dir.path(), NefsVersion::V160)?;
    let mut bytes = fs::read(&path).into_diagnostic()?;

    // split size of 1.6.0, stored >> 15
    let split_size = 0x8000usize;
    bytes[0xA8..0xAC].copy_from_slice(&1u32.to_le_bytes());

    let parts = dir.path().join("split");
    fs::create_dir_all(&parts).into_diagnostic()?;
    for (index, part) in bytes.chunks(split_size).enumerate() {
        fs::write(parts.join(format!("game.nefs.{index:03}")), part).into_diagnostic()?;
    }
    info!("split into {} parts", bytes.len().div_ceil(split_size));

    let archive =
        reader(HashPolicy::Ignore).read(parts.join("game.nefs.000"), &NefsProgress::new())?;
    assert_eq!(archive.header().split_size(), 0x8000);

    let mut big = Vec::new();
    archive.extract_item(NefsItemId(1), &mut big)?;
    assert_eq!(big, sample_bytes(0x18000, 3));

    let out = dir.path().join("out");
    let summary = archive.extract_all(&out, &NefsProgress::new())?;
    assert!(summary.failed.is_empty());
    assert_eq!(read_tree(&out)?, expected_files());
    Ok(())
}

#[traced_test]
#[test]
fn missing_volume_fails_only_its_items() -> Result<()> {
    let dir = tempfile::tempdir().into_diagnostic()?;
    let path = saved_sample(dir.path(), NefsVersion::V150)?;
    let archive = NefsArchive::open(&path)?;
    fs::remove_file(&path).into_diagnostic()?;

    let summary = archive.extract_all(dir.path().join("out"), &NefsProgress::new())?;
    assert_eq!(summary.directories, 1);
    // the empty readme needs no volume bytes
    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.failed, vec![NefsItemId(1), NefsItemId(2), NefsItemId(3)]);
    assert!(logs_contain("failed to extract item"));
    Ok(())
}

#[test]
fn chunks_keep_their_own_transform() -> Result<()> {
    let dir = tempfile::tempdir().into_diagnostic()?;
    let path = dir.path().join("mixed.nefs");
    let raw = sample_bytes(0x18000, 3);

    // first chunk deflated, second stored as is
    let zlib = Arc::new(NefsDataTransform::new(0x10000).with_compression(NefsCompression::Zlib));
    let plain = Arc::new(NefsDataTransform::new(0x10000));
    let first = StandardTransformer::default().compress(NefsCompression::Zlib, &raw[..0x10000])?;
    let tail = &raw[0x10000..];
    let mut payload = first.clone();
    payload.extend_from_slice(tail);

    let first_end = first.len() as u32;
    let second_end = payload.len() as u32;
    let chunks = vec![
        NefsDataChunk::new(first_end, first_end, chunk_checksum(&first), zlib.clone()),
        NefsDataChunk::new(second_end - first_end, second_end, chunk_checksum(tail), plain),
    ];
    let size = NefsItemSize::with_chunks(raw.len() as u64, chunks);

    let mut items = NefsItemList::new(&path);
    items.add(
        NefsItem::builder()
            .id(NefsItemId(0))
            .first_duplicate_id(NefsItemId(0))
            .file_name("mixed.bin")
            .data_source(NefsDataSource::Volume(NefsVolumeSource::new(
                NefsVolumeLocation::new(&path),
                0,
                size,
            )))
            .transform(zlib.as_ref().clone())
            .state(NefsItemState::None)
            .build(),
    )?;

    let built = build_header()
        .version(NefsVersion::V160)
        .items(&items)
        .volume_path(&path)
        .payload_size(payload.len() as u64)
        .call()?;
    let kinds = built.header.blocks().iter().map(|row| row.transform).collect::<Vec<_>>();
    assert_eq!(kinds, vec![0x1, 0x0]);

    let mut bytes = built.header.to_bytes()?;
    bytes.resize(built.header.data_start() as usize, 0);
    bytes.extend_from_slice(&payload);
    fs::write(&path, bytes).into_diagnostic()?;

    let archive = reader(HashPolicy::Ignore).read(&path, &NefsProgress::new())?;
    let item = archive
        .items()
        .get(NefsItemId(0))
        .ok_or(Error::ItemNotFound(NefsItemId(0)))?;
    let read_chunks = item.data_source().size().chunks();
    assert_eq!(read_chunks[0].transform().compression(), NefsCompression::Zlib);
    assert_eq!(read_chunks[1].transform().compression(), NefsCompression::None);

    let mut extracted = Vec::new();
    archive.extract_item(NefsItemId(0), &mut extracted)?;
    assert!(extracted == raw);

    // saving re-deflates the stored chunk
    let resaved = dir.path().join("resaved.nefs");
    archive.save(&resaved, NefsWriterOptions::default(), &NefsProgress::new())?;
    let reopened = reader(HashPolicy::Ignore).read(&resaved, &NefsProgress::new())?;
    let kinds = reopened.header().blocks().iter().map(|row| row.transform).collect::<Vec<_>>();
    assert_eq!(kinds, vec![0x1, 0x1]);

    let mut extracted = Vec::new();
    reopened.extract_item(NefsItemId(0), &mut extracted)?;
    assert!(extracted == raw);
    Ok(())
}

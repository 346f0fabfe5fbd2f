#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use nefs::{
    error::Result,
    item::{NefsItem, NefsItemAttributes, NefsItemId, NefsItemState},
    source::{NefsDataSource, NefsFileSource},
    transform::NefsDataTransform,
    NefsArchive, NefsVersion,
};

pub const KEY: [u8; 32] = *b"0123456789abcdef0123456789ABCDEF";

/// Bytes that compress well but are not all alike
pub fn sample_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| ((i / 7) as u8).wrapping_add(seed)).collect()
}

/// Contents every sample archive extracts to, keyed by archive path
///
/// `data/small.txt` is duplicated with same sized contents; the later duplicate wins when
/// extracting.
pub fn expected_files() -> BTreeMap<String, Vec<u8>> {
    BTreeMap::from([
        ("data/big.bin".to_owned(), sample_bytes(0x18000, 3)),
        ("data/small.txt".to_owned(), b"HELLO NEFS".to_vec()),
        ("readme.txt".to_owned(), Vec::new()),
    ])
}

/// Builds an unsaved archive in `dir`:
///
/// ```text
/// 0 data/
/// 1 data/big.bin
/// 2 data/small.txt
/// 3 data/small.txt (duplicate of 2)
/// 4 readme.txt
/// ```
pub fn sample_archive(
    dir: &Path,
    version: NefsVersion,
    transform: Option<NefsDataTransform>,
) -> Result<NefsArchive> {
    let sources = dir.join("sources");
    fs::create_dir_all(&sources)?;

    let mut archive = NefsArchive::create(dir.join("game.nefs"), version)?;
    let items = archive.items_mut();

    items.add(
        NefsItem::builder()
            .id(NefsItemId(0))
            .file_name("data")
            .attributes(NefsItemAttributes::directory())
            .state(NefsItemState::Added)
            .build(),
    )?;

    let files: [(u32, u32, Option<u32>, &str, Vec<u8>); 4] = [
        (1, 1, Some(0), "big.bin", sample_bytes(0x18000, 3)),
        (2, 2, Some(0), "small.txt", b"hello nefs".to_vec()),
        (3, 2, Some(0), "small.txt", b"HELLO NEFS".to_vec()),
        (4, 4, None, "readme.txt", Vec::new()),
    ];
    for (id, first_duplicate, parent, name, bytes) in files {
        let path = sources.join(format!("{id}-{name}"));
        fs::write(&path, bytes)?;

        items.add(
            NefsItem::builder()
                .id(NefsItemId(id))
                .first_duplicate_id(NefsItemId(first_duplicate))
                .maybe_directory_id(parent.map(NefsItemId))
                .file_name(name)
                .data_source(NefsDataSource::File(NefsFileSource::from_file(path)?))
                .maybe_transform(transform.clone())
                .state(NefsItemState::Added)
                .build(),
        )?;
    }

    Ok(archive)
}

/// Reads every file below `dir`, keyed by its path relative to `dir` with `/` separators
pub fn read_tree(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let relative: PathBuf = entry
            .path()
            .strip_prefix(dir)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.insert(key, fs::read(entry.path())?);
    }
    Ok(files)
}

use clap::{Args, ValueEnum};
use miette::{miette, Context, IntoDiagnostic, Result};
use nefs::{
    item::{NefsItem, NefsItemAttributes, NefsItemState},
    source::{NefsDataSource, NefsFileSource},
    transform::{NefsCompression, NefsDataTransform},
    write::NefsWriterOptions,
    NefsArchive, NefsItemId, NefsVersion,
};
use std::{collections::HashMap, path::PathBuf};
use tracing::info;
use walkdir::WalkDir;

use super::logged_progress;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Compression {
    None,
    #[default]
    Zlib,
    Lzss,
}

impl From<Compression> for NefsCompression {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => NefsCompression::None,
            Compression::Zlib => NefsCompression::Zlib,
            Compression::Lzss => NefsCompression::Lzss,
        }
    }
}

#[derive(Args)]
pub struct CreateArgs {
    /// An input directory
    #[arg(short, long, value_name = "DIR")]
    directory: PathBuf,

    /// A target NeFS archive
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// Header version to write, such as 1.6.0 or 200
    #[arg(long = "nefs-version", value_name = "VERSION", default_value = "2.0.0")]
    version: NefsVersion,

    /// Compression of every file
    #[arg(short, long, value_enum, default_value_t)]
    compression: Compression,

    /// Chunk size, a multiple of 0x8000
    #[arg(long, value_parser = parse_size)]
    block_size: Option<u32>,

    /// Encrypt every file with this AES-256 key, given as 64 hex characters
    #[arg(long, value_name = "HEX", value_parser = parse_key)]
    aes_key: Option<[u8; 32]>,

    /// Allow overwriting the target
    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

impl CreateArgs {
    pub fn handle(&self) -> Result<()> {
        info!("creating {}", self.file.display());

        let entries = WalkDir::new(&self.directory)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .collect::<Vec<_>>();

        if entries.is_empty() {
            return Err(miette!("directory is empty"));
        }
        if !self.overwrite && self.file.exists() {
            return Err(miette!(
                "{} already exists, pass --overwrite to replace it",
                self.file.display()
            ));
        }

        let block_size = self.block_size.unwrap_or(0x10000);
        let transform = (self.compression != Compression::None || self.aes_key.is_some())
            .then(|| {
                NefsDataTransform::new(block_size)
                    .with_compression(self.compression.into())
                    .with_aes_key(self.aes_key)
            });

        let mut archive = NefsArchive::create(&self.file, self.version)?;
        let mut ids: HashMap<PathBuf, NefsItemId> = HashMap::new();

        for (index, entry) in entries.iter().enumerate() {
            let id = NefsItemId(u32::try_from(index).into_diagnostic()?);
            let relative = entry
                .path()
                .strip_prefix(&self.directory)
                .into_diagnostic()?;
            let name = entry
                .file_name()
                .to_str()
                .ok_or(miette!("unable to convert {} to a string", relative.display()))?;
            let parent = relative.parent().and_then(|p| ids.get(p)).copied();

            let builder = NefsItem::builder()
                .id(id)
                .file_name(name)
                .maybe_directory_id(parent)
                .state(NefsItemState::Added);

            let item = if entry.file_type().is_dir() {
                builder.attributes(NefsItemAttributes::directory()).build()
            } else {
                info!("adding {}", relative.display());
                let source = NefsFileSource::from_file(entry.path())
                    .context(format!("opening {}", entry.path().display()))?;
                builder
                    .data_source(NefsDataSource::File(source))
                    .maybe_transform(transform.clone())
                    .build()
            };

            ids.insert(relative.to_path_buf(), id);
            archive.items_mut().add(item)?;
        }

        let options = NefsWriterOptions::builder()
            .maybe_block_size(self.block_size)
            .build();
        archive
            .save(&self.file, options, &logged_progress())
            .context(format!("writing {}", self.file.display()))?;

        Ok(())
    }
}

fn parse_size(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|err| format!("invalid size '{s}': {err}"))
}

fn parse_key(s: &str) -> std::result::Result<[u8; 32], String> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(s, &mut key).map_err(|err| format!("invalid aes key: {err}"))?;
    Ok(key)
}

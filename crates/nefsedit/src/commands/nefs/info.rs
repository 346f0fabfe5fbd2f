use clap::Args;
use miette::{Context, Result};
use nefs::{
    progress::NefsProgress,
    read::{HashPolicy, NefsReader, NefsReaderOptions},
    NefsItem,
};
use owo_colors::OwoColorize;
use std::path::PathBuf;

#[derive(Args)]
pub struct InfoArgs {
    /// An input NeFS archive
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// List every item
    #[arg(short, long, default_value_t = false)]
    items: bool,

    /// Fail when the header hash does not match
    #[arg(long, default_value_t = false)]
    strict: bool,
}

impl InfoArgs {
    pub fn handle(&self) -> Result<()> {
        let policy = if self.strict {
            HashPolicy::Strict
        } else {
            HashPolicy::Ignore
        };
        let archive = NefsReader::new(NefsReaderOptions::builder().hash_policy(policy).build())
            .read(&self.file, &NefsProgress::new())
            .context(format!("reading {}", self.file.display()))?;
        let header = archive.header();

        let hash = hex::encode(header.hash());
        let hash_state = match header.verify_hash() {
            Ok(()) => "ok".green().to_string(),
            Err(_) => "mismatch".red().to_string(),
        };

        println!("{:<16} {}", "version".bold(), header.version());
        println!("{:<16} {:#x}", "header size".bold(), header.header_size());
        println!("{:<16} {hash} ({hash_state})", "hash".bold());
        println!("{:<16} {}", "encrypted".bold(), header.is_encrypted());
        println!("{:<16} {}", "items".bold(), archive.items().len());
        println!("{:<16} {:#x}", "block size".bold(), header.block_size());
        if header.split_size() != 0 {
            println!("{:<16} {:#x}", "split size".bold(), header.split_size());
        }
        if header.hash_block_size() != 0 {
            println!("{:<16} {:#x}", "hash block size".bold(), header.hash_block_size());
        }
        if let Some(key) = header.aes_key() {
            println!("{:<16} {}", "aes key".bold(), hex::encode(key));
        }
        for (index, volume) in header.volumes().iter().enumerate() {
            println!(
                "{:<16} {} ({:#x} bytes, data at {:#x})",
                format!("volume {index}").bold(),
                volume.name,
                volume.size,
                volume.data_offset
            );
        }

        if self.items {
            println!();
            println!(
                "{:>6} {:>12} {:>12} {:<5} {}",
                "id".bold(),
                "size".bold(),
                "stored".bold(),
                "flags".bold(),
                "path".bold()
            );

            let items = archive.items();
            for item in items.enumerate_depth_first_by_id() {
                let path = items.get_item_file_path(item.id())?;
                let path = if item.is_directory() {
                    format!("{path}/").blue().to_string()
                } else if item.is_duplicate() {
                    path.yellow().to_string()
                } else {
                    path
                };

                println!(
                    "{:>6} {:>12} {:>12} {:<5} {path}",
                    item.id(),
                    item.extracted_size(),
                    item.transformed_size(),
                    flags(item),
                );
            }
        }

        Ok(())
    }
}

/// One letter per attribute: directory, zlib, lzss, aes, duplicated
fn flags(item: &NefsItem) -> String {
    let attributes = item.attributes();
    [
        (attributes.is_directory, 'd'),
        (attributes.is_zlib_compressed, 'z'),
        (attributes.is_lzss_compressed, 'l'),
        (attributes.is_aes_encrypted, 'a'),
        (attributes.is_duplicated, 'p'),
    ]
    .into_iter()
    .map(|(set, letter)| if set { letter } else { '-' })
    .collect()
}

use clap::Args;
use miette::{miette, Context, IntoDiagnostic, Result};
use nefs::{
    read::{HashPolicy, NefsReader, NefsReaderOptions},
    NefsArchive,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};
use tracing::info;

use super::{find_item, logged_progress};

#[derive(Args)]
pub struct ExtractArgs {
    /// An input NeFS archive
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// A target directory
    #[arg(short, long, value_name = "DIR")]
    directory: PathBuf,

    /// Only extract the item stored under this archive path
    #[arg(short, long, value_name = "PATH")]
    item: Option<String>,

    /// Allow overwriting the target
    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

impl ExtractArgs {
    pub fn handle(&self) -> Result<()> {
        if !self.overwrite && self.directory.read_dir().is_ok_and(|mut d| d.next().is_some()) {
            return Err(miette!(
                "{} is not empty, pass --overwrite to extract anyway",
                self.directory.display()
            ));
        }

        let archive = NefsReader::new(
            NefsReaderOptions::builder()
                .hash_policy(HashPolicy::Warn)
                .build(),
        )
        .read(&self.file, &logged_progress())
        .context(format!("reading {}", self.file.display()))?;

        match &self.item {
            Some(path) => self.extract_one(&archive, path),
            None => self.extract_all(&archive),
        }
    }

    fn extract_one(&self, archive: &NefsArchive, path: &str) -> Result<()> {
        let id = find_item(archive.items(), path).ok_or(miette!("no item named {path}"))?;
        let target = self.directory.join(path.trim_matches('/'));
        info!("writing {}", target.display());

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .into_diagnostic()
                .context(format!("creating {}", parent.display()))?;
        }
        let mut out = BufWriter::new(
            File::create(&target)
                .into_diagnostic()
                .context(format!("creating {}", target.display()))?,
        );
        let written = archive
            .extract_item(id, &mut out)
            .context(format!("extracting {path}"))?;
        out.flush().into_diagnostic()?;
        info!("wrote {written} bytes");
        Ok(())
    }

    fn extract_all(&self, archive: &NefsArchive) -> Result<()> {
        let summary = archive
            .extract_all(&self.directory, &logged_progress())
            .context(format!("extracting into {}", self.directory.display()))?;

        info!(
            "extracted {} files and {} directories",
            summary.extracted, summary.directories
        );
        if !summary.failed.is_empty() {
            return Err(miette!("{} items could not be extracted", summary.failed.len()));
        }
        Ok(())
    }
}

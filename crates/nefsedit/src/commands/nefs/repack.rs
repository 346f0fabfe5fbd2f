use clap::Args;
use miette::{miette, Context, Result};
use nefs::{
    item::NefsItemState,
    source::{NefsDataSource, NefsFileSource},
    write::NefsWriterOptions,
    NefsArchive, NefsVersion,
};
use std::path::PathBuf;
use tracing::info;

use super::{find_item, logged_progress};

#[derive(Args)]
pub struct RepackArgs {
    /// An input NeFS archive
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// A target NeFS archive, the input when omitted
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Convert to another header version
    #[arg(long = "nefs-version", value_name = "VERSION")]
    version: Option<NefsVersion>,

    /// Replace the bytes of an item, as ARCHIVE_PATH=FILE
    #[arg(long, value_name = "ARCHIVE_PATH=FILE", value_parser = parse_replacement)]
    replace: Vec<(String, PathBuf)>,

    /// Drop an item and everything below it
    #[arg(long, value_name = "ARCHIVE_PATH")]
    remove: Vec<String>,
}

impl RepackArgs {
    pub fn handle(&self) -> Result<()> {
        let mut archive = NefsArchive::open(&self.file)
            .context(format!("reading {}", self.file.display()))?;

        for (path, file) in &self.replace {
            let id = find_item(archive.items(), path).ok_or(miette!("no item named {path}"))?;
            let source = NefsFileSource::from_file(file)
                .context(format!("opening {}", file.display()))?;
            info!("replacing {path} with {}", file.display());

            archive
                .items_mut()
                .get_mut(id)
                .ok_or(miette!("no item named {path}"))?
                .update_data_source(NefsDataSource::File(source), NefsItemState::Replaced)?;
        }

        for path in &self.remove {
            let id = find_item(archive.items(), path).ok_or(miette!("no item named {path}"))?;
            info!("removing {path}");
            archive
                .items_mut()
                .get_mut(id)
                .ok_or(miette!("no item named {path}"))?
                .update_state(NefsItemState::Removed);
        }

        let output = self.output.as_ref().unwrap_or(&self.file);
        let options = NefsWriterOptions::builder()
            .maybe_version(self.version)
            .build();
        let saved = archive
            .save(output, options, &logged_progress())
            .context(format!("writing {}", output.display()))?;

        info!(
            "wrote {} items as {} to {}",
            saved.items().len(),
            saved.header().version(),
            output.display()
        );
        Ok(())
    }
}

fn parse_replacement(s: &str) -> std::result::Result<(String, PathBuf), String> {
    let (path, file) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ARCHIVE_PATH=FILE, got '{s}'"))?;
    Ok((path.to_owned(), PathBuf::from(file)))
}

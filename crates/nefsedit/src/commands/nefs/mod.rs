use nefs::{item::NefsItemList, progress::NefsProgress, NefsItemId};
use tracing::debug;

pub mod create;
pub mod extract;
pub mod info;
pub mod repack;

#[derive(clap::Subcommand)]
pub enum NefsCommands {
    /// Print the header and items of a NeFS archive
    Info(info::InfoArgs),
    /// Extract a NeFS archive into a directory
    Extract(extract::ExtractArgs),
    /// Create a NeFS archive from a directory
    Create(create::CreateArgs),
    /// Rewrite a NeFS archive, replacing or removing items on the way
    Repack(repack::RepackArgs),
}

impl NefsCommands {
    pub fn handle(&self) -> miette::Result<()> {
        match self {
            NefsCommands::Info(info) => info.handle(),
            NefsCommands::Extract(extract) => extract.handle(),
            NefsCommands::Create(create) => create.handle(),
            NefsCommands::Repack(repack) => repack.handle(),
        }
    }
}

/// Progress reporting each task change to the debug log
fn logged_progress() -> NefsProgress {
    NefsProgress::new().on_progress(|info| {
        debug!(
            "{:>5.1}% {} {}",
            info.percent * 100.0,
            info.message,
            info.sub_message
        );
    })
}

/// Id of the item stored under `path`, the last duplicate when several are
fn find_item(items: &NefsItemList, path: &str) -> Option<NefsItemId> {
    let path = path.trim_matches('/');
    items
        .enumerate_by_id()
        .filter(|item| {
            items
                .get_item_file_path(item.id())
                .is_ok_and(|item_path| item_path.eq_ignore_ascii_case(path))
        })
        .map(|item| item.id())
        .last()
}

pub mod nefs;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Handle NeFS archives
    Nefs {
        #[command(subcommand)]
        command: nefs::NefsCommands,
    },
}

impl Commands {
    pub fn handle(&self) -> miette::Result<()> {
        match self {
            Commands::Nefs { command } => command.handle(),
        }
    }
}

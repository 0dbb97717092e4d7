use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "multilinkd",
    version,
    about = "Multilink bundling daemon: splits packets across several links and reassembles them"
)]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Run,

    /// Write a default config file (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config file path
    PrintConfigPath,
}

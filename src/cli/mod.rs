// src/cli/mod.rs — CLI definition (clap derive)

pub mod run;
pub mod status;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "plugbox",
    about = "Run untrusted chat plugins in a capability sandbox",
    version
)]
pub struct Cli {
    /// Plugin descriptor URL or local script path (repeatable; added after configured plugins)
    #[arg(short, long = "plugin")]
    pub plugins: Vec<String>,

    /// Ignore plugins listed in the config file
    #[arg(long)]
    pub only: bool,

    /// Config file path
    #[arg(long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Trial-parse plugin scripts without running them
    Check {
        /// Local script files
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Pass a message (JSON) through the receive chain
    Receive {
        /// Message as JSON
        message: String,
    },
    /// Pass a message (JSON) through the send chain
    Send {
        /// Message as JSON
        message: String,
    },
    /// Run a plugin command
    Command {
        /// Command name
        name: String,
        /// Arguments, each parsed as JSON (bare words are taken as strings)
        args: Vec<String>,
    },
    /// Render a plugin app
    App {
        /// App name
        name: String,
    },
    /// Build the sandbox and show what loaded
    Status {
        /// Also list registered hooks
        #[arg(long)]
        verbose: bool,
    },
}

// src/main.rs — plugbox entry point

use clap::Parser;

use plugbox::cli::run::{build_host, plugin_set, run_hook, HookCall};
use plugbox::cli::status;
use plugbox::cli::{Cli, Commands};
use plugbox::infra::config::Config;
use plugbox::infra::logger;

#[tokio::main]
async fn main() {
    // Initialize logging (respects RUST_LOG)
    logger::init_logging("warn");

    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config (falls back to defaults if no config.toml)
    let config = if let Some(ref path) = cli.config {
        Config::load_from(std::path::Path::new(path))?
    } else {
        Config::load()?
    };

    // Checking scripts needs no sandbox
    if let Commands::Check { files } = &cli.command {
        return status::check_scripts(files, &config.sandbox).await;
    }

    let urls = plugin_set(&config, &cli.plugins, cli.only);
    let host = build_host(&config, &urls).await?;

    let result = match cli.command {
        Commands::Status { verbose } => status::show_status(&host, &urls, verbose),
        Commands::Receive { message } => run_hook(&host, HookCall::Receive(message)).await,
        Commands::Send { message } => run_hook(&host, HookCall::Send(message)).await,
        Commands::Command { name, args } => {
            run_hook(&host, HookCall::Command { name, args }).await
        }
        Commands::App { name } => run_hook(&host, HookCall::App(name)).await,
        Commands::Check { .. } => Ok(()),
    };

    host.shutdown();
    result
}

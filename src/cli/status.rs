// src/cli/status.rs — Sandbox status and script checks

use std::path::Path;

use crate::infra::config::SandboxConfig;
use crate::infra::paths;
use crate::sandbox::bridge::PluginHost;
use crate::sandbox::builder::SandboxBuilder;
use crate::sandbox::loader::PluginSource;

/// Display the live sandbox instance, if any.
pub fn show_status(host: &PluginHost, urls: &[String], verbose: bool) -> anyhow::Result<()> {
    let config_path = paths::config_file_path();

    println!("plugbox v{}", env!("CARGO_PKG_VERSION"));
    println!();

    if config_path.exists() {
        println!("  Config:      {} (loaded)", config_path.display());
    } else {
        println!("  Config:      (using defaults)");
    }
    println!("  Plugin set:  {} configured", urls.len());

    let Some(status) = host.status() else {
        println!("  Sandbox:     (none, hooks pass through)");
        return Ok(());
    };

    println!(
        "  Sandbox:     {} (content {})",
        status.sandbox.short(),
        status.address
    );
    println!("  Loaded:      {}", list_or_none(&status.plugins));
    if !status.failed.is_empty() {
        println!("  Failed:      {}", status.failed.join(", "));
    }
    if !status.rejected.is_empty() {
        println!("  Rejected:    {}", status.rejected.join(", "));
    }
    if !status.unavailable.is_empty() {
        println!("  Unavailable: {}", status.unavailable.join(", "));
    }
    if verbose {
        println!("  Hooks:       {}", status.hooks);
    }
    Ok(())
}

/// Trial-parse local scripts. Fails if any of them does not parse.
pub async fn check_scripts(files: &[String], config: &SandboxConfig) -> anyhow::Result<()> {
    let mut sources = Vec::with_capacity(files.len());
    for file in files {
        let path = paths::resolve_plugin_path(file);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let name = Path::new(file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file)
            .to_string();
        sources.push(PluginSource::new(path.to_string_lossy(), name, content));
    }

    let document = SandboxBuilder::new(config).build(&sources)?;
    for unit in &document.plugins {
        println!("  ok     {}", unit.name);
    }
    for (name, diagnostic) in &document.rejected {
        println!("  error  {}: {}", name, diagnostic);
    }

    if !document.rejected.is_empty() {
        anyhow::bail!(
            "{} of {} scripts failed to parse",
            document.rejected.len(),
            sources.len()
        );
    }
    Ok(())
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

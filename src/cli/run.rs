// src/cli/run.rs — One-shot hook invocation

use anyhow::Context;

use crate::infra::config::Config;
use crate::infra::errors::SandboxError;
use crate::sandbox::bridge::{BuildOutcome, PluginHost};
use crate::sandbox::loader::PluginLoader;

/// A single hook call requested on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum HookCall {
    Receive(String),
    Send(String),
    Command { name: String, args: Vec<String> },
    App(String),
}

/// The active plugin set: configured URLs followed by `--plugin` additions.
pub fn plugin_set(config: &Config, extra: &[String], only: bool) -> Vec<String> {
    let mut urls: Vec<String> = if only {
        Vec::new()
    } else {
        config.plugins.urls.clone()
    };
    for url in extra {
        if !urls.contains(url) {
            urls.push(url.clone());
        }
    }
    urls
}

/// Load the plugin set and bring up a sandbox for it.
pub async fn build_host(config: &Config, urls: &[String]) -> anyhow::Result<PluginHost> {
    let loader = PluginLoader::from_config(&config.fetch)?;
    let host = PluginHost::new(loader, &config.sandbox);
    match host.set_plugins(urls).await? {
        BuildOutcome::Built(status) => {
            for name in &status.failed {
                eprintln!("  warning: plugin '{}' failed to load", name);
            }
            for name in &status.rejected {
                eprintln!("  warning: plugin '{}' does not parse", name);
            }
            for url in &status.unavailable {
                eprintln!("  warning: could not fetch {}", url);
            }
        }
        BuildOutcome::Empty => tracing::info!("No plugins loaded"),
        BuildOutcome::Unchanged => {}
    }
    Ok(host)
}

/// Run one hook and print its result. With no live sandbox the call passes
/// through: messages are echoed unchanged, commands and apps are unhandled.
pub async fn run_hook(host: &PluginHost, call: HookCall) -> anyhow::Result<()> {
    let Some(hooks) = host.hooks() else {
        return pass_through(call);
    };

    let result = match &call {
        HookCall::Receive(raw) => hooks.receive(parse_message(raw)?).await.map(print_message),
        HookCall::Send(raw) => hooks.send(parse_message(raw)?).await.map(print_message),
        HookCall::Command { name, args } => {
            let args = args.iter().map(|a| parse_arg(a)).collect();
            hooks.command(name, args).await.map(|reply| match reply {
                Some(value) => println!("{}", display_value(&value)),
                None => eprintln!("No plugin handles command '{}'", name),
            })
        }
        HookCall::App(name) => hooks.app(name).await.map(|view| match view {
            Some(view) => println!("{}", view.html),
            None => eprintln!("No plugin provides app '{}'", name),
        }),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_stale() => {
            tracing::warn!("Sandbox went away mid-request: {}", e);
            pass_through(call)
        }
        Err(SandboxError::Hook { hook, message }) => {
            anyhow::bail!("plugin {} hook failed: {}", hook, message)
        }
        Err(e) => Err(e.into()),
    }
}

fn pass_through(call: HookCall) -> anyhow::Result<()> {
    match call {
        HookCall::Receive(raw) | HookCall::Send(raw) => {
            print_message(Some(parse_message(&raw)?));
        }
        HookCall::Command { name, .. } => eprintln!("No plugin handles command '{}'", name),
        HookCall::App(name) => eprintln!("No plugin provides app '{}'", name),
    }
    Ok(())
}

fn parse_message(raw: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("Message is not valid JSON: {raw}"))
}

/// Command arguments are JSON when they parse, plain strings otherwise.
pub fn parse_arg(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn print_message(msg: Option<serde_json::Value>) {
    match msg {
        Some(msg) => println!(
            "{}",
            serde_json::to_string_pretty(&msg).unwrap_or_else(|_| msg.to_string())
        ),
        None => eprintln!("(message dropped by a plugin)"),
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

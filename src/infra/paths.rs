// src/infra/paths.rs — Path management
//
// All paths respect the PLUGBOX_HOME environment variable for isolation.
// When PLUGBOX_HOME is set, config and plugin scripts live under that directory.
// When unset, everything lives under ~/.plugbox/.

use std::path::{Path, PathBuf};

/// Returns the PLUGBOX_HOME override, if set.
fn plugbox_home() -> Option<PathBuf> {
    std::env::var_os("PLUGBOX_HOME").map(PathBuf::from)
}

/// Home directory (falls back to the working directory when none can be determined)
pub fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration directory: $PLUGBOX_HOME/ or ~/.plugbox/
pub fn config_dir() -> PathBuf {
    if let Some(home) = plugbox_home() {
        return home;
    }
    dirs_home().join(".plugbox")
}

/// Config file path
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Local plugin scripts directory, used to resolve relative plugin paths
pub fn plugins_dir() -> PathBuf {
    config_dir().join("plugins")
}

/// Expand a leading `~` and resolve relative paths against the plugins directory.
pub fn resolve_plugin_path(raw: &str) -> PathBuf {
    let expanded = match raw.strip_prefix("~/") {
        Some(rest) => dirs_home().join(rest),
        None => PathBuf::from(raw),
    };
    if expanded.is_absolute() || Path::new(raw).starts_with(".") {
        expanded
    } else {
        plugins_dir().join(expanded)
    }
}

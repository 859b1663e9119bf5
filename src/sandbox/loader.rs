// src/sandbox/loader.rs — Plugin source loader
//
// Resolves descriptor URLs to script text. Every URL settles exactly once:
// either with content or with an empty placeholder. Failures are logged,
// never retried, and never hold up sibling plugins.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::infra::config::FetchConfig;
use crate::infra::paths;

/// Descriptor document published at a plugin URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Descriptor {
    /// Script text lives at a secondary URL, relative to the descriptor.
    Entry { entry: String, name: String },
    /// Script text is inline.
    Script { script: String, name: String },
}

/// A resolved plugin. `content` is `None` when the fetch failed.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSource {
    pub url: String,
    pub name: String,
    pub content: Option<String>,
}

impl PluginSource {
    pub fn new(url: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            content: Some(content.into()),
        }
    }

    fn placeholder(url: &str) -> Self {
        Self {
            url: url.to_string(),
            name: url.to_string(),
            content: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }
}

// ---------------------------------------------------------------------------
// Fetchers
// ---------------------------------------------------------------------------

/// Fetches the text behind a URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String>;
}

/// `http`, `https` and `file` URLs.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        match url.scheme() {
            "http" | "https" => {
                let resp = self.client.get(url.clone()).send().await?;
                let resp = resp.error_for_status()?;
                Ok(resp.text().await?)
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| anyhow::anyhow!("Not a local path: {url}"))?;
                tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))
            }
            other => anyhow::bail!("Unsupported plugin URL scheme '{other}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// PluginLoader
// ---------------------------------------------------------------------------

pub struct PluginLoader {
    fetcher: Arc<dyn SourceFetcher>,
}

impl PluginLoader {
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn from_config(config: &FetchConfig) -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(HttpFetcher::new(config)?)))
    }

    /// Resolve every URL concurrently. Output order matches input order.
    pub async fn load_all(&self, urls: &[String]) -> Vec<PluginSource> {
        let sources = futures::future::join_all(urls.iter().map(|url| self.load_one(url))).await;
        let loaded = sources.iter().filter(|s| s.is_loaded()).count();
        tracing::debug!("Resolved {}/{} plugin sources", loaded, sources.len());
        sources
    }

    async fn load_one(&self, raw: &str) -> PluginSource {
        match self.resolve(raw).await {
            Ok((name, content)) => {
                tracing::info!("Loaded plugin '{}' from {}", name, raw);
                PluginSource::new(raw, name, content)
            }
            Err(e) => {
                tracing::warn!("Failed to load plugin {}: {:#}", raw, e);
                PluginSource::placeholder(raw)
            }
        }
    }

    async fn resolve(&self, raw: &str) -> anyhow::Result<(String, String)> {
        let url = plugin_url(raw)?;
        let text = self.fetcher.fetch(&url).await?;

        // A bare script file is its own descriptor
        if url.path().ends_with(".rhai") {
            return Ok((script_name(&url), text));
        }

        let descriptor: Descriptor = serde_json::from_str(&text)
            .with_context(|| format!("Invalid plugin descriptor at {url}"))?;
        match descriptor {
            Descriptor::Script { script, name } => Ok((name, script)),
            Descriptor::Entry { entry, name } => {
                let entry_url = url
                    .join(&entry)
                    .with_context(|| format!("Invalid entry URL '{entry}'"))?;
                let content = self.fetcher.fetch(&entry_url).await?;
                Ok((name, content))
            }
        }
    }
}

/// Parse a configured plugin location: an absolute URL or a local path.
pub fn plugin_url(raw: &str) -> anyhow::Result<Url> {
    // Single-letter schemes are drive letters, not URLs
    if let Ok(url) = Url::parse(raw) {
        if url.scheme().len() > 1 {
            return Ok(url);
        }
    }
    let path = paths::resolve_plugin_path(raw);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&path).map_err(|()| anyhow::anyhow!("Invalid plugin path: {raw}"))
}

fn script_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|file| {
            Path::new(file)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(file)
                .to_string()
        })
        .unwrap_or_else(|| url.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

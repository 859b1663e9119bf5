// src/sandbox/builder.rs — Sandbox document assembly
//
// A build turns the resolved plugin set into a `SandboxDocument`: the constant
// bootstrap plus one script unit per plugin that passes a trial parse, all
// tagged with a fresh per-build nonce. The frame refuses anything untagged.

use sha2::{Digest, Sha256};

use crate::infra::config::SandboxConfig;
use crate::infra::errors::SandboxError;
use crate::sandbox::engine::{self, BOOTSTRAP};
use crate::sandbox::loader::PluginSource;

/// Content-security policy of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    nonce: String,
}

impl SandboxPolicy {
    /// Generate a policy with a fresh 128-bit nonce.
    pub fn generate() -> Result<Self, SandboxError> {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| SandboxError::Spawn(format!("nonce generation failed: {e}")))?;
        Ok(Self {
            nonce: hex::encode(bytes),
        })
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Header form: one nonce-tagged script origin, workers from `blob:`,
    /// nothing else.
    pub fn content_security_policy(&self) -> String {
        format!(
            "default-src 'none'; script-src 'nonce-{}'; worker-src blob:; connect-src 'none'",
            self.nonce
        )
    }

    pub fn admits(&self, unit: &ScriptUnit) -> bool {
        unit.nonce == self.nonce
    }
}

/// One script admitted into a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptUnit {
    pub name: String,
    pub nonce: String,
    pub source: String,
}

/// SHA-256 over the resolved plugin contents, in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentAddress(String);

impl ContentAddress {
    pub fn of(sources: &[PluginSource]) -> Self {
        let mut hasher = Sha256::new();
        for source in sources {
            let Some(content) = &source.content else {
                continue;
            };
            hasher.update(source.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..12])
    }
}

/// Everything a frame needs to mount one sandbox instance.
#[derive(Debug, Clone)]
pub struct SandboxDocument {
    pub policy: SandboxPolicy,
    pub bootstrap: ScriptUnit,
    pub plugins: Vec<ScriptUnit>,
    /// Plugins dropped by the trial parse, with the parser's diagnostic.
    pub rejected: Vec<(String, String)>,
    pub address: ContentAddress,
}

pub struct SandboxBuilder {
    config: SandboxConfig,
}

impl SandboxBuilder {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Assemble a document. Placeholders are skipped; unparsable plugins are
    /// dropped with a warning and never abort the build.
    pub fn build(&self, sources: &[PluginSource]) -> Result<SandboxDocument, SandboxError> {
        let policy = SandboxPolicy::generate()?;
        let parser = engine::create_engine(&self.config);

        parser
            .compile(BOOTSTRAP)
            .map_err(|e| SandboxError::Spawn(format!("bootstrap does not parse: {e}")))?;
        let bootstrap = ScriptUnit {
            name: "bootstrap".into(),
            nonce: policy.nonce().to_string(),
            source: BOOTSTRAP.to_string(),
        };

        let mut plugins = Vec::new();
        let mut rejected = Vec::new();
        for source in sources {
            let Some(content) = &source.content else {
                continue;
            };
            match parser.compile(content) {
                Ok(_) => plugins.push(ScriptUnit {
                    name: source.name.clone(),
                    nonce: policy.nonce().to_string(),
                    source: content.clone(),
                }),
                Err(e) => {
                    tracing::warn!("Dropping plugin '{}': {}", source.name, e);
                    rejected.push((source.name.clone(), e.to_string()));
                }
            }
        }

        let address = ContentAddress::of(sources);
        tracing::debug!(
            "Built sandbox document {} ({} admitted, {} rejected)",
            address,
            plugins.len(),
            rejected.len()
        );

        Ok(SandboxDocument {
            policy,
            bootstrap,
            plugins,
            rejected,
            address,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn source(name: &str, content: &str) -> PluginSource {
        PluginSource::new(format!("https://plugins.test/{name}.json"), name, content)
    }

    #[test]
    fn test_nonce_is_fresh_per_build() {
        let a = SandboxPolicy::generate().unwrap();
        let b = SandboxPolicy::generate().unwrap();
        assert_ne!(a.nonce(), b.nonce());
        assert_eq!(a.nonce().len(), 32);
        assert!(a
            .content_security_policy()
            .contains(&format!("'nonce-{}'", a.nonce())));
    }

    #[test]
    fn test_unparsable_plugin_is_dropped() {
        let builder = SandboxBuilder::new(&SandboxConfig::default());
        let doc = builder
            .build(&[
                source("good", "on_receive(|m| m);"),
                source("broken", "fn ("),
                source("also_good", "let x = 1;"),
            ])
            .unwrap();

        let names: Vec<&str> = doc.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["good", "also_good"]);
        assert_eq!(doc.rejected.len(), 1);
        assert_eq!(doc.rejected[0].0, "broken");
        assert!(doc.plugins.iter().all(|p| doc.policy.admits(p)));
        assert!(doc.policy.admits(&doc.bootstrap));
    }

    #[test]
    fn test_placeholders_are_skipped() {
        let builder = SandboxBuilder::new(&SandboxConfig::default());
        let failed = PluginSource {
            url: "https://plugins.test/down.json".into(),
            name: "down".into(),
            content: None,
        };
        let doc = builder.build(&[failed]).unwrap();
        assert!(doc.plugins.is_empty());
        assert!(doc.rejected.is_empty());
    }

    #[test]
    fn test_content_address_tracks_content_only() {
        let a = ContentAddress::of(&[source("p", "let a = 1;")]);
        let b = ContentAddress::of(&[source("p", "let a = 1;")]);
        let c = ContentAddress::of(&[source("p", "let a = 2;")]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let with_placeholder = ContentAddress::of(&[
            source("p", "let a = 1;"),
            PluginSource {
                url: "x".into(),
                name: "x".into(),
                content: None,
            },
        ]);
        assert_eq!(a, with_placeholder);
    }

    #[test]
    fn test_foreign_nonce_not_admitted() {
        let policy = SandboxPolicy::generate().unwrap();
        let unit = ScriptUnit {
            name: "injected".into(),
            nonce: "0".repeat(32),
            source: String::new(),
        };
        assert!(!policy.admits(&unit));
    }
}

// src/sandbox/registry.rs — Hook registry
//
// Plugins register handlers with `on(event, handler)`. Receive and send hooks
// form ordered chains; command and app hooks are single slots where the last
// registration wins.

use std::collections::HashMap;

use rhai::FnPtr;

/// Hook event classes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookKind {
    Receive,
    Send,
    Command(String),
    App(String),
}

impl HookKind {
    /// Parse an event specifier: `receive`, `send`, `command:<name>`, `app:<name>`.
    pub fn parse(spec: &str) -> Option<Self> {
        match spec {
            "receive" => Some(Self::Receive),
            "send" => Some(Self::Send),
            _ => {
                let (class, name) = spec.split_once(':')?;
                if name.is_empty() {
                    return None;
                }
                match class {
                    "command" => Some(Self::Command(name.to_string())),
                    "app" => Some(Self::App(name.to_string())),
                    _ => None,
                }
            }
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Receive => write!(f, "receive"),
            Self::Send => write!(f, "send"),
            Self::Command(name) => write!(f, "command:{name}"),
            Self::App(name) => write!(f, "app:{name}"),
        }
    }
}

/// The two ordered chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Receive,
    Send,
}

/// A registered handler and the plugin that owns it.
#[derive(Debug, Clone)]
pub struct HookHandler {
    /// Index of the owning plugin in load order.
    pub plugin: usize,
    pub callback: FnPtr,
}

/// Per-instance table of registered handlers.
#[derive(Debug, Default)]
pub struct HookRegistry {
    receive: Vec<HookHandler>,
    send: Vec<HookHandler>,
    commands: HashMap<String, HookHandler>,
    apps: HashMap<String, HookHandler>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns the handler it displaced, if any.
    pub fn register(&mut self, kind: HookKind, handler: HookHandler) -> Option<HookHandler> {
        tracing::debug!("Plugin #{} registered hook '{}'", handler.plugin, kind);
        match kind {
            HookKind::Receive => {
                self.receive.push(handler);
                None
            }
            HookKind::Send => {
                self.send.push(handler);
                None
            }
            HookKind::Command(name) => {
                let plugin = handler.plugin;
                let replaced = self.commands.insert(name.clone(), handler);
                if let Some(previous) = &replaced {
                    tracing::warn!(
                        "Hook 'command:{}' of plugin #{} replaced by plugin #{}",
                        name,
                        previous.plugin,
                        plugin
                    );
                }
                replaced
            }
            HookKind::App(name) => {
                let plugin = handler.plugin;
                let replaced = self.apps.insert(name.clone(), handler);
                if let Some(previous) = &replaced {
                    tracing::warn!(
                        "Hook 'app:{}' of plugin #{} replaced by plugin #{}",
                        name,
                        previous.plugin,
                        plugin
                    );
                }
                replaced
            }
        }
    }

    /// Snapshot of a chain in registration order.
    pub fn chain(&self, chain: Chain) -> Vec<HookHandler> {
        match chain {
            Chain::Receive => self.receive.clone(),
            Chain::Send => self.send.clone(),
        }
    }

    pub fn command(&self, name: &str) -> Option<HookHandler> {
        self.commands.get(name).cloned()
    }

    pub fn app(&self, name: &str) -> Option<HookHandler> {
        self.apps.get(name).cloned()
    }

    pub fn hook_count(&self) -> usize {
        self.receive.len() + self.send.len() + self.commands.len() + self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hook_count() == 0
    }

    pub fn clear(&mut self) {
        self.receive.clear();
        self.send.clear();
        self.commands.clear();
        self.apps.clear();
    }

    /// Summary for status display.
    pub fn status_summary(&self) -> String {
        if self.is_empty() {
            return "No hooks registered".into();
        }
        let mut parts = Vec::new();
        if !self.receive.is_empty() {
            parts.push(format!("{} receive", self.receive.len()));
        }
        if !self.send.is_empty() {
            parts.push(format!("{} send", self.send.len()));
        }
        if !self.commands.is_empty() {
            parts.push(format!("{} command", self.commands.len()));
        }
        if !self.apps.is_empty() {
            parts.push(format!("{} app", self.apps.len()));
        }
        parts.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

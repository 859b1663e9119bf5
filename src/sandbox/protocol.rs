// src/sandbox/protocol.rs — Messages exchanged across the sandbox boundaries
//
// Everything here is serialized to a JSON string before it crosses a
// boundary. Requests flow host -> frame -> worker; worker messages flow back
// and are stamped with the instance id by the frame.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application-defined chat message. Forwarded unexamined.
pub type Message = serde_json::Value;

/// Unguessable token pairing a request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one sandbox instance; the origin of every reply it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxId(Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form for thread names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Host -> worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Request {
    /// Incoming message: run the receive chain.
    Message { id: CorrelationId, msg: Message },
    /// Outgoing message: run the send chain.
    SendMessage { id: CorrelationId, msg: Message },
    Command {
        id: CorrelationId,
        name: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    App { id: CorrelationId, name: String },
}

impl Request {
    pub fn id(&self) -> CorrelationId {
        match self {
            Request::Message { id, .. }
            | Request::SendMessage { id, .. }
            | Request::Command { id, .. }
            | Request::App { id, .. } => *id,
        }
    }

    /// Hook name used in logs and error reports.
    pub fn hook_name(&self) -> String {
        match self {
            Request::Message { .. } => "receive".into(),
            Request::SendMessage { .. } => "send".into(),
            Request::Command { name, .. } => format!("command:{name}"),
            Request::App { name, .. } => format!("app:{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker -> host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// Sent once, after every admitted plugin has run.
    Ready(ReadyReport),
    Reply(Reply),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadyReport {
    /// Plugins whose body ran to completion, in load order.
    pub plugins: Vec<String>,
    /// Plugins whose body raised an error while running.
    #[serde(default)]
    pub failed: Vec<String>,
    /// Registered hooks, as shown by `status`.
    #[serde(default)]
    pub hooks: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: CorrelationId,
    pub msg: serde_json::Value,
    /// Set when the handler raised; `msg` is null then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(id: CorrelationId, msg: serde_json::Value) -> Self {
        Self {
            id,
            msg,
            error: None,
        }
    }

    pub fn failed(id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            id,
            msg: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// What an `app` handler renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppView {
    pub html: String,
}

// ---------------------------------------------------------------------------
// Frame -> host
// ---------------------------------------------------------------------------

/// A worker message relayed by a frame, stamped with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: SandboxId,
    pub event: FrameEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// Serialized `WorkerMessage`.
    Message(String),
    /// The worker is gone; nothing more will arrive from this origin.
    Closed,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

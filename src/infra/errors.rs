// src/infra/errors.rs — Error types for plugbox

use thiserror::Error;

/// Errors surfaced to host callers of the sandbox hooks.
#[derive(Error, Debug)]
pub enum SandboxError {
    // Correlation failures (the request never got an answer from the live sandbox)
    #[error("Sandbox was rebuilt before request {id} completed")]
    Rebuilt { id: String },

    #[error("Sandbox is closed")]
    Closed,

    #[error("Reply for request {id} was dropped")]
    Dropped { id: String },

    // Plugin failures (the sandbox answered with an error marker)
    #[error("Plugin hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    // Infra
    #[error("Sandbox worker failed to start: {0}")]
    Spawn(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl SandboxError {
    /// The request was addressed to an instance that no longer exists.
    ///
    /// Callers treat these like a `None` hook: pass the message through.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            SandboxError::Rebuilt { .. } | SandboxError::Closed | SandboxError::Dropped { .. }
        )
    }
}

/// Errors raised by host functions running inside the sandbox worker.
///
/// These become script errors on the plugin side; they never cross the
/// boundary except as the text of a hook error reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("TypeError: {0}")]
    Type(String),

    #[error("TypeError: {0} is not a function")]
    NotCallable(String),

    #[error("TypeError: {0} is not a constructor")]
    NotConstructor(String),

    #[error("RangeError: {0}")]
    Range(String),

    #[error("SyntaxError: {0}")]
    Syntax(String),
}

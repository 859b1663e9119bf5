// src/sandbox/mod.rs — Plugin sandbox
//
// Loader -> builder -> frame -> worker on the way in, correlated replies
// through the bridge on the way out. Host objects reach plugin code only
// through the capability filter.

pub mod bridge;
pub mod builder;
pub mod capability;
pub mod convert;
pub mod engine;
pub mod frame;
pub mod loader;
pub mod object;
pub mod protocol;
pub mod realm;
pub mod registry;
pub mod worker;

pub use bridge::{BuildOutcome, InstanceStatus, PluginHost, SandboxHooks};
pub use loader::{PluginLoader, SourceFetcher};

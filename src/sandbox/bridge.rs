// src/sandbox/bridge.rs — Host bridge
//
// `PluginHost` owns the live sandbox instance and the table of pending
// requests. `SandboxHooks` is what the rest of the application calls: every
// call posts a correlated request into the live frame and awaits the reply
// that carries the same id from the same origin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::infra::config::SandboxConfig;
use crate::infra::errors::SandboxError;
use crate::sandbox::builder::{ContentAddress, SandboxBuilder};
use crate::sandbox::frame::Frame;
use crate::sandbox::loader::{PluginLoader, PluginSource};
use crate::sandbox::protocol::{
    AppView, CorrelationId, Envelope, FrameEvent, Message, ReadyReport, Reply, Request, SandboxId,
    WorkerMessage,
};

type ReplyResult = Result<serde_json::Value, SandboxError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Snapshot of the live instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub sandbox: SandboxId,
    pub address: ContentAddress,
    pub plugins: Vec<String>,
    /// Plugins that raised while loading.
    pub failed: Vec<String>,
    /// Plugins dropped by the trial parse.
    pub rejected: Vec<String>,
    /// Plugin URLs that could not be fetched.
    pub unavailable: Vec<String>,
    pub hooks: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// A new instance replaced the previous one.
    Built(InstanceStatus),
    /// The resolved content matches the live instance.
    Unchanged,
    /// Nothing loaded; hooks are disabled.
    Empty,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ActiveInstance {
    frame: Frame,
    status: InstanceStatus,
}

struct Pending {
    sandbox: SandboxId,
    hook: String,
    tx: oneshot::Sender<ReplyResult>,
}

struct Shared {
    active: Mutex<Option<ActiveInstance>>,
    pending: Mutex<HashMap<CorrelationId, Pending>>,
    ready: Mutex<HashMap<SandboxId, oneshot::Sender<ReadyReport>>>,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl Shared {
    fn live_id(&self) -> Option<SandboxId> {
        lock(&self.active).as_ref().map(|a| a.frame.id())
    }

    fn accept(&self, envelope: Envelope) {
        let origin = envelope.origin;
        match envelope.event {
            FrameEvent::Closed => {
                // A worker that dies before `ready` fails its build
                lock(&self.ready).remove(&origin);
                let rejected = self.reject_pending(origin, |_| SandboxError::Closed);
                tracing::debug!(
                    "Sandbox {} closed ({} pending requests rejected)",
                    origin.short(),
                    rejected
                );
            }
            FrameEvent::Message(body) => match serde_json::from_str::<WorkerMessage>(&body) {
                Ok(WorkerMessage::Ready(report)) => match lock(&self.ready).remove(&origin) {
                    Some(tx) => {
                        let _ = tx.send(report);
                    }
                    None => tracing::debug!("Unexpected ready from sandbox {}", origin.short()),
                },
                Ok(WorkerMessage::Reply(reply)) => self.resolve(origin, reply),
                Err(e) => {
                    tracing::warn!("Malformed message from sandbox {}: {}", origin.short(), e)
                }
            },
        }
    }

    /// Complete a pending request. Replies from any origin other than the
    /// live instance, or for ids nobody is waiting on, are ignored.
    fn resolve(&self, origin: SandboxId, reply: Reply) {
        if self.live_id() != Some(origin) {
            tracing::debug!("Ignoring reply from retired sandbox {}", origin.short());
            return;
        }
        let entry = {
            let mut pending = lock(&self.pending);
            match pending.get(&reply.id) {
                Some(p) if p.sandbox == origin => pending.remove(&reply.id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            tracing::debug!("Ignoring unsolicited reply {}", reply.id);
            return;
        };
        let result = match reply.error {
            Some(message) => Err(SandboxError::Hook {
                hook: entry.hook,
                message,
            }),
            None => Ok(reply.msg),
        };
        let _ = entry.tx.send(result);
    }

    /// Fail every request pending on `sandbox`. Returns how many there were.
    fn reject_pending(
        &self,
        sandbox: SandboxId,
        reason: impl Fn(CorrelationId) -> SandboxError,
    ) -> usize {
        let stale: Vec<(CorrelationId, Pending)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, p)| p.sandbox == sandbox)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        let count = stale.len();
        for (id, entry) in stale {
            let _ = entry.tx.send(Err(reason(id)));
        }
        count
    }

    /// Install `next` as the live instance and shut the previous one down.
    fn replace(&self, next: Option<ActiveInstance>) {
        let previous = std::mem::replace(&mut *lock(&self.active), next);
        if let Some(old) = previous {
            let rejected = self.reject_pending(old.frame.id(), |id| SandboxError::Rebuilt {
                id: id.to_string(),
            });
            tracing::info!(
                "Retired sandbox {} ({} pending requests rejected)",
                old.frame.id().short(),
                rejected
            );
            old.frame.shutdown();
        }
    }
}

async fn route(shared: Arc<Shared>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = inbox.recv().await {
        shared.accept(envelope);
    }
}

// ---------------------------------------------------------------------------
// PluginHost
// ---------------------------------------------------------------------------

pub struct PluginHost {
    loader: PluginLoader,
    builder: SandboxBuilder,
    config: SandboxConfig,
    shared: Arc<Shared>,
    router: JoinHandle<()>,
    /// Serializes rebuilds.
    rebuild: tokio::sync::Mutex<()>,
}

impl PluginHost {
    /// Create a host with no live instance. Must be called inside a Tokio
    /// runtime.
    pub fn new(loader: PluginLoader, config: &SandboxConfig) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            active: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            ready: Mutex::new(HashMap::new()),
            outbox,
        });
        let router = tokio::spawn(route(shared.clone(), inbox));
        Self {
            loader,
            builder: SandboxBuilder::new(config),
            config: config.clone(),
            shared,
            router,
            rebuild: tokio::sync::Mutex::new(()),
        }
    }

    /// The hook functions, or `None` while no instance is live. Callers treat
    /// `None` as pass-through.
    pub fn hooks(&self) -> Option<SandboxHooks> {
        lock(&self.shared.active).as_ref().map(|_| SandboxHooks {
            shared: self.shared.clone(),
        })
    }

    pub fn status(&self) -> Option<InstanceStatus> {
        lock(&self.shared.active).as_ref().map(|a| a.status.clone())
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Load `urls`, build, mount, wait for the worker to report ready, then
    /// swap the new instance in. The swap happens only after every source has
    /// settled, so no partial rebuild is ever visible.
    pub async fn set_plugins(&self, urls: &[String]) -> Result<BuildOutcome, SandboxError> {
        let _guard = self.rebuild.lock().await;

        let sources = self.loader.load_all(urls).await;
        let unavailable: Vec<String> = sources
            .iter()
            .filter(|s| !s.is_loaded())
            .map(|s| s.url.clone())
            .collect();
        if !sources.iter().any(PluginSource::is_loaded) {
            self.shared.replace(None);
            tracing::info!("No plugins loaded; hooks disabled");
            return Ok(BuildOutcome::Empty);
        }

        let address = ContentAddress::of(&sources);
        let unchanged = lock(&self.shared.active)
            .as_ref()
            .is_some_and(|a| a.status.address == address && a.frame.is_running());
        if unchanged {
            tracing::debug!("Plugin set unchanged ({}); keeping sandbox", address);
            return Ok(BuildOutcome::Unchanged);
        }

        let document = self.builder.build(&sources)?;
        let rejected: Vec<String> = document.rejected.iter().map(|(name, _)| name.clone()).collect();

        let id = SandboxId::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        lock(&self.shared.ready).insert(id, ready_tx);
        let frame = match Frame::mount(id, document, &self.config, self.shared.outbox.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                lock(&self.shared.ready).remove(&id);
                return Err(e);
            }
        };

        let report = match ready_rx.await {
            Ok(report) => report,
            Err(_) => {
                frame.shutdown();
                return Err(SandboxError::Spawn(format!(
                    "sandbox {} exited before it was ready",
                    id.short()
                )));
            }
        };

        let status = InstanceStatus {
            sandbox: id,
            address,
            plugins: report.plugins,
            failed: report.failed,
            rejected,
            unavailable,
            hooks: report.hooks,
        };
        self.shared.replace(Some(ActiveInstance {
            frame,
            status: status.clone(),
        }));
        tracing::info!(
            "Sandbox {} live with {} plugins ({})",
            id.short(),
            status.plugins.len(),
            status.hooks
        );
        Ok(BuildOutcome::Built(status))
    }

    /// Rebuild whenever the active plugin set changes. Runs until the sender
    /// side of `urls` is dropped.
    pub fn watch(self: &Arc<Self>, mut urls: watch::Receiver<Vec<String>>) -> JoinHandle<()> {
        let host = self.clone();
        tokio::spawn(async move {
            loop {
                let current = urls.borrow_and_update().clone();
                match host.set_plugins(&current).await {
                    Ok(outcome) => tracing::debug!("Plugin set applied: {:?}", outcome),
                    Err(e) => tracing::warn!("Failed to apply plugin set: {}", e),
                }
                if urls.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Tear down the live instance. Pending requests fail with `Rebuilt`.
    pub fn shutdown(&self) {
        self.shared.replace(None);
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.shared.replace(None);
        self.router.abort();
    }
}

// ---------------------------------------------------------------------------
// SandboxHooks
// ---------------------------------------------------------------------------

/// The async hook functions. Cheap to clone.
#[derive(Clone)]
pub struct SandboxHooks {
    shared: Arc<Shared>,
}

impl SandboxHooks {
    /// Incoming message through the receive chain. `None` = dropped by a plugin.
    pub async fn receive(&self, msg: Message) -> Result<Option<Message>, SandboxError> {
        let reply = self.request(|id| Request::Message { id, msg }).await?;
        Ok(non_null(reply))
    }

    /// Outgoing message through the send chain. `None` = dropped by a plugin.
    pub async fn send(&self, msg: Message) -> Result<Option<Message>, SandboxError> {
        let reply = self.request(|id| Request::SendMessage { id, msg }).await?;
        Ok(non_null(reply))
    }

    /// Run a named command. `None` when no plugin handles it.
    pub async fn command(
        &self,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, SandboxError> {
        let name = name.to_string();
        let reply = self
            .request(|id| Request::Command { id, name, args })
            .await?;
        Ok(non_null(reply))
    }

    /// Render a named app. `None` when no plugin provides it.
    pub async fn app(&self, name: &str) -> Result<Option<AppView>, SandboxError> {
        let name = name.to_string();
        let reply = self.request(|id| Request::App { id, name }).await?;
        match non_null(reply) {
            Some(view) => Ok(Some(serde_json::from_value(view)?)),
            None => Ok(None),
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(CorrelationId) -> Request,
    ) -> Result<serde_json::Value, SandboxError> {
        let id = CorrelationId::new();
        let request = make(id);
        let (tx, rx) = oneshot::channel();
        {
            let active = lock(&self.shared.active);
            let Some(instance) = active.as_ref() else {
                return Err(SandboxError::Closed);
            };
            lock(&self.shared.pending).insert(
                id,
                Pending {
                    sandbox: instance.frame.id(),
                    hook: request.hook_name(),
                    tx,
                },
            );
            if let Err(e) = instance.frame.post(&request) {
                lock(&self.shared.pending).remove(&id);
                return Err(e);
            }
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Dropped { id: id.to_string() }),
        }
    }
}

fn non_null(value: serde_json::Value) -> Option<serde_json::Value> {
    match value {
        serde_json::Value::Null => None,
        other => Some(other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::loader::MockSourceFetcher;
    use serde_json::json;
    use std::task::Poll;
    use std::time::Duration;

    fn script_host(scripts: &'static [(&'static str, &'static str)]) -> PluginHost {
        let mut mock = MockSourceFetcher::new();
        mock.expect_fetch().returning(move |url| {
            scripts
                .iter()
                .find(|(name, _)| url.path().ends_with(&format!("/{name}.json")))
                .map(|(name, script)| {
                    json!({"type": "script", "name": name, "script": script}).to_string()
                })
                .ok_or_else(|| anyhow::anyhow!("404 {url}"))
        });
        PluginHost::new(PluginLoader::new(Arc::new(mock)), &SandboxConfig::default())
    }

    fn urls(names: &[&str]) -> Vec<String> {
        names
            .iter()
            .map(|n| format!("https://plugins.test/{n}.json"))
            .collect()
    }

    #[tokio::test]
    async fn test_hooks_absent_before_first_build() {
        let host = script_host(&[]);
        assert!(host.hooks().is_none());
        assert!(host.status().is_none());
    }

    #[tokio::test]
    async fn test_rebuild_skipped_for_identical_content() {
        let host = script_host(&[("a", "on_receive(|m| m);")]);
        let first = host.set_plugins(&urls(&["a"])).await.unwrap();
        assert!(matches!(first, BuildOutcome::Built(_)));
        let second = host.set_plugins(&urls(&["a"])).await.unwrap();
        assert_eq!(second, BuildOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_unavailable_sources_are_reported() {
        let host = script_host(&[("a", "on_receive(|m| m);")]);
        let outcome = host.set_plugins(&urls(&["a", "gone"])).await.unwrap();
        let BuildOutcome::Built(status) = outcome else {
            panic!("expected build");
        };
        assert_eq!(status.plugins, vec!["a"]);
        assert_eq!(status.unavailable, urls(&["gone"]));
    }

    #[tokio::test]
    async fn test_reply_from_retired_origin_is_ignored() {
        let host = script_host(&[("a", "on_receive(|m| m);")]);
        host.set_plugins(&urls(&["a"])).await.unwrap();

        let (tx, rx) = oneshot::channel();
        let id = CorrelationId::new();
        let live = host.shared.live_id().unwrap();
        lock(&host.shared.pending).insert(
            id,
            Pending {
                sandbox: live,
                hook: "receive".into(),
                tx,
            },
        );

        // Same id, wrong origin
        let forged = WorkerMessage::Reply(Reply::ok(id, json!("forged")));
        host.shared.accept(Envelope {
            origin: SandboxId::new(),
            event: FrameEvent::Message(serde_json::to_string(&forged).unwrap()),
        });
        assert_eq!(host.pending_count(), 1);

        // Right origin
        let genuine = WorkerMessage::Reply(Reply::ok(id, json!("genuine")));
        host.shared.accept(Envelope {
            origin: live,
            event: FrameEvent::Message(serde_json::to_string(&genuine).unwrap()),
        });
        assert_eq!(rx.await.unwrap().unwrap(), json!("genuine"));
        assert_eq!(host.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_stays_pending_until_reply() {
        let host = script_host(&[("a", "on_receive(|m| m);")]);
        host.set_plugins(&urls(&["a"])).await.unwrap();
        let hooks = host.hooks().unwrap();

        let mut call = tokio_test::task::spawn(hooks.receive(json!({"n": 1})));
        tokio_test::assert_pending!(call.poll());
        assert_eq!(host.pending_count(), 1);

        let reply = loop {
            if let Poll::Ready(reply) = call.poll() {
                break reply;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(reply.unwrap(), Some(json!({"n": 1})));
        assert_eq!(host.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_disables_hooks() {
        let host = script_host(&[("a", "on_receive(|m| m);")]);
        host.set_plugins(&urls(&["a"])).await.unwrap();
        let hooks = host.hooks().unwrap();
        host.shutdown();
        assert!(host.hooks().is_none());
        assert!(matches!(
            hooks.receive(json!({})).await,
            Err(SandboxError::Closed)
        ));
    }
}

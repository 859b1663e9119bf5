// src/sandbox/frame.rs — Sandbox frame (outer boundary)
//
// A frame mounts one document: it admits only nonce-tagged script units,
// launches the worker with them and relays the worker's serialized messages
// to the host, stamped with the instance id. Requests go the other way as
// JSON strings. No object crosses a frame.

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::infra::config::SandboxConfig;
use crate::infra::errors::SandboxError;
use crate::sandbox::builder::{SandboxDocument, ScriptUnit};
use crate::sandbox::protocol::{Envelope, FrameEvent, Request, SandboxId};
use crate::sandbox::worker::{self, WorkerHandle, WorkerSpec};

pub struct Frame {
    id: SandboxId,
    worker: WorkerHandle,
    relay: JoinHandle<()>,
}

impl Frame {
    /// Mount `document` and start its worker. Must be called inside a Tokio
    /// runtime.
    pub fn mount(
        id: SandboxId,
        document: SandboxDocument,
        config: &SandboxConfig,
        host: UnboundedSender<Envelope>,
    ) -> Result<Self, SandboxError> {
        let SandboxDocument {
            policy,
            bootstrap,
            plugins,
            address,
            ..
        } = document;

        if !policy.admits(&bootstrap) {
            return Err(SandboxError::Spawn(
                "bootstrap is not tagged with the document nonce".into(),
            ));
        }
        let plugins: Vec<ScriptUnit> = plugins
            .into_iter()
            .filter(|unit| {
                let admitted = policy.admits(unit);
                if !admitted {
                    tracing::warn!("Refusing untagged script unit '{}'", unit.name);
                }
                admitted
            })
            .collect();

        tracing::debug!(
            "Mounting sandbox {} ({}) under \"{}\"",
            id.short(),
            address,
            policy.content_security_policy()
        );

        let (outbound, mut inbound) = mpsc::unbounded_channel::<String>();
        let worker = worker::spawn(
            WorkerSpec {
                sandbox: id,
                bootstrap: bootstrap.source,
                plugins,
                config: config.clone(),
            },
            outbound,
        )?;

        let relay = tokio::spawn(async move {
            while let Some(body) = inbound.recv().await {
                let envelope = Envelope {
                    origin: id,
                    event: FrameEvent::Message(body),
                };
                if host.send(envelope).is_err() {
                    return;
                }
            }
            let _ = host.send(Envelope {
                origin: id,
                event: FrameEvent::Closed,
            });
        });

        Ok(Self { id, worker, relay })
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Serialize and deliver a request to the worker.
    pub fn post(&self, request: &Request) -> Result<(), SandboxError> {
        let body = serde_json::to_string(request)?;
        self.worker.post(body)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running() && !self.relay.is_finished()
    }

    /// Stop accepting requests. The worker finishes the request in hand,
    /// releases its realm and exits; the relay then reports `Closed`.
    pub fn shutdown(self) {
        tracing::debug!("Shutting down sandbox {}", self.id.short());
        drop(self.worker);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::builder::SandboxBuilder;
    use crate::sandbox::loader::PluginSource;
    use crate::sandbox::protocol::{CorrelationId, WorkerMessage};
    use serde_json::json;

    fn document(script: &str) -> SandboxDocument {
        SandboxBuilder::new(&SandboxConfig::default())
            .build(&[PluginSource::new("https://plugins.test/p.json", "p", script)])
            .unwrap()
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> (SandboxId, WorkerMessage) {
        let envelope = rx.recv().await.expect("frame event");
        match envelope.event {
            FrameEvent::Message(body) => (envelope.origin, serde_json::from_str(&body).unwrap()),
            FrameEvent::Closed => panic!("frame closed early"),
        }
    }

    #[tokio::test]
    async fn test_relays_ready_and_replies_with_origin() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SandboxId::new();
        let frame = Frame::mount(
            id,
            document(r#"on_receive(|m| { m.seen = true; m });"#),
            &SandboxConfig::default(),
            tx,
        )
        .unwrap();

        let (origin, ready) = next_message(&mut rx).await;
        assert_eq!(origin, id);
        assert!(matches!(ready, WorkerMessage::Ready(ref r) if r.plugins == vec!["p"]));

        let request_id = CorrelationId::new();
        frame
            .post(&Request::Message {
                id: request_id,
                msg: json!({"payload": "hi"}),
            })
            .unwrap();
        let (origin, reply) = next_message(&mut rx).await;
        assert_eq!(origin, id);
        let WorkerMessage::Reply(reply) = reply else {
            panic!("expected reply");
        };
        assert_eq!(reply.id, request_id);
        assert_eq!(reply.msg, json!({"payload": "hi", "seen": true}));
    }

    #[tokio::test]
    async fn test_foreign_units_are_not_run() {
        let mut doc = document(r#"on_receive(|m| m);"#);
        doc.plugins.push(ScriptUnit {
            name: "injected".into(),
            nonce: "forged".into(),
            source: r#"on_receive(|m| ());"#.into(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _frame = Frame::mount(SandboxId::new(), doc, &SandboxConfig::default(), tx).unwrap();
        let (_, ready) = next_message(&mut rx).await;
        let WorkerMessage::Ready(report) = ready else {
            panic!("expected ready");
        };
        assert_eq!(report.plugins, vec!["p"]);
    }

    #[tokio::test]
    async fn test_shutdown_reports_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SandboxId::new();
        let frame = Frame::mount(id, document("let x = 1;"), &SandboxConfig::default(), tx).unwrap();
        let _ready = next_message(&mut rx).await;
        frame.shutdown();

        let closed = rx.recv().await.unwrap();
        assert_eq!(closed.origin, id);
        assert_eq!(closed.event, FrameEvent::Closed);
    }

    #[tokio::test]
    async fn test_tampered_bootstrap_is_refused() {
        let mut doc = document("let x = 1;");
        doc.bootstrap.nonce = "forged".into();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Frame::mount(SandboxId::new(), doc, &SandboxConfig::default(), tx);
        assert!(matches!(result, Err(SandboxError::Spawn(_))));
    }
}

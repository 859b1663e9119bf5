// tests/sandbox_test.rs — Integration test: plugin host end to end

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;

use plugbox::infra::config::SandboxConfig;
use plugbox::infra::errors::SandboxError;
use plugbox::sandbox::protocol::AppView;
use plugbox::sandbox::{BuildOutcome, PluginHost, PluginLoader, SourceFetcher};

/// Serves inline-script descriptors from memory; unknown URLs fail.
struct StaticFetcher {
    scripts: HashMap<String, String>,
}

impl StaticFetcher {
    fn new(scripts: &[(&str, &str)]) -> Self {
        Self {
            scripts: scripts
                .iter()
                .map(|(name, script)| (url(name), script.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        let script = self
            .scripts
            .get(url.as_str())
            .ok_or_else(|| anyhow::anyhow!("404 Not Found: {url}"))?;
        let name = url
            .path()
            .trim_start_matches('/')
            .trim_end_matches(".json")
            .to_string();
        Ok(json!({"type": "script", "name": name, "script": script}).to_string())
    }
}

fn url(name: &str) -> String {
    format!("https://plugins.test/{name}.json")
}

fn urls(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| url(n)).collect()
}

fn host(scripts: &[(&str, &str)]) -> PluginHost {
    let loader = PluginLoader::new(Arc::new(StaticFetcher::new(scripts)));
    PluginHost::new(loader, &SandboxConfig::default())
}

const P1: &str = r#"on_receive(|m| { m.payload += " [p1]"; m });"#;
const P2: &str = r#"on_receive(|m| { m.payload += " [p2]"; m });"#;

#[tokio::test]
async fn test_receive_chain_in_load_order() {
    let host = host(&[("p1", P1), ("p2", P2)]);
    host.set_plugins(&urls(&["p1", "p2"])).await.unwrap();

    let hooks = host.hooks().expect("hooks after build");
    let out = hooks.receive(json!({"payload": "hi"})).await.unwrap();
    assert_eq!(out, Some(json!({"payload": "hi [p1] [p2]"})));

    // Reordering the set reorders the chain
    host.set_plugins(&urls(&["p2", "p1"])).await.unwrap();
    let out = host
        .hooks()
        .unwrap()
        .receive(json!({"payload": "hi"}))
        .await
        .unwrap();
    assert_eq!(out, Some(json!({"payload": "hi [p2] [p1]"})));
}

#[tokio::test]
async fn test_send_chain_is_separate_from_receive() {
    let host = host(&[(
        "signer",
        r#"
        on_send(|m| { m.signed = true; m });
        on_receive(|m| { m.seen = true; m });
        "#,
    )]);
    host.set_plugins(&urls(&["signer"])).await.unwrap();
    let hooks = host.hooks().unwrap();
    assert_eq!(
        hooks.send(json!({"text": "out"})).await.unwrap(),
        Some(json!({"text": "out", "signed": true}))
    );
    assert_eq!(
        hooks.receive(json!({"text": "in"})).await.unwrap(),
        Some(json!({"text": "in", "seen": true}))
    );
}

#[tokio::test]
async fn test_drop_short_circuits_chain() {
    let host = host(&[
        (
            "filter",
            r#"on_receive(|m| if m.payload == "spam" { false } else { m });"#,
        ),
        ("tagger", P1),
    ]);
    host.set_plugins(&urls(&["filter", "tagger"])).await.unwrap();
    let hooks = host.hooks().unwrap();
    assert_eq!(hooks.receive(json!({"payload": "spam"})).await.unwrap(), None);
    assert_eq!(
        hooks.receive(json!({"payload": "ham"})).await.unwrap(),
        Some(json!({"payload": "ham [p1]"}))
    );
}

#[tokio::test]
async fn test_commands_and_apps() {
    let host = host(&[(
        "tools",
        r#"
        on_command("ping", || "pong");
        on_command("roll", |count, sides| #{ count: count, sides: sides });
        on_app("clock", || #{ html: "<time>now</time>" });
        "#,
    )]);
    host.set_plugins(&urls(&["tools"])).await.unwrap();
    let hooks = host.hooks().unwrap();

    assert_eq!(hooks.command("ping", vec![]).await.unwrap(), Some(json!("pong")));
    assert_eq!(
        hooks
            .command("roll", vec![json!(2), json!("d6")])
            .await
            .unwrap(),
        Some(json!({"count": 2, "sides": "d6"}))
    );
    assert_eq!(hooks.command("missing", vec![]).await.unwrap(), None);

    assert_eq!(
        hooks.app("clock").await.unwrap(),
        Some(AppView {
            html: "<time>now</time>".into()
        })
    );
    assert_eq!(hooks.app("calendar").await.unwrap(), None);
}

#[tokio::test]
async fn test_unparsable_plugin_does_not_block_others() {
    let host = host(&[("broken", "function("), ("p1", P1)]);
    let outcome = host.set_plugins(&urls(&["broken", "p1"])).await.unwrap();
    let BuildOutcome::Built(status) = outcome else {
        panic!("expected a build");
    };
    assert_eq!(status.rejected, vec!["broken"]);
    assert_eq!(status.plugins, vec!["p1"]);

    let out = host
        .hooks()
        .unwrap()
        .receive(json!({"payload": "hi"}))
        .await
        .unwrap();
    assert_eq!(out, Some(json!({"payload": "hi [p1]"})));
}

#[tokio::test]
async fn test_only_unparsable_plugins_pass_through() {
    let host = host(&[("broken", "function(")]);
    host.set_plugins(&urls(&["broken"])).await.unwrap();
    let out = host
        .hooks()
        .expect("instance still built")
        .receive(json!({"payload": "hi"}))
        .await
        .unwrap();
    assert_eq!(out, Some(json!({"payload": "hi"})));
}

#[tokio::test]
async fn test_empty_set_disables_hooks() {
    let host = host(&[("p1", P1)]);
    assert!(host.hooks().is_none());

    assert_eq!(host.set_plugins(&[]).await.unwrap(), BuildOutcome::Empty);
    assert!(host.hooks().is_none());

    host.set_plugins(&urls(&["p1"])).await.unwrap();
    assert!(host.hooks().is_some());

    // Every fetch failing counts as empty
    assert_eq!(
        host.set_plugins(&urls(&["nowhere"])).await.unwrap(),
        BuildOutcome::Empty
    );
    assert!(host.hooks().is_none());
}

#[tokio::test]
async fn test_hook_error_fails_only_that_request() {
    let host = host(&[(
        "flaky",
        r#"on_receive(|m| { if m.payload == "boom" { throw "exploded"; } m });"#,
    )]);
    host.set_plugins(&urls(&["flaky"])).await.unwrap();
    let hooks = host.hooks().unwrap();

    let err = hooks.receive(json!({"payload": "boom"})).await.unwrap_err();
    match err {
        SandboxError::Hook { hook, message } => {
            assert_eq!(hook, "receive");
            assert!(message.contains("exploded"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        hooks.receive(json!({"payload": "fine"})).await.unwrap(),
        Some(json!({"payload": "fine"}))
    );
}

#[tokio::test]
async fn test_oversized_array_fails_only_that_request() {
    let host = host(&[
        (
            "grow",
            r#"on_command("grow", || {
                let a = construct(Array, [1]);
                a.length = 1000000000000000;
                invoke(a, "join", [","])
            });"#,
        ),
        ("p1", P1),
    ]);
    host.set_plugins(&urls(&["grow", "p1"])).await.unwrap();
    let hooks = host.hooks().unwrap();

    let err = hooks.command("grow", vec![]).await.unwrap_err();
    match err {
        SandboxError::Hook { hook, message } => {
            assert_eq!(hook, "command:grow");
            assert!(message.contains("RangeError"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        hooks.receive(json!({"payload": "hi"})).await.unwrap(),
        Some(json!({"payload": "hi [p1]"}))
    );
}

#[tokio::test]
async fn test_hooks_registered_at_runtime_belong_to_their_plugin() {
    let host = host(&[
        (
            "lazy",
            r#"on_command("arm", || {
                on_receive(|m| { m.payload += " [lazy]"; m });
                true
            });"#,
        ),
        ("p1", P1),
    ]);
    host.set_plugins(&urls(&["lazy", "p1"])).await.unwrap();
    let hooks = host.hooks().unwrap();

    assert_eq!(
        hooks.receive(json!({"payload": "hi"})).await.unwrap(),
        Some(json!({"payload": "hi [p1]"}))
    );
    assert_eq!(hooks.command("arm", vec![]).await.unwrap(), Some(json!(true)));
    for _ in 0..2 {
        assert_eq!(
            hooks.receive(json!({"payload": "hi"})).await.unwrap(),
            Some(json!({"payload": "hi [p1] [lazy]"}))
        );
    }
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let host = host(&[("p1", P1)]);
    host.set_plugins(&urls(&["p1"])).await.unwrap();
    let hooks = host.hooks().unwrap();

    let calls = (0..16).map(|i| {
        let hooks = hooks.clone();
        async move { hooks.receive(json!({"payload": format!("m{i}")})).await }
    });
    let replies = futures::future::join_all(calls).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(
            reply.unwrap(),
            Some(json!({"payload": format!("m{i} [p1]")}))
        );
    }
    assert_eq!(host.pending_count(), 0);
}

#[tokio::test]
async fn test_rebuild_rejects_in_flight_requests() {
    let host = host(&[
        (
            "slow",
            r#"
            on_receive(|m| {
                let start = invoke(Date, "now", []);
                while invoke(Date, "now", []) - start < 1500 {}
                m
            });
            "#,
        ),
        ("p1", P1),
    ]);
    host.set_plugins(&urls(&["slow"])).await.unwrap();
    let hooks = host.hooks().unwrap();

    let in_flight = tokio::spawn({
        let hooks = hooks.clone();
        async move { hooks.receive(json!({"payload": "late"})).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.pending_count(), 1);

    host.set_plugins(&urls(&["p1"])).await.unwrap();
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, SandboxError::Rebuilt { .. }));
    assert!(err.is_stale());

    // Handles taken before the rebuild reach the new instance
    assert_eq!(
        hooks.receive(json!({"payload": "hi"})).await.unwrap(),
        Some(json!({"payload": "hi [p1]"}))
    );
}

#[tokio::test]
async fn test_identical_content_skips_rebuild() {
    let host = host(&[("p1", P1), ("p2", P2)]);
    let BuildOutcome::Built(first) = host.set_plugins(&urls(&["p1"])).await.unwrap() else {
        panic!("expected a build");
    };
    assert_eq!(
        host.set_plugins(&urls(&["p1"])).await.unwrap(),
        BuildOutcome::Unchanged
    );
    assert_eq!(host.status().unwrap().sandbox, first.sandbox);

    let BuildOutcome::Built(second) = host.set_plugins(&urls(&["p1", "p2"])).await.unwrap() else {
        panic!("expected a rebuild");
    };
    assert_ne!(second.sandbox, first.sandbox);
    assert_ne!(second.address, first.address);
}

#[tokio::test]
async fn test_watch_rebuilds_on_change() {
    let host = Arc::new(host(&[("p1", P1), ("p2", P2)]));
    let (tx, rx) = tokio::sync::watch::channel(urls(&["p1"]));
    let watcher = host.watch(rx);

    let plugins = wait_for_plugins(&host, &["p1"]).await;
    assert_eq!(plugins, vec!["p1"]);

    tx.send(urls(&["p1", "p2"])).unwrap();
    let plugins = wait_for_plugins(&host, &["p1", "p2"]).await;
    assert_eq!(plugins, vec!["p1", "p2"]);

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .expect("watcher exits when the sender is dropped")
        .unwrap();
}

async fn wait_for_plugins(host: &PluginHost, expected: &[&str]) -> Vec<String> {
    for _ in 0..200 {
        if let Some(status) = host.status() {
            if status.plugins == expected {
                return status.plugins;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("plugin set never became {expected:?}");
}

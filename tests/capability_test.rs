// tests/capability_test.rs — Integration test: what plugin code can and cannot touch

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;

use plugbox::infra::config::SandboxConfig;
use plugbox::infra::errors::SandboxError;
use plugbox::sandbox::capability::CapabilityFilter;
use plugbox::sandbox::object::Value;
use plugbox::sandbox::realm::Realm;
use plugbox::sandbox::{BuildOutcome, PluginHost, PluginLoader, SourceFetcher};

struct InlineScripts(HashMap<String, String>);

#[async_trait]
impl SourceFetcher for InlineScripts {
    async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        let name = url.path().trim_start_matches('/').to_string();
        let script = self
            .0
            .get(&name)
            .ok_or_else(|| anyhow::anyhow!("no such plugin: {name}"))?;
        Ok(json!({"type": "script", "name": name, "script": script}).to_string())
    }
}

async fn start(scripts: &[(&str, &str)]) -> (PluginHost, BuildOutcome) {
    let fetcher = InlineScripts(
        scripts
            .iter()
            .map(|(n, s)| (n.to_string(), s.to_string()))
            .collect(),
    );
    let host = PluginHost::new(
        PluginLoader::new(Arc::new(fetcher)),
        &SandboxConfig::default(),
    );
    let urls: Vec<String> = scripts
        .iter()
        .map(|(n, _)| format!("https://plugins.test/{n}"))
        .collect();
    let outcome = host.set_plugins(&urls).await.unwrap();
    (host, outcome)
}

#[tokio::test]
async fn test_vandalism_is_invisible_to_other_plugins() {
    let (host, _) = start(&[
        (
            "vandal",
            r#"
            let m = Math;
            m.max = 1;
            let proto = Object.prototype;
            proto.polluted = true;
            let aproto = Array.prototype;
            aproto.push = 1;
            let g = globalThis;
            g.Math = 1;
            g.injected = 1;
            remove(JSON, "parse");
            let secret = 42;
            "#,
        ),
        (
            "observer",
            r#"
            on_receive(|m| {
                m.max_ok = is_callable(Math.max);
                m.polluted = "polluted" in Object.prototype;
                m.push_ok = is_callable(Array.prototype.push);
                m.injected = "injected" in globalThis;
                m.secret = "secret" in globalThis;
                m.json_ok = "parse" in JSON;
                m.math_frozen = is_frozen(Math);
                m
            });
            "#,
        ),
    ])
    .await;

    let out = host.hooks().unwrap().receive(json!({})).await.unwrap();
    assert_eq!(
        out,
        Some(json!({
            "max_ok": true,
            "polluted": false,
            "push_ok": true,
            "injected": false,
            "secret": false,
            "json_ok": true,
            "math_frozen": true
        }))
    );
}

#[tokio::test]
async fn test_constructed_instances_stay_writable() {
    let (host, _) = start(&[(
        "regex",
        r#"
        on_command("probe", |pattern, text| {
            let re = construct(RegExp, [pattern]);
            let matched = invoke(re, "test", [text]);
            re.lastIndex = 7;
            #{
                matched: matched,
                own_writable: re.lastIndex == 7,
                proto_frozen: is_frozen(prototype_of(re)),
                instance_frozen: is_frozen(re),
            }
        });
        "#,
    )])
    .await;

    let out = host
        .hooks()
        .unwrap()
        .command("probe", vec![json!("b+"), json!("abbbc")])
        .await
        .unwrap();
    assert_eq!(
        out,
        Some(json!({
            "matched": true,
            "own_writable": true,
            "proto_frozen": true,
            "instance_frozen": false
        }))
    );
}

#[tokio::test]
async fn test_dynamic_code_is_refused() {
    let (host, outcome) = start(&[
        ("evaluator", r#"let x = eval("1 + 1");"#),
        ("builder", r#"on_command("dyn", || invoke(Function, ["return 1"]));"#),
    ])
    .await;

    let BuildOutcome::Built(status) = outcome else {
        panic!("expected a build");
    };
    assert_eq!(status.rejected, vec!["evaluator"]);

    let err = host
        .hooks()
        .unwrap()
        .command("dyn", vec![])
        .await
        .unwrap_err();
    match err {
        SandboxError::Hook { hook, message } => {
            assert_eq!(hook, "command:dyn");
            assert!(message.contains("TypeError"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_host_objects_are_live_read_only_views() {
    let realm = Realm::new();
    let filter = CapabilityFilter::new();

    let inner = realm.prototypes.new_object();
    let record = realm.prototypes.new_object();
    record.set("count", Value::Int(1));
    record.set("inner", Value::Object(inner.clone()));

    let exposed = filter.wrap(Value::Object(record.clone()));
    let view = exposed.as_object().unwrap();
    assert!(!view.set("count", Value::Int(99)));
    assert!(!view.delete_property("count"));
    assert!(!view.set_prototype_of(None));

    // Host-side updates show through
    record.set("count", Value::Int(2));
    assert_eq!(view.get("count"), Value::Int(2));

    // Nested objects come back guarded, and always as the same proxy
    let nested = view.get("inner");
    assert!(!nested.as_object().unwrap().set("x", Value::Int(1)));
    assert_eq!(view.get("inner"), nested);
    assert_eq!(filter.wrap(Value::Object(record.clone())), exposed);

    // The host keeps full access
    assert!(inner.set("x", Value::Int(1)));
    assert_eq!(nested.as_object().unwrap().get("x"), Value::Int(1));

    filter.release();
    assert_eq!(filter.proxy_count(), 0);
    realm.release();
}

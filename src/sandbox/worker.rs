// src/sandbox/worker.rs — Sandbox worker (inner boundary)
//
// One OS thread per sandbox instance. The thread owns the engine, the realm,
// the capability filter and the hook registry; none of it is `Send`, so the
// only way in or out is a JSON string on a channel.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;

use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use tokio::sync::mpsc::UnboundedSender;

use crate::infra::config::SandboxConfig;
use crate::infra::errors::SandboxError;
use crate::sandbox::builder::ScriptUnit;
use crate::sandbox::capability::CapabilityFilter;
use crate::sandbox::convert::{dynamic_to_json, json_to_dynamic, value_to_dynamic};
use crate::sandbox::engine::{self, ScriptHost};
use crate::sandbox::object::{ObjectRef, Property, Value};
use crate::sandbox::protocol::{Message, ReadyReport, Reply, Request, SandboxId, WorkerMessage};
use crate::sandbox::realm::{Realm, SandboxGlobal};
use crate::sandbox::registry::{Chain, HookHandler};

/// What a worker needs to boot.
pub struct WorkerSpec {
    pub sandbox: SandboxId,
    pub bootstrap: String,
    pub plugins: Vec<ScriptUnit>,
    pub config: SandboxConfig,
}

/// Host-side handle to a running worker thread.
pub struct WorkerHandle {
    inbox: mpsc::Sender<String>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Queue a serialized request. Fails once the worker has exited.
    pub fn post(&self, body: String) -> Result<(), SandboxError> {
        self.inbox.send(body).map_err(|_| SandboxError::Closed)
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }
}

/// Start a worker. Its messages arrive on `outbound` as JSON strings; the
/// channel closes when the worker exits.
pub fn spawn(
    spec: WorkerSpec,
    outbound: UnboundedSender<String>,
) -> Result<WorkerHandle, SandboxError> {
    let (inbox, requests) = mpsc::channel::<String>();
    let thread = std::thread::Builder::new()
        .name(format!("plugbox-worker-{}", spec.sandbox.short()))
        .spawn(move || run(spec, requests, outbound))
        .map_err(|e| SandboxError::Spawn(e.to_string()))?;
    Ok(WorkerHandle { inbox, thread })
}

fn post(outbound: &UnboundedSender<String>, message: &WorkerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(body) => outbound.send(body).is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize worker message: {}", e);
            true
        }
    }
}

fn run(spec: WorkerSpec, requests: Receiver<String>, outbound: UnboundedSender<String>) {
    let sandbox = spec.sandbox;
    let (worker, report) = match Worker::boot(spec) {
        Ok(booted) => booted,
        Err(e) => {
            tracing::error!("Sandbox {} failed to boot: {}", sandbox.short(), e);
            return;
        }
    };

    if post(&outbound, &WorkerMessage::Ready(report)) {
        for raw in requests.iter() {
            let request: Request = match serde_json::from_str(&raw) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("Sandbox {} dropped malformed request: {}", sandbox.short(), e);
                    continue;
                }
            };
            let reply = worker.dispatch(request);
            if !post(&outbound, &WorkerMessage::Reply(reply)) {
                break;
            }
        }
    }

    worker.release();
    tracing::debug!("Sandbox {} worker exited", sandbox.short());
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    engine: Engine,
    host: Rc<ScriptHost>,
    realm: Realm,
    filter: Rc<CapabilityFilter>,
    /// One merged AST per admitted plugin, indexed like the registry's `plugin`.
    asts: Vec<AST>,
}

impl Worker {
    /// Freeze the capability set, then run every plugin body once.
    fn boot(spec: WorkerSpec) -> Result<(Self, ReadyReport), SandboxError> {
        let realm = Realm::new();
        let filter = CapabilityFilter::new();
        for obj in realm.capability_set() {
            filter.freeze_walk(&obj);
        }

        let host = ScriptHost::new(realm.prototypes.clone());
        let mut engine = engine::create_engine(&spec.config);
        engine::register_host_api(&mut engine, &host);
        let prelude = engine
            .compile(&spec.bootstrap)
            .map_err(|e| SandboxError::Spawn(format!("bootstrap does not parse: {e}")))?;

        let global = sandbox_global(&realm, &filter, spec.sandbox, spec.plugins.len());

        let mut worker = Self {
            engine,
            host,
            realm,
            filter,
            asts: Vec::with_capacity(spec.plugins.len()),
        };
        let mut report = ReadyReport::default();

        for (index, unit) in spec.plugins.into_iter().enumerate() {
            worker.host.enter_plugin(index);
            let mut ast = match worker.engine.compile(&unit.source) {
                Ok(body) => prelude.merge(&body),
                Err(e) => {
                    tracing::warn!("Plugin '{}' does not parse: {}", unit.name, e);
                    report.failed.push(unit.name);
                    worker.asts.push(prelude.clone());
                    continue;
                }
            };
            ast.set_source(unit.name.as_str());

            let mut scope = plugin_scope(&global);
            match worker.engine.run_ast_with_scope(&mut scope, &ast) {
                Ok(()) => report.plugins.push(unit.name),
                Err(e) => {
                    // Hooks registered before the error stay registered
                    tracing::warn!("Plugin '{}' raised during load: {}", unit.name, e);
                    report.failed.push(unit.name);
                }
            }
            worker.asts.push(ast);
        }

        report.hooks = worker.host.registry.borrow().status_summary();
        tracing::info!(
            "Sandbox {} ready: {} plugins, {}",
            spec.sandbox.short(),
            report.plugins.len(),
            report.hooks
        );
        Ok((worker, report))
    }

    fn dispatch(&self, request: Request) -> Reply {
        let id = request.id();
        let hook = request.hook_name();
        let result = match request {
            Request::Message { msg, .. } => self.run_chain(Chain::Receive, msg),
            Request::SendMessage { msg, .. } => self.run_chain(Chain::Send, msg),
            Request::Command { name, args, .. } => self.run_command(&name, &args),
            Request::App { name, .. } => self.run_app(&name),
        };
        match result {
            Ok(msg) => Reply::ok(id, msg),
            Err(e) => {
                tracing::warn!("Hook '{}' failed: {}", hook, e);
                Reply::failed(id, e.to_string())
            }
        }
    }

    /// Run a chain in registration order. A falsy result drops the message
    /// and skips the remaining handlers.
    fn run_chain(&self, chain: Chain, msg: Message) -> Result<Message, Box<EvalAltResult>> {
        let handlers = self.host.registry.borrow().chain(chain);
        let mut current = json_to_dynamic(&msg);
        for handler in &handlers {
            current = self.call(handler, vec![current])?;
            if engine::is_stop_sentinel(&current) {
                tracing::debug!("Plugin #{} dropped the message", handler.plugin);
                return Ok(Message::Null);
            }
        }
        Ok(dynamic_to_json(&current).map_err(|e| e.to_string())?)
    }

    fn run_command(
        &self,
        name: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, Box<EvalAltResult>> {
        let Some(handler) = self.host.registry.borrow().command(name) else {
            return Ok(serde_json::Value::Null);
        };
        let mut args: Vec<Dynamic> = args.iter().map(json_to_dynamic).collect();
        // Spread to the handler's declared parameters
        if let Some(arity) = self
            .asts
            .get(handler.plugin)
            .and_then(|ast| engine::handler_arity(ast, &handler.callback))
        {
            args.resize(arity, Dynamic::UNIT);
        }
        let result = self.call(&handler, args)?;
        Ok(dynamic_to_json(&result).map_err(|e| e.to_string())?)
    }

    fn run_app(&self, name: &str) -> Result<serde_json::Value, Box<EvalAltResult>> {
        let Some(handler) = self.host.registry.borrow().app(name) else {
            return Ok(serde_json::Value::Null);
        };
        let result = self.call(&handler, Vec::new())?;
        Ok(dynamic_to_json(&result).map_err(|e| e.to_string())?)
    }

    fn call(&self, handler: &HookHandler, args: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
        let ast = self
            .asts
            .get(handler.plugin)
            .ok_or_else(|| format!("no plugin #{}", handler.plugin))?;
        // `on` calls made by the handler belong to the handler's plugin
        self.host.enter_plugin(handler.plugin);
        handler.callback.call::<Dynamic>(&self.engine, ast, args)
    }

    fn release(self) {
        self.host.registry.borrow_mut().clear();
        self.filter.release();
        self.realm.release();
    }
}

/// The global plugins see, with per-instance metadata in its local table.
fn sandbox_global(
    realm: &Realm,
    filter: &Rc<CapabilityFilter>,
    sandbox: SandboxId,
    plugin_count: usize,
) -> ObjectRef {
    let info = realm.prototypes.new_object();
    info.define_property("id", Property::constant(Value::Str(sandbox.to_string())));
    info.define_property("plugins", Property::constant(Value::Int(plugin_count as i64)));
    info.define_property("version", Property::constant(env!("CARGO_PKG_VERSION").into()));
    info.freeze();

    let mut local = BTreeMap::new();
    local.insert("sandbox".to_string(), Value::Object(info));
    ObjectRef::new(SandboxGlobal::new(realm.global.clone(), filter.clone(), local))
}

/// A fresh scope per plugin: `globalThis` and every global name as constants.
fn plugin_scope(global: &ObjectRef) -> Scope<'static> {
    let mut scope = Scope::new();
    scope.push_constant_dynamic("globalThis", Dynamic::from(global.clone()));
    for name in global.own_keys() {
        let value = value_to_dynamic(global.get(&name));
        scope.push_constant_dynamic(name, value);
    }
    scope
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

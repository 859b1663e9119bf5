// src/sandbox/engine.rs — Rhai engine factory and host-function table
//
// Plugins are Rhai scripts. Rhai has no I/O of its own; everything a plugin
// can call is registered here. Host objects reach scripts as `HostObject`
// handles and are only ever touched through their traps.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, AST};

use crate::infra::config::SandboxConfig;
use crate::infra::errors::HostError;
use crate::sandbox::convert::{
    array_items, dynamic_to_value, json_to_dynamic, value_to_dynamic, value_to_json, Prototypes,
};
use crate::sandbox::object::{ObjectRef, Property, Value};
use crate::sandbox::registry::{HookHandler, HookKind, HookRegistry};

type ScriptResult<T = Dynamic> = Result<T, Box<EvalAltResult>>;

/// Prelude compiled ahead of every plugin. Identical for every build.
pub const BOOTSTRAP: &str = r#"
fn on_receive(handler) { on("receive", handler) }
fn on_send(handler) { on("send", handler) }
fn on_command(name, handler) { on("command:" + name, handler) }
fn on_app(name, handler) { on("app:" + name, handler) }
"#;

// ---------------------------------------------------------------------------
// Engine factory
// ---------------------------------------------------------------------------

/// Create a Rhai engine with the sandbox's language restrictions.
///
/// This engine has no host functions yet; it is enough for a trial parse.
pub fn create_engine(config: &SandboxConfig) -> Engine {
    let mut engine = Engine::new();

    // Safety limits
    engine.set_max_expr_depths(config.max_expr_depth, config.max_function_expr_depth);
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);
    engine.set_max_map_size(config.max_map_size);

    // No dynamic code, no module loading
    engine.disable_symbol("eval");
    engine.set_module_resolver(DummyModuleResolver::new());

    // print/debug go to the log, never to stdout
    engine.on_print(|text| {
        tracing::info!(target: "plugin", "{}", text);
    });
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "plugin", "{} ({}@{})", text, source.unwrap_or("plugin"), pos);
    });

    engine
}

// ---------------------------------------------------------------------------
// ScriptHost — state shared by the registered host functions
// ---------------------------------------------------------------------------

pub struct ScriptHost {
    pub prototypes: Prototypes,
    pub registry: RefCell<HookRegistry>,
    current_plugin: Cell<usize>,
}

impl ScriptHost {
    pub fn new(prototypes: Prototypes) -> Rc<Self> {
        Rc::new(Self {
            prototypes,
            registry: RefCell::new(HookRegistry::new()),
            current_plugin: Cell::new(0),
        })
    }

    /// Attribute subsequent `on` registrations to plugin `index`.
    pub fn enter_plugin(&self, index: usize) {
        self.current_plugin.set(index);
    }

    fn to_host(&self, value: Dynamic) -> Value {
        dynamic_to_value(value, &self.prototypes)
    }

    fn to_host_args(&self, args: Array) -> Vec<Value> {
        args.into_iter().map(|a| self.to_host(a)).collect()
    }
}

fn script_error(err: HostError) -> Box<EvalAltResult> {
    err.to_string().into()
}

fn call_object(host: &ScriptHost, f: &ObjectRef, this: Value, args: Array) -> ScriptResult {
    let args = host.to_host_args(args);
    f.call(&this, &args).map(value_to_dynamic).map_err(script_error)
}

fn invoke_method(host: &ScriptHost, obj: ObjectRef, method: &str, args: Array) -> ScriptResult {
    let Value::Object(f) = obj.get(method) else {
        return Err(script_error(HostError::NotCallable(format!(
            "{}.{}",
            obj.class_name(),
            method
        ))));
    };
    call_object(host, &f, Value::Object(obj), args)
}

fn construct_object(host: &ScriptHost, f: &ObjectRef, args: Array) -> ScriptResult {
    let args = host.to_host_args(args);
    f.construct(&args).map(value_to_dynamic).map_err(script_error)
}

// ---------------------------------------------------------------------------
// Host-function table
// ---------------------------------------------------------------------------

/// Register every function a plugin may call.
pub fn register_host_api(engine: &mut Engine, host: &Rc<ScriptHost>) {
    register_hooks(engine, host);
    register_object_access(engine, host);
    register_calls(engine, host);
    register_reflection(engine, host);
    register_logging(engine);
}

fn register_hooks(engine: &mut Engine, host: &Rc<ScriptHost>) {
    let h = host.clone();
    engine.register_fn("on", move |event: &str, handler: FnPtr| -> ScriptResult<()> {
        let kind =
            HookKind::parse(event).ok_or_else(|| format!("unknown hook event '{event}'"))?;
        let handler = HookHandler {
            plugin: h.current_plugin.get(),
            callback: handler,
        };
        h.registry.borrow_mut().register(kind, handler);
        Ok(())
    });
}

fn register_object_access(engine: &mut Engine, host: &Rc<ScriptHost>) {
    engine
        .register_type_with_name::<ObjectRef>("HostObject")
        .register_fn("to_string", |obj: &mut ObjectRef| {
            Value::Object(obj.clone()).to_display()
        })
        .register_fn("to_debug", |obj: &mut ObjectRef| format!("{obj:?}"))
        .register_fn("==", |a: ObjectRef, b: ObjectRef| a.ptr_eq(&b))
        .register_fn("!=", |a: ObjectRef, b: ObjectRef| !a.ptr_eq(&b))
        .register_fn("contains", |obj: ObjectRef, key: ImmutableString| obj.has(&key))
        .register_fn("contains", |obj: ObjectRef, index: i64| obj.has(&index.to_string()));

    // Reads; `obj.name` falls back to the string indexer
    engine.register_indexer_get(|obj: &mut ObjectRef, key: ImmutableString| -> Dynamic {
        value_to_dynamic(obj.get(&key))
    });
    engine.register_indexer_get(|obj: &mut ObjectRef, index: i64| -> Dynamic {
        value_to_dynamic(obj.get(&index.to_string()))
    });

    // Writes; refused writes are silent
    let h = host.clone();
    engine.register_indexer_set(
        move |obj: &mut ObjectRef, key: ImmutableString, value: Dynamic| {
            if !obj.set(&key, h.to_host(value)) {
                tracing::trace!("Plugin write to '{}' refused", key);
            }
        },
    );
    let h = host.clone();
    engine.register_indexer_set(move |obj: &mut ObjectRef, index: i64, value: Dynamic| {
        if !obj.set(&index.to_string(), h.to_host(value)) {
            tracing::trace!("Plugin write to [{}] refused", index);
        }
    });
}

fn register_calls(engine: &mut Engine, host: &Rc<ScriptHost>) {
    let h = host.clone();
    engine.register_fn("invoke", move |f: ObjectRef| -> ScriptResult {
        call_object(&h, &f, Value::Null, Array::new())
    });
    let h = host.clone();
    engine.register_fn("invoke", move |f: ObjectRef, args: Array| -> ScriptResult {
        call_object(&h, &f, Value::Null, args)
    });
    let h = host.clone();
    engine.register_fn("invoke", move |obj: ObjectRef, method: &str| -> ScriptResult {
        invoke_method(&h, obj, method, Array::new())
    });
    let h = host.clone();
    engine.register_fn(
        "invoke",
        move |obj: ObjectRef, method: &str, args: Array| -> ScriptResult {
            invoke_method(&h, obj, method, args)
        },
    );

    let h = host.clone();
    engine.register_fn("construct", move |f: ObjectRef| -> ScriptResult {
        construct_object(&h, &f, Array::new())
    });
    let h = host.clone();
    engine.register_fn("construct", move |f: ObjectRef, args: Array| -> ScriptResult {
        construct_object(&h, &f, args)
    });
}

fn register_reflection(engine: &mut Engine, host: &Rc<ScriptHost>) {
    engine
        .register_fn("keys", |obj: ObjectRef| -> Array {
            obj.own_keys()
                .into_iter()
                .filter(|k| obj.get_own_property(k).is_some_and(|p| p.enumerable))
                .map(Dynamic::from)
                .collect()
        })
        .register_fn("prototype_of", |obj: ObjectRef| -> Dynamic {
            obj.get_prototype_of()
                .map(Dynamic::from)
                .unwrap_or(Dynamic::UNIT)
        })
        .register_fn("set_prototype_of", |obj: ObjectRef, proto: ObjectRef| {
            obj.set_prototype_of(Some(proto))
        })
        .register_fn("set_prototype_of", |obj: ObjectRef, _proto: ()| {
            obj.set_prototype_of(None)
        })
        .register_fn("remove", |obj: ObjectRef, key: &str| obj.delete_property(key))
        .register_fn("prevent_extensions", |obj: ObjectRef| obj.prevent_extensions())
        .register_fn("is_frozen", |obj: ObjectRef| obj.is_frozen())
        .register_fn("is_extensible", |obj: ObjectRef| obj.is_extensible())
        .register_fn("is_callable", |obj: ObjectRef| obj.is_callable())
        .register_fn("to_map", |obj: ObjectRef| -> ScriptResult {
            value_to_json(&Value::Object(obj))
                .map(|json| json_to_dynamic(&json))
                .map_err(script_error)
        })
        .register_fn("to_array", |obj: ObjectRef| -> ScriptResult<Array> {
            let items = array_items(&obj).map_err(script_error)?;
            Ok(items.into_iter().map(value_to_dynamic).collect())
        });

    let h = host.clone();
    engine.register_fn(
        "define",
        move |obj: ObjectRef, key: &str, value: Dynamic| -> bool {
            obj.define_property(key, Property::data(h.to_host(value)))
        },
    );
}

fn register_logging(engine: &mut Engine) {
    engine.register_fn("log", |msg: &str| {
        tracing::info!(target: "plugin", "{}", msg);
    });
    engine.register_fn("log_debug", |msg: &str| {
        tracing::debug!(target: "plugin", "{}", msg);
    });
    engine.register_fn("log_warn", |msg: &str| {
        tracing::warn!(target: "plugin", "{}", msg);
    });
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Number of arguments a handler declares, not counting captured variables.
///
/// `None` when the handler does not name a script function in `ast`.
pub fn handler_arity(ast: &AST, callback: &FnPtr) -> Option<usize> {
    let curried = callback.curry().len();
    ast.iter_functions()
        .filter(|f| f.name == callback.fn_name())
        .map(|f| f.params.len().saturating_sub(curried))
        .max()
}

/// A hook result that stops a chain: unit, `false`, zero, NaN or `""`.
pub fn is_stop_sentinel(value: &Dynamic) -> bool {
    let value = value.flatten_clone();
    if value.is_unit() {
        return true;
    }
    if let Ok(b) = value.as_bool() {
        return !b;
    }
    if let Ok(i) = value.as_int() {
        return i == 0;
    }
    if let Ok(f) = value.as_float() {
        return f == 0.0 || f.is_nan();
    }
    if value.is_string() {
        return value.into_immutable_string().map_or(false, |s| s.is_empty());
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

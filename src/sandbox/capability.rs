// src/sandbox/capability.rs — Capability filter (read-only proxies)
//
// Everything the host hands to plugin code goes through `wrap`. A wrapped
// object forwards reads and calls to the original and refuses every mutation
// by returning `false`. Refusals are silent on the plugin side: no error, no
// timing difference worth probing.
//
// State (the processed set and the proxy cache) belongs to one sandbox
// instance and is dropped with it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::infra::errors::HostError;
use crate::sandbox::object::{HostResult, Object, ObjectId, ObjectRef, Property, Value};

// ---------------------------------------------------------------------------
// CapabilityFilter
// ---------------------------------------------------------------------------

pub struct CapabilityFilter {
    /// Objects already visited by `freeze_walk`. Holding the handle keeps the
    /// identity stable for the lifetime of the instance.
    processed: RefCell<HashMap<ObjectId, ObjectRef>>,
    /// Original identity -> its read-only proxy.
    proxies: RefCell<HashMap<ObjectId, ObjectRef>>,
    this: Weak<CapabilityFilter>,
}

impl CapabilityFilter {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            processed: RefCell::new(HashMap::new()),
            proxies: RefCell::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Deep-freeze `obj`: wrap every own property value, then freeze.
    ///
    /// Idempotent. Objects already frozen by someone else are left alone.
    pub fn freeze_walk(&self, obj: &ObjectRef) {
        if self.processed.borrow().contains_key(&obj.id()) || obj.is_frozen() {
            return;
        }
        self.processed.borrow_mut().insert(obj.id(), obj.clone());

        for key in obj.own_keys() {
            let Some(prop) = obj.get_own_property(&key) else {
                continue;
            };
            let wrapped = self.wrap(prop.value.clone());
            // Non-configurable, non-writable slots refuse redefinition; keep them
            let _ = obj.define_property(
                &key,
                Property {
                    value: wrapped,
                    ..prop
                },
            );
        }
        obj.freeze();
    }

    /// Return a value that plugin code may hold.
    ///
    /// Primitives pass through. Objects come back as their cached proxy, or
    /// unchanged when they are already a proxy or already frozen.
    pub fn wrap(&self, value: Value) -> Value {
        let Value::Object(obj) = value else {
            return value;
        };
        if let Some(proxy) = self.proxies.borrow().get(&obj.id()) {
            return Value::Object(proxy.clone());
        }
        if obj.proxy_target().is_some() || obj.is_frozen() {
            return Value::Object(obj);
        }

        let proxy = ObjectRef::new(ReadOnlyProxy {
            target: obj.clone(),
            filter: self.this.clone(),
        });
        self.proxies.borrow_mut().insert(obj.id(), proxy.clone());
        Value::Object(proxy)
    }

    /// Strip one proxy layer, exposing the original to host code.
    pub fn unwrap(value: &Value) -> Value {
        match value {
            Value::Object(obj) => match obj.proxy_target() {
                Some(target) => Value::Object(target),
                None => value.clone(),
            },
            other => other.clone(),
        }
    }

    /// Freeze the prototype of a value produced by a guarded call, so that
    /// fresh instances cannot be used to reach a mutable shared prototype.
    fn seal_prototype(&self, value: &Value) {
        if let Some(proto) = value.as_object().and_then(|o| o.get_prototype_of()) {
            self.freeze_walk(&proto);
        }
    }

    pub fn is_processed(&self, obj: &ObjectRef) -> bool {
        self.processed.borrow().contains_key(&obj.id())
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.borrow().len()
    }

    /// Teardown: forget every proxy and break the graphs reachable from
    /// processed objects so reference cycles do not outlive the instance.
    pub fn release(&self) {
        let processed: Vec<ObjectRef> = self.processed.borrow_mut().drain().map(|(_, o)| o).collect();
        let proxies: Vec<ObjectRef> = self.proxies.borrow_mut().drain().map(|(_, p)| p).collect();
        for obj in processed.iter().chain(proxies.iter()) {
            obj.release();
        }
        tracing::debug!(
            "Released capability filter ({} frozen, {} proxies)",
            processed.len(),
            proxies.len()
        );
    }
}

// ---------------------------------------------------------------------------
// ReadOnlyProxy
// ---------------------------------------------------------------------------

/// Read-only view of a host object.
pub struct ReadOnlyProxy {
    target: ObjectRef,
    filter: Weak<CapabilityFilter>,
}

impl ReadOnlyProxy {
    fn wrap(&self, value: Value) -> Value {
        match self.filter.upgrade() {
            Some(filter) => filter.wrap(value),
            // The instance is gone: expose nothing
            None if value.is_primitive() => value,
            None => Value::Null,
        }
    }

    fn deny(&self, trap: &str, key: &str) -> bool {
        tracing::trace!("Denied {} '{}' on read-only {}", trap, key, self.target.class_name());
        false
    }
}

impl Object for ReadOnlyProxy {
    fn class_name(&self) -> &str {
        self.target.class_name()
    }

    fn get(&self, key: &str) -> Value {
        self.wrap(self.target.get(key))
    }

    fn has(&self, key: &str) -> bool {
        self.target.has(key)
    }

    fn get_own_property(&self, key: &str) -> Option<Property> {
        self.target.get_own_property(key).map(|prop| Property {
            value: self.wrap(prop.value.clone()),
            ..prop
        })
    }

    fn own_keys(&self) -> Vec<String> {
        self.target.own_keys()
    }

    fn get_prototype_of(&self) -> Option<ObjectRef> {
        let proto = self.target.get_prototype_of()?;
        match self.wrap(Value::Object(proto)) {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    fn is_extensible(&self) -> bool {
        self.target.is_extensible()
    }

    fn is_frozen(&self) -> bool {
        self.target.is_frozen()
    }

    fn set(&self, key: &str, _value: Value) -> bool {
        self.deny("set", key)
    }

    fn define_property(&self, key: &str, _prop: Property) -> bool {
        self.deny("define", key)
    }

    fn delete_property(&self, key: &str) -> bool {
        self.deny("delete", key)
    }

    fn set_prototype_of(&self, _proto: Option<ObjectRef>) -> bool {
        self.deny("set_prototype_of", "")
    }

    fn prevent_extensions(&self) -> bool {
        self.deny("prevent_extensions", "")
    }

    fn freeze(&self) -> bool {
        self.deny("freeze", "")
    }

    fn is_callable(&self) -> bool {
        self.target.is_callable()
    }

    fn is_constructor(&self) -> bool {
        self.target.is_constructor()
    }

    fn call(&self, this: &Value, args: &[Value]) -> HostResult {
        let this = CapabilityFilter::unwrap(this);
        let args: Vec<Value> = args.iter().map(CapabilityFilter::unwrap).collect();
        let result = self.target.call(&this, &args)?;
        match self.filter.upgrade() {
            Some(filter) => {
                filter.seal_prototype(&result);
                Ok(filter.wrap(result))
            }
            None => Ok(self.wrap(result)),
        }
    }

    /// An instance allocated by this call is returned as-is: it belongs to
    /// the caller, so its own properties stay writable. Its prototype is
    /// frozen first. Any other object the constructor hands back is host
    /// state and gets wrapped like a call result.
    fn construct_instance(&self, args: &[Value]) -> Result<(Value, bool), HostError> {
        let args: Vec<Value> = args.iter().map(CapabilityFilter::unwrap).collect();
        let (instance, fresh) = self.target.construct_instance(&args)?;
        let Some(filter) = self.filter.upgrade() else {
            return Ok((self.wrap(instance), false));
        };
        filter.seal_prototype(&instance);
        if fresh {
            Ok((instance, true))
        } else {
            Ok((filter.wrap(instance), false))
        }
    }

    fn proxy_target(&self) -> Option<ObjectRef> {
        Some(self.target.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

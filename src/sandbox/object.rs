// src/sandbox/object.rs — Host object model
//
// Everything a plugin can reach through the host is either a primitive or an
// ObjectRef. Objects answer a fixed set of traps: reads, mutations (which
// report failure with `false`, never an error) and calls. The capability
// filter implements the same traps to guard the originals.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use crate::infra::errors::HostError;

pub type HostResult = Result<Value, HostError>;

/// Native function body: `(this, args) -> result`.
pub type NativeFn = dyn Fn(&Value, &[Value]) -> HostResult;

/// Prototype chains longer than this are treated as broken.
const MAX_PROTO_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(ObjectRef),
}

impl Value {
    /// Normalize a float result: integral values become `Int`.
    pub fn number(n: f64) -> Value {
        if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            Value::Int(n as i64)
        } else {
            Value::Float(n)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::Object(_))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Object(_) => f64::NAN,
        }
    }

    pub fn to_display(&self) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_number(*f),
            Value::Str(s) => s.clone(),
            Value::Object(o) => format!("[object {}]", o.class_name()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Object(o) if o.is_callable() => "function",
            Value::Object(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Int(a), Value::Int(b)) => a == b,
            (a @ (Value::Int(_) | Value::Float(_)), b @ (Value::Int(_) | Value::Float(_))) => {
                a.to_number() == b.to_number()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.to_display()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::number(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<ObjectRef> for Value {
    fn from(o: ObjectRef) -> Self {
        Value::Object(o)
    }
}

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{sign}Infinity")
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Property {
    pub value: Value,
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
}

impl Property {
    /// Ordinary assignable property.
    pub fn data(value: Value) -> Self {
        Self {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Writable but skipped by `keys` snapshots (methods, internal slots).
    pub fn hidden(value: Value) -> Self {
        Self {
            enumerable: false,
            ..Self::data(value)
        }
    }

    /// Non-writable, non-configurable, non-enumerable.
    pub fn constant(value: Value) -> Self {
        Self {
            value,
            writable: false,
            enumerable: false,
            configurable: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Object trait and handles
// ---------------------------------------------------------------------------

/// Identity of an object: the address of its allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

/// The trap surface shared by ordinary objects and read-only proxies.
pub trait Object {
    fn class_name(&self) -> &str;

    // Read traps
    fn get(&self, key: &str) -> Value;
    fn has(&self, key: &str) -> bool;
    fn get_own_property(&self, key: &str) -> Option<Property>;
    fn own_keys(&self) -> Vec<String>;
    fn get_prototype_of(&self) -> Option<ObjectRef>;
    fn is_extensible(&self) -> bool;
    fn is_frozen(&self) -> bool;

    // Mutation traps: `false` means refused
    fn set(&self, key: &str, value: Value) -> bool;
    fn define_property(&self, key: &str, prop: Property) -> bool;
    fn delete_property(&self, key: &str) -> bool;
    fn set_prototype_of(&self, proto: Option<ObjectRef>) -> bool;
    fn prevent_extensions(&self) -> bool;
    fn freeze(&self) -> bool;

    // Callable traps
    fn is_callable(&self) -> bool {
        false
    }

    fn is_constructor(&self) -> bool {
        false
    }

    fn call(&self, _this: &Value, _args: &[Value]) -> HostResult {
        Err(HostError::NotCallable(self.class_name().to_string()))
    }

    fn construct(&self, args: &[Value]) -> HostResult {
        self.construct_instance(args).map(|(instance, _)| instance)
    }

    /// `construct`, plus whether the result is the instance this call
    /// allocated. A constructor that returns an object of its own reports
    /// `false`.
    fn construct_instance(&self, _args: &[Value]) -> Result<(Value, bool), HostError> {
        Err(HostError::NotConstructor(self.class_name().to_string()))
    }

    /// The guarded original, if this object is a read-only proxy.
    fn proxy_target(&self) -> Option<ObjectRef> {
        None
    }

    /// Drop every outgoing reference. Host-side teardown only.
    fn release(&self) {}
}

/// Shared handle to a host object. Equality is identity.
#[derive(Clone)]
pub struct ObjectRef(Rc<dyn Object>);

impl ObjectRef {
    pub fn new<T: Object + 'static>(object: T) -> Self {
        Self(Rc::new(object))
    }

    pub fn id(&self) -> ObjectId {
        ObjectId(Rc::as_ptr(&self.0) as *const () as usize)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.id() == other.id()
    }
}

impl Deref for ObjectRef {
    type Target = dyn Object;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[object {}]", self.class_name())
    }
}

/// Find a property on `obj` or anywhere on its prototype chain.
pub fn find_property(obj: &ObjectRef, key: &str) -> Option<Property> {
    let mut current = Some(obj.clone());
    for _ in 0..MAX_PROTO_DEPTH {
        let o = current?;
        if let Some(prop) = o.get_own_property(key) {
            return Some(prop);
        }
        current = o.get_prototype_of();
    }
    None
}

// ---------------------------------------------------------------------------
// PlainObject — ordinary objects and native functions
// ---------------------------------------------------------------------------

struct Callable {
    func: Rc<NativeFn>,
    /// Class given to instances when called through `construct`; `None` = not a constructor.
    instance_class: Option<&'static str>,
}

/// An ordinary object: property table, prototype link, extensible flag and an
/// optional native body.
pub struct PlainObject {
    class: &'static str,
    props: RefCell<BTreeMap<String, Property>>,
    proto: RefCell<Option<ObjectRef>>,
    extensible: Cell<bool>,
    callable: Option<Callable>,
}

impl PlainObject {
    pub fn new(class: &'static str, proto: Option<ObjectRef>) -> Self {
        Self {
            class,
            props: RefCell::new(BTreeMap::new()),
            proto: RefCell::new(proto),
            extensible: Cell::new(true),
            callable: None,
        }
    }

    /// A plain callable.
    pub fn function<F>(proto: Option<ObjectRef>, func: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> HostResult + 'static,
    {
        Self {
            callable: Some(Callable {
                func: Rc::new(func),
                instance_class: None,
            }),
            ..Self::new("Function", proto)
        }
    }

    /// A callable that can also `construct`. The body receives the fresh
    /// instance as `this`; returning an object replaces the instance.
    pub fn constructor<F>(proto: Option<ObjectRef>, instance_class: &'static str, func: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> HostResult + 'static,
    {
        Self {
            callable: Some(Callable {
                func: Rc::new(func),
                instance_class: Some(instance_class),
            }),
            ..Self::new("Function", proto)
        }
    }

    /// Builder-style unconditional insert, used while assembling the realm.
    pub fn with(self, key: &str, prop: Property) -> Self {
        self.insert(key, prop);
        self
    }

    /// Unconditional insert that bypasses the traps.
    pub fn insert(&self, key: &str, prop: Property) {
        self.props.borrow_mut().insert(key.to_string(), prop);
    }

    fn self_id(&self) -> ObjectId {
        ObjectId(self as *const Self as *const () as usize)
    }
}

impl Object for PlainObject {
    fn class_name(&self) -> &str {
        self.class
    }

    fn get(&self, key: &str) -> Value {
        if let Some(prop) = self.props.borrow().get(key) {
            return prop.value.clone();
        }
        match self.get_prototype_of() {
            Some(proto) => proto.get(key),
            None => Value::Null,
        }
    }

    fn has(&self, key: &str) -> bool {
        if self.props.borrow().contains_key(key) {
            return true;
        }
        self.get_prototype_of().is_some_and(|proto| proto.has(key))
    }

    fn get_own_property(&self, key: &str) -> Option<Property> {
        self.props.borrow().get(key).cloned()
    }

    fn own_keys(&self) -> Vec<String> {
        self.props.borrow().keys().cloned().collect()
    }

    fn get_prototype_of(&self) -> Option<ObjectRef> {
        self.proto.borrow().clone()
    }

    fn is_extensible(&self) -> bool {
        self.extensible.get()
    }

    fn is_frozen(&self) -> bool {
        !self.extensible.get()
            && self
                .props
                .borrow()
                .values()
                .all(|p| !p.writable && !p.configurable)
    }

    fn set(&self, key: &str, value: Value) -> bool {
        if let Some(prop) = self.props.borrow_mut().get_mut(key) {
            if !prop.writable {
                return false;
            }
            prop.value = value;
            return true;
        }
        if !self.extensible.get() {
            return false;
        }
        // An inherited read-only property blocks shadowing by assignment
        if let Some(proto) = self.get_prototype_of() {
            if find_property(&proto, key).is_some_and(|p| !p.writable) {
                return false;
            }
        }
        self.insert(key, Property::data(value));
        true
    }

    fn define_property(&self, key: &str, prop: Property) -> bool {
        let mut props = self.props.borrow_mut();
        match props.get_mut(key) {
            Some(existing) if !existing.configurable => {
                if !existing.writable {
                    return false;
                }
                existing.value = prop.value;
                true
            }
            Some(existing) => {
                *existing = prop;
                true
            }
            None if !self.extensible.get() => false,
            None => {
                props.insert(key.to_string(), prop);
                true
            }
        }
    }

    fn delete_property(&self, key: &str) -> bool {
        let mut props = self.props.borrow_mut();
        match props.get(key) {
            None => true,
            Some(p) if !p.configurable => false,
            Some(_) => {
                props.remove(key);
                true
            }
        }
    }

    fn set_prototype_of(&self, proto: Option<ObjectRef>) -> bool {
        let current = self.get_prototype_of();
        let unchanged = match (&current, &proto) {
            (None, None) => true,
            (Some(a), Some(b)) => a.ptr_eq(b),
            _ => false,
        };
        if unchanged {
            return true;
        }
        if !self.extensible.get() {
            return false;
        }
        // Refuse cycles
        let mut cursor = proto.clone();
        for _ in 0..MAX_PROTO_DEPTH {
            match cursor {
                Some(ref o) if o.id() == self.self_id() => return false,
                Some(o) => cursor = o.get_prototype_of(),
                None => break,
            }
        }
        *self.proto.borrow_mut() = proto;
        true
    }

    fn prevent_extensions(&self) -> bool {
        self.extensible.set(false);
        true
    }

    fn freeze(&self) -> bool {
        self.extensible.set(false);
        for prop in self.props.borrow_mut().values_mut() {
            prop.writable = false;
            prop.configurable = false;
        }
        true
    }

    fn is_callable(&self) -> bool {
        self.callable.is_some()
    }

    fn is_constructor(&self) -> bool {
        self.callable
            .as_ref()
            .is_some_and(|c| c.instance_class.is_some())
    }

    fn call(&self, this: &Value, args: &[Value]) -> HostResult {
        match &self.callable {
            Some(callable) => (callable.func)(this, args),
            None => Err(HostError::NotCallable(self.class.to_string())),
        }
    }

    fn construct_instance(&self, args: &[Value]) -> Result<(Value, bool), HostError> {
        let Some(Callable {
            func,
            instance_class: Some(instance_class),
        }) = &self.callable
        else {
            return Err(HostError::NotConstructor(self.class.to_string()));
        };
        let proto = self.get("prototype").as_object().cloned();
        let instance = ObjectRef::new(PlainObject::new(*instance_class, proto));
        let result = func(&Value::Object(instance.clone()), args)?;
        match result {
            Value::Object(replacement) => {
                let fresh = replacement.ptr_eq(&instance);
                Ok((Value::Object(replacement), fresh))
            }
            _ => Ok((Value::Object(instance), true)),
        }
    }

    fn release(&self) {
        self.props.borrow_mut().clear();
        self.proto.borrow_mut().take();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

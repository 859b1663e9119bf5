// src/sandbox/realm.rs — Host realm: built-ins shared with plugin code
//
// One realm per sandbox instance. The bootstrap freeze-walks the capability
// set below before any plugin runs; plugins then reach the global only through
// `SandboxGlobal`.

use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::infra::errors::HostError;
use crate::sandbox::capability::CapabilityFilter;
use crate::sandbox::convert::{self, array_items, is_array, Prototypes};
use crate::sandbox::object::{
    HostResult, Object, ObjectRef, PlainObject, Property, Value,
};

/// Built-ins frozen eagerly, together with every enumerable global function.
pub const CAPABILITY_SET: &[&str] = &[
    "Object", "Function", "Array", "Number", "String", "Boolean", "Math", "JSON", "RegExp",
    "Date", "console",
];

fn arg(args: &[Value], i: usize) -> &Value {
    const NULL: &Value = &Value::Null;
    args.get(i).unwrap_or(NULL)
}

fn this_object(this: &Value, method: &str) -> Result<ObjectRef, HostError> {
    this.as_object()
        .cloned()
        .ok_or_else(|| HostError::Type(format!("{method} called on a non-object")))
}

/// Create a native function object. Natives are frozen from birth.
fn native<F>(fn_proto: &ObjectRef, name: &str, arity: i64, func: F) -> ObjectRef
where
    F: Fn(&Value, &[Value]) -> HostResult + 'static,
{
    let f = PlainObject::function(Some(fn_proto.clone()), func)
        .with("name", Property::constant(name.into()))
        .with("length", Property::constant(Value::Int(arity)));
    f.freeze();
    ObjectRef::new(f)
}

/// A method slot: non-enumerable native function.
fn method<F>(fn_proto: &ObjectRef, name: &str, arity: i64, func: F) -> Property
where
    F: Fn(&Value, &[Value]) -> HostResult + 'static,
{
    Property::hidden(Value::Object(native(fn_proto, name, arity, func)))
}

fn constructor<F>(
    fn_proto: &ObjectRef,
    name: &str,
    instance_class: &'static str,
    prototype: &ObjectRef,
    func: F,
) -> PlainObject
where
    F: Fn(&Value, &[Value]) -> HostResult + 'static,
{
    PlainObject::constructor(Some(fn_proto.clone()), instance_class, func)
        .with("name", Property::constant(name.into()))
        .with("prototype", Property::constant(Value::Object(prototype.clone())))
}

// ---------------------------------------------------------------------------
// Realm
// ---------------------------------------------------------------------------

pub struct Realm {
    pub global: ObjectRef,
    pub prototypes: Prototypes,
    pub function_prototype: ObjectRef,
}

impl Realm {
    pub fn new() -> Self {
        let object_proto = ObjectRef::new(PlainObject::new("Object", None));
        let fn_proto = ObjectRef::new(PlainObject::new("Function", Some(object_proto.clone())));
        let array_proto = ObjectRef::new(PlainObject::new("Array", Some(object_proto.clone())));
        let prototypes = Prototypes {
            object: object_proto.clone(),
            array: array_proto.clone(),
        };

        install_object_prototype(&object_proto, &fn_proto);
        install_function_prototype(&fn_proto);
        install_array_prototype(&array_proto, &fn_proto);

        let global = PlainObject::new("global", Some(object_proto.clone()));
        let builtins = [
            ("Object", object_builtin(&fn_proto, &prototypes)),
            ("Function", function_builtin(&fn_proto)),
            ("Array", array_builtin(&fn_proto, &prototypes)),
            ("Number", number_builtin(&fn_proto, &object_proto)),
            ("String", string_builtin(&fn_proto, &object_proto)),
            ("Boolean", boolean_builtin(&fn_proto, &object_proto)),
            ("Math", math_builtin(&fn_proto, &object_proto)),
            ("JSON", json_builtin(&fn_proto, &object_proto, &prototypes)),
            ("RegExp", regexp_builtin(&fn_proto, &object_proto, &prototypes)),
            ("Date", date_builtin(&fn_proto, &object_proto)),
            ("console", console_builtin(&fn_proto, &object_proto)),
        ];
        for (name, builtin) in builtins {
            global.insert(name, Property::hidden(Value::Object(builtin)));
        }

        // Global functions are enumerable
        global.insert(
            "parseInt",
            Property::data(Value::Object(native(&fn_proto, "parseInt", 2, |_, args| {
                Ok(Value::number(parse_int(
                    &arg(args, 0).to_display(),
                    arg(args, 1),
                )))
            }))),
        );
        global.insert(
            "parseFloat",
            Property::data(Value::Object(native(&fn_proto, "parseFloat", 1, |_, args| {
                Ok(Value::number(parse_float(&arg(args, 0).to_display())))
            }))),
        );
        global.insert(
            "isNaN",
            Property::data(Value::Object(native(&fn_proto, "isNaN", 1, |_, args| {
                Ok(Value::Bool(arg(args, 0).to_number().is_nan()))
            }))),
        );
        global.insert(
            "isFinite",
            Property::data(Value::Object(native(&fn_proto, "isFinite", 1, |_, args| {
                Ok(Value::Bool(arg(args, 0).to_number().is_finite()))
            }))),
        );

        Self {
            global: ObjectRef::new(global),
            prototypes,
            function_prototype: fn_proto,
        }
    }

    /// The objects the bootstrap freeze-walks before plugins execute: the
    /// built-ins, their prototypes and every enumerable global function.
    pub fn capability_set(&self) -> Vec<ObjectRef> {
        let mut set = vec![
            self.prototypes.object.clone(),
            self.prototypes.array.clone(),
            self.function_prototype.clone(),
        ];
        for name in CAPABILITY_SET {
            let Some(builtin) = self.global.get(name).as_object().cloned() else {
                continue;
            };
            // `prototype` slots are constants; walk them directly
            if let Some(Value::Object(proto)) = builtin.get_own_property("prototype").map(|p| p.value) {
                if !set.contains(&proto) {
                    set.push(proto);
                }
            }
            set.push(builtin);
        }
        for key in self.global.own_keys() {
            let Some(prop) = self.global.get_own_property(&key) else {
                continue;
            };
            if let Value::Object(obj) = prop.value {
                if prop.enumerable && obj.is_callable() {
                    set.push(obj);
                }
            }
        }
        set
    }

    /// Teardown: break the realm's internal graph.
    pub fn release(&self) {
        for key in self.global.own_keys() {
            if let Some(obj) = self.global.get(&key).as_object() {
                obj.release();
            }
        }
        self.prototypes.object.release();
        self.prototypes.array.release();
        self.function_prototype.release();
        self.global.release();
    }
}

impl Default for Realm {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Prototypes
// ---------------------------------------------------------------------------

fn install_object_prototype(proto: &ObjectRef, fn_proto: &ObjectRef) {
    proto.define_property(
        "hasOwnProperty",
        method(fn_proto, "hasOwnProperty", 1, |this, args| {
            let obj = this_object(this, "hasOwnProperty")?;
            Ok(Value::Bool(
                obj.get_own_property(&arg(args, 0).to_display()).is_some(),
            ))
        }),
    );
    proto.define_property(
        "toString",
        method(fn_proto, "toString", 0, |this, _| {
            Ok(Value::Str(this.to_display()))
        }),
    );
}

fn install_function_prototype(fn_proto: &ObjectRef) {
    let call = method(fn_proto, "call", 1, |this, args| {
        let func = this_object(this, "call")?;
        func.call(arg(args, 0), args.get(1..).unwrap_or(&[]))
    });
    fn_proto.define_property("call", call);
}

fn install_array_prototype(array_proto: &ObjectRef, fn_proto: &ObjectRef) {
    array_proto.define_property(
        "push",
        method(fn_proto, "push", 1, |this, args| {
            let arr = this_object(this, "push")?;
            let mut len = convert::array_length(&arr) as i64;
            for item in args {
                if !arr.set(&len.to_string(), item.clone()) {
                    return Err(HostError::Type("cannot add property, object is not extensible".into()));
                }
                len += 1;
            }
            arr.set("length", Value::Int(len));
            Ok(Value::Int(len))
        }),
    );
    array_proto.define_property(
        "join",
        method(fn_proto, "join", 1, |this, args| {
            let arr = this_object(this, "join")?;
            let sep = match arg(args, 0) {
                Value::Null => ",".to_string(),
                other => other.to_display(),
            };
            let parts: Vec<String> = array_items(&arr)?.iter().map(Value::to_display).collect();
            Ok(Value::Str(parts.join(&sep)))
        }),
    );
    array_proto.define_property(
        "includes",
        method(fn_proto, "includes", 1, |this, args| {
            let arr = this_object(this, "includes")?;
            Ok(Value::Bool(array_items(&arr)?.contains(arg(args, 0))))
        }),
    );
    array_proto.define_property(
        "indexOf",
        method(fn_proto, "indexOf", 1, |this, args| {
            let arr = this_object(this, "indexOf")?;
            let index = array_items(&arr)?.iter().position(|v| v == arg(args, 0));
            Ok(Value::Int(index.map_or(-1, |i| i as i64)))
        }),
    );
}

// ---------------------------------------------------------------------------
// Built-in constructors and namespaces
// ---------------------------------------------------------------------------

fn object_builtin(fn_proto: &ObjectRef, protos: &Prototypes) -> ObjectRef {
    let create_protos = protos.clone();
    ObjectRef::new(
        constructor(fn_proto, "Object", "Object", &protos.object, |_, args| {
            // An object argument is returned as-is; anything else gets the fresh instance
            Ok(match arg(args, 0) {
                Value::Object(o) => Value::Object(o.clone()),
                _ => Value::Null,
            })
        })
        .with(
            "keys",
            method(fn_proto, "keys", 1, {
                let protos = protos.clone();
                move |_, args| {
                    let Value::Object(obj) = arg(args, 0) else {
                        return Ok(Value::Object(protos.new_array(Vec::new())));
                    };
                    let keys = obj
                        .own_keys()
                        .into_iter()
                        .filter(|k| obj.get_own_property(k).is_some_and(|p| p.enumerable))
                        .map(Value::Str)
                        .collect();
                    Ok(Value::Object(protos.new_array(keys)))
                }
            }),
        )
        .with(
            "freeze",
            method(fn_proto, "freeze", 1, |_, args| {
                if let Value::Object(obj) = arg(args, 0) {
                    obj.freeze();
                }
                Ok(arg(args, 0).clone())
            }),
        )
        .with(
            "isFrozen",
            method(fn_proto, "isFrozen", 1, |_, args| {
                Ok(Value::Bool(match arg(args, 0) {
                    Value::Object(obj) => obj.is_frozen(),
                    _ => true,
                }))
            }),
        )
        .with(
            "getPrototypeOf",
            method(fn_proto, "getPrototypeOf", 1, |_, args| {
                Ok(arg(args, 0)
                    .as_object()
                    .and_then(|o| o.get_prototype_of())
                    .map(Value::Object)
                    .unwrap_or_default())
            }),
        )
        .with(
            "create",
            method(fn_proto, "create", 1, move |_, args| {
                let proto = arg(args, 0).as_object().cloned();
                let obj = create_protos.new_object();
                obj.set_prototype_of(proto);
                Ok(Value::Object(obj))
            }),
        ),
    )
}

fn function_builtin(fn_proto: &ObjectRef) -> ObjectRef {
    ObjectRef::new(constructor(fn_proto, "Function", "Function", fn_proto, |_, _| {
        Err(HostError::Type("dynamic code is disabled in the sandbox".into()))
    }))
}

fn array_builtin(fn_proto: &ObjectRef, protos: &Prototypes) -> ObjectRef {
    let ctor_protos = protos.clone();
    let of_protos = protos.clone();
    ObjectRef::new(
        constructor(fn_proto, "Array", "Array", &protos.array, move |_, args| {
            Ok(Value::Object(ctor_protos.new_array(args.to_vec())))
        })
        .with(
            "isArray",
            method(fn_proto, "isArray", 1, |_, args| {
                Ok(Value::Bool(arg(args, 0).as_object().is_some_and(is_array)))
            }),
        )
        .with(
            "of",
            method(fn_proto, "of", 0, move |_, args| {
                Ok(Value::Object(of_protos.new_array(args.to_vec())))
            }),
        ),
    )
}

fn number_builtin(fn_proto: &ObjectRef, object_proto: &ObjectRef) -> ObjectRef {
    let prototype = ObjectRef::new(PlainObject::new("Number", Some(object_proto.clone())));
    ObjectRef::new(
        PlainObject::function(Some(fn_proto.clone()), |_, args| {
            Ok(Value::number(arg(args, 0).to_number()))
        })
        .with("name", Property::constant("Number".into()))
        .with("prototype", Property::constant(Value::Object(prototype)))
        .with("MAX_SAFE_INTEGER", Property::constant(Value::Int(9_007_199_254_740_991)))
        .with("MIN_SAFE_INTEGER", Property::constant(Value::Int(-9_007_199_254_740_991)))
        .with("EPSILON", Property::constant(Value::Float(f64::EPSILON)))
        .with(
            "isInteger",
            method(fn_proto, "isInteger", 1, |_, args| {
                Ok(Value::Bool(match arg(args, 0) {
                    Value::Int(_) => true,
                    Value::Float(f) => f.is_finite() && f.fract() == 0.0,
                    _ => false,
                }))
            }),
        )
        .with(
            "isFinite",
            method(fn_proto, "isFinite", 1, |_, args| {
                Ok(Value::Bool(match arg(args, 0) {
                    Value::Int(_) => true,
                    Value::Float(f) => f.is_finite(),
                    _ => false,
                }))
            }),
        )
        .with(
            "parseFloat",
            method(fn_proto, "parseFloat", 1, |_, args| {
                Ok(Value::number(parse_float(&arg(args, 0).to_display())))
            }),
        )
        .with(
            "parseInt",
            method(fn_proto, "parseInt", 2, |_, args| {
                Ok(Value::number(parse_int(&arg(args, 0).to_display(), arg(args, 1))))
            }),
        ),
    )
}

fn string_builtin(fn_proto: &ObjectRef, object_proto: &ObjectRef) -> ObjectRef {
    let prototype = ObjectRef::new(PlainObject::new("String", Some(object_proto.clone())));
    ObjectRef::new(
        PlainObject::function(Some(fn_proto.clone()), |_, args| {
            Ok(Value::Str(match args.first() {
                Some(v) => v.to_display(),
                None => String::new(),
            }))
        })
        .with("name", Property::constant("String".into()))
        .with("prototype", Property::constant(Value::Object(prototype)))
        .with(
            "fromCharCode",
            method(fn_proto, "fromCharCode", 1, |_, args| {
                let text: String = args
                    .iter()
                    .filter_map(|v| char::from_u32(v.to_number() as u32))
                    .collect();
                Ok(Value::Str(text))
            }),
        ),
    )
}

fn boolean_builtin(fn_proto: &ObjectRef, object_proto: &ObjectRef) -> ObjectRef {
    let prototype = ObjectRef::new(PlainObject::new("Boolean", Some(object_proto.clone())));
    ObjectRef::new(
        PlainObject::function(Some(fn_proto.clone()), |_, args| {
            Ok(Value::Bool(arg(args, 0).is_truthy()))
        })
        .with("name", Property::constant("Boolean".into()))
        .with("prototype", Property::constant(Value::Object(prototype))),
    )
}

fn math_builtin(fn_proto: &ObjectRef, object_proto: &ObjectRef) -> ObjectRef {
    fn unary(fn_proto: &ObjectRef, name: &str, op: fn(f64) -> f64) -> Property {
        method(fn_proto, name, 1, move |_, args| {
            Ok(Value::number(op(arg(args, 0).to_number())))
        })
    }

    ObjectRef::new(
        PlainObject::new("Math", Some(object_proto.clone()))
            .with("PI", Property::constant(Value::Float(std::f64::consts::PI)))
            .with("E", Property::constant(Value::Float(std::f64::consts::E)))
            .with("abs", unary(fn_proto, "abs", f64::abs))
            .with("ceil", unary(fn_proto, "ceil", f64::ceil))
            .with("floor", unary(fn_proto, "floor", f64::floor))
            .with("round", unary(fn_proto, "round", |n| (n + 0.5).floor()))
            .with("trunc", unary(fn_proto, "trunc", f64::trunc))
            .with("sqrt", unary(fn_proto, "sqrt", f64::sqrt))
            .with(
                "sign",
                unary(fn_proto, "sign", |n| {
                    if n.is_nan() || n == 0.0 {
                        n
                    } else {
                        n.signum()
                    }
                }),
            )
            .with(
                "pow",
                method(fn_proto, "pow", 2, |_, args| {
                    Ok(Value::number(
                        arg(args, 0).to_number().powf(arg(args, 1).to_number()),
                    ))
                }),
            )
            .with(
                "max",
                method(fn_proto, "max", 2, |_, args| {
                    Ok(Value::number(
                        args.iter()
                            .map(Value::to_number)
                            .fold(f64::NEG_INFINITY, nan_max),
                    ))
                }),
            )
            .with(
                "min",
                method(fn_proto, "min", 2, |_, args| {
                    Ok(Value::number(
                        args.iter()
                            .map(Value::to_number)
                            .fold(f64::INFINITY, nan_min),
                    ))
                }),
            )
            .with(
                "random",
                method(fn_proto, "random", 0, |_, _| {
                    let mut bytes = [0u8; 8];
                    getrandom::getrandom(&mut bytes)
                        .map_err(|e| HostError::Range(format!("entropy unavailable: {e}")))?;
                    // 53 random bits -> [0, 1)
                    let bits = u64::from_le_bytes(bytes) >> 11;
                    Ok(Value::Float(bits as f64 / (1u64 << 53) as f64))
                }),
            ),
    )
}

fn nan_max(acc: f64, n: f64) -> f64 {
    if acc.is_nan() || n.is_nan() {
        f64::NAN
    } else {
        acc.max(n)
    }
}

fn nan_min(acc: f64, n: f64) -> f64 {
    if acc.is_nan() || n.is_nan() {
        f64::NAN
    } else {
        acc.min(n)
    }
}

fn json_builtin(fn_proto: &ObjectRef, object_proto: &ObjectRef, protos: &Prototypes) -> ObjectRef {
    let parse_protos = protos.clone();
    ObjectRef::new(
        PlainObject::new("JSON", Some(object_proto.clone()))
            .with(
                "stringify",
                method(fn_proto, "stringify", 1, |_, args| {
                    let json = convert::value_to_json(arg(args, 0))?;
                    serde_json::to_string(&json)
                        .map(Value::Str)
                        .map_err(|e| HostError::Type(e.to_string()))
                }),
            )
            .with(
                "parse",
                method(fn_proto, "parse", 1, move |_, args| {
                    let text = arg(args, 0).to_display();
                    let json: serde_json::Value = serde_json::from_str(&text)
                        .map_err(|e| HostError::Syntax(e.to_string()))?;
                    Ok(convert::json_to_value(&json, &parse_protos))
                }),
            ),
    )
}

fn compile_regex(source: &str, flags: &str) -> Result<regex::Regex, HostError> {
    regex::RegexBuilder::new(source)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .map_err(|e| HostError::Syntax(format!("invalid regular expression: {e}")))
}

fn regex_of(this: &Value, method_name: &str) -> Result<regex::Regex, HostError> {
    let obj = this_object(this, method_name)?;
    compile_regex(&obj.get("source").to_display(), &obj.get("flags").to_display())
}

fn regexp_builtin(fn_proto: &ObjectRef, object_proto: &ObjectRef, protos: &Prototypes) -> ObjectRef {
    let exec_protos = protos.clone();
    let prototype = ObjectRef::new(
        PlainObject::new("RegExp", Some(object_proto.clone()))
            .with(
                "test",
                method(fn_proto, "test", 1, |this, args| {
                    let re = regex_of(this, "test")?;
                    Ok(Value::Bool(re.is_match(&arg(args, 0).to_display())))
                }),
            )
            .with(
                "exec",
                method(fn_proto, "exec", 1, move |this, args| {
                    let re = regex_of(this, "exec")?;
                    let text = arg(args, 0).to_display();
                    let Some(caps) = re.captures(&text) else {
                        return Ok(Value::Null);
                    };
                    let groups = caps
                        .iter()
                        .map(|m| m.map_or(Value::Null, |m| Value::Str(m.as_str().to_string())))
                        .collect();
                    Ok(Value::Object(exec_protos.new_array(groups)))
                }),
            ),
    );
    ObjectRef::new(constructor(fn_proto, "RegExp", "RegExp", &prototype, |this, args| {
        let source = match arg(args, 0) {
            Value::Null => "(?:)".to_string(),
            other => other.to_display(),
        };
        let flags = match arg(args, 1) {
            Value::Null => String::new(),
            other => other.to_display(),
        };
        compile_regex(&source, &flags)?;
        let instance = this_object(this, "RegExp")?;
        instance.set("source", Value::Str(source));
        instance.set("flags", Value::Str(flags));
        instance.set("lastIndex", Value::Int(0));
        Ok(Value::Null)
    }))
}

fn time_of(this: &Value, method_name: &str) -> Result<f64, HostError> {
    Ok(this_object(this, method_name)?.get("epochMillis").to_number())
}

fn date_builtin(fn_proto: &ObjectRef, object_proto: &ObjectRef) -> ObjectRef {
    let prototype = ObjectRef::new(
        PlainObject::new("Date", Some(object_proto.clone()))
            .with(
                "getTime",
                method(fn_proto, "getTime", 0, |this, _| {
                    Ok(Value::number(time_of(this, "getTime")?))
                }),
            )
            .with(
                "toISOString",
                method(fn_proto, "toISOString", 0, |this, _| {
                    let millis = time_of(this, "toISOString")?;
                    let stamp = if millis.is_finite() {
                        DateTime::<Utc>::from_timestamp_millis(millis as i64)
                    } else {
                        None
                    };
                    stamp
                        .map(|t| Value::Str(t.to_rfc3339_opts(SecondsFormat::Millis, true)))
                        .ok_or_else(|| HostError::Range("Invalid time value".into()))
                }),
            ),
    );
    ObjectRef::new(
        constructor(fn_proto, "Date", "Date", &prototype, |this, args| {
            let millis = match arg(args, 0) {
                Value::Null => Utc::now().timestamp_millis() as f64,
                Value::Str(s) => DateTime::parse_from_rfc3339(s)
                    .map(|t| t.timestamp_millis() as f64)
                    .unwrap_or(f64::NAN),
                other => other.to_number(),
            };
            let instance = this_object(this, "Date")?;
            instance.define_property("epochMillis", Property::hidden(Value::number(millis)));
            Ok(Value::Null)
        })
        .with(
            "now",
            method(fn_proto, "now", 0, |_, _| {
                Ok(Value::Int(Utc::now().timestamp_millis()))
            }),
        ),
    )
}

fn console_builtin(fn_proto: &ObjectRef, object_proto: &ObjectRef) -> ObjectRef {
    fn line(args: &[Value]) -> String {
        args.iter().map(Value::to_display).collect::<Vec<_>>().join(" ")
    }

    ObjectRef::new(
        PlainObject::new("console", Some(object_proto.clone()))
            .with(
                "log",
                method(fn_proto, "log", 0, |_, args| {
                    tracing::info!(target: "plugin", "{}", line(args));
                    Ok(Value::Null)
                }),
            )
            .with(
                "info",
                method(fn_proto, "info", 0, |_, args| {
                    tracing::info!(target: "plugin", "{}", line(args));
                    Ok(Value::Null)
                }),
            )
            .with(
                "debug",
                method(fn_proto, "debug", 0, |_, args| {
                    tracing::debug!(target: "plugin", "{}", line(args));
                    Ok(Value::Null)
                }),
            )
            .with(
                "warn",
                method(fn_proto, "warn", 0, |_, args| {
                    tracing::warn!(target: "plugin", "{}", line(args));
                    Ok(Value::Null)
                }),
            )
            .with(
                "error",
                method(fn_proto, "error", 0, |_, args| {
                    tracing::error!(target: "plugin", "{}", line(args));
                    Ok(Value::Null)
                }),
            ),
    )
}

// ---------------------------------------------------------------------------
// Number parsing helpers
// ---------------------------------------------------------------------------

fn parse_int(text: &str, radix: &Value) -> f64 {
    let mut s = text.trim();
    let mut sign = 1.0;
    if let Some(rest) = s.strip_prefix('-') {
        sign = -1.0;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }

    let mut radix = match radix {
        Value::Null => 0,
        other => other.to_number() as u32,
    };
    // A `0x` prefix is honoured when the radix is unspecified or 16
    if radix == 0 || radix == 16 {
        if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            s = rest;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }

    let digits: Vec<u32> = s.chars().map_while(|c| c.to_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits
        .into_iter()
        .fold(0.0, |acc, d| acc * f64::from(radix) + f64::from(d));
    sign * value
}

fn parse_float(text: &str) -> f64 {
    let s = text.trim_start();
    if s.starts_with("Infinity") || s.starts_with("+Infinity") {
        return f64::INFINITY;
    }
    if s.starts_with("-Infinity") {
        return f64::NEG_INFINITY;
    }
    let candidate: String = s
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        .collect();
    // Longest prefix that parses
    (1..=candidate.len())
        .rev()
        .filter_map(|end| candidate.get(..end))
        .find_map(|prefix| prefix.parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

// ---------------------------------------------------------------------------
// SandboxGlobal — the global object plugins see
// ---------------------------------------------------------------------------

/// The exposed global: a fixed local table first, then the real global
/// through the capability filter. Refuses every mutation.
pub struct SandboxGlobal {
    local: BTreeMap<String, Value>,
    global: ObjectRef,
    filter: Rc<CapabilityFilter>,
}

impl SandboxGlobal {
    pub fn new(global: ObjectRef, filter: Rc<CapabilityFilter>, local: BTreeMap<String, Value>) -> Self {
        Self {
            local,
            global,
            filter,
        }
    }
}

impl Object for SandboxGlobal {
    fn class_name(&self) -> &str {
        "global"
    }

    fn get(&self, key: &str) -> Value {
        match self.local.get(key) {
            Some(value) => value.clone(),
            None => self.filter.wrap(self.global.get(key)),
        }
    }

    fn has(&self, key: &str) -> bool {
        self.local.contains_key(key) || self.global.has(key)
    }

    fn get_own_property(&self, key: &str) -> Option<Property> {
        if let Some(value) = self.local.get(key) {
            return Some(Property::constant(value.clone()));
        }
        self.global.get_own_property(key).map(|prop| Property {
            value: self.filter.wrap(prop.value.clone()),
            ..prop
        })
    }

    fn own_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.local.keys().cloned().collect();
        for key in self.global.own_keys() {
            if !self.local.contains_key(&key) {
                keys.push(key);
            }
        }
        keys
    }

    fn get_prototype_of(&self) -> Option<ObjectRef> {
        let proto = self.global.get_prototype_of()?;
        self.filter.wrap(Value::Object(proto)).as_object().cloned()
    }

    fn is_extensible(&self) -> bool {
        false
    }

    fn is_frozen(&self) -> bool {
        false
    }

    fn set(&self, _key: &str, _value: Value) -> bool {
        false
    }

    fn define_property(&self, _key: &str, _prop: Property) -> bool {
        false
    }

    fn delete_property(&self, _key: &str) -> bool {
        false
    }

    fn set_prototype_of(&self, _proto: Option<ObjectRef>) -> bool {
        false
    }

    fn prevent_extensions(&self) -> bool {
        false
    }

    fn freeze(&self) -> bool {
        false
    }

    fn proxy_target(&self) -> Option<ObjectRef> {
        Some(self.global.clone())
    }

    fn release(&self) {
        self.global.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn call(obj: &ObjectRef, name: &str, args: &[Value]) -> Value {
        let f = obj.get(name);
        f.as_object().unwrap().call(&Value::Object(obj.clone()), args).unwrap()
    }

    #[test]
    fn test_capability_set_contains_builtins_and_global_functions() {
        let realm = Realm::new();
        let set = realm.capability_set();
        let parse_int = realm.global.get("parseInt");
        assert!(set.iter().any(|o| Some(o) == parse_int.as_object()));
        assert!(set.contains(&realm.prototypes.object));
        assert!(set.contains(&realm.prototypes.array));
        let math = realm.global.get("Math");
        assert!(set.contains(math.as_object().unwrap()));
    }

    #[test]
    fn test_frozen_capability_set_blocks_prototype_pollution() {
        let realm = Realm::new();
        let filter = CapabilityFilter::new();
        for obj in realm.capability_set() {
            filter.freeze_walk(&obj);
        }
        let object_ctor = realm.global.get("Object");
        let proto = object_ctor.as_object().unwrap().get("prototype");
        let proto = proto.as_object().unwrap();
        assert!(proto.is_frozen());
        assert!(!proto.set("polluted", Value::Bool(true)));

        // Plugin-created objects stay writable
        let fresh = realm.prototypes.new_object();
        assert!(fresh.set("mine", Value::Int(1)));
        let arr = realm.prototypes.new_array(vec![]);
        assert_eq!(call(&arr, "push", &[Value::Int(1)]), Value::Int(1));
    }

    #[test]
    fn test_math() {
        let realm = Realm::new();
        let math = realm.global.get("Math");
        let math = math.as_object().unwrap();
        assert_eq!(call(math, "max", &[Value::Int(1), Value::Int(5), Value::Int(3)]), Value::Int(5));
        assert_eq!(call(math, "min", &[Value::Int(1), Value::Float(-2.5)]), Value::Float(-2.5));
        assert_eq!(call(math, "floor", &[Value::Float(2.7)]), Value::Int(2));
        let r = call(math, "random", &[]).to_number();
        assert!((0.0..1.0).contains(&r));
    }

    #[test]
    fn test_json_round_trip() {
        let realm = Realm::new();
        let json = realm.global.get("JSON");
        let json = json.as_object().unwrap();
        let parsed = call(json, "parse", &[r#"{"a":[1,2],"b":"x"}"#.into()]);
        assert_eq!(parsed.as_object().unwrap().get("b"), Value::from("x"));
        let text = call(json, "stringify", &[parsed]);
        assert_eq!(text, Value::from(r#"{"a":[1,2],"b":"x"}"#));

        let err = json.get("parse").as_object().unwrap().call(&Value::Null, &["{".into()]);
        assert!(matches!(err, Err(HostError::Syntax(_))));
    }

    #[test]
    fn test_regexp_instances() {
        let realm = Realm::new();
        let ctor = realm.global.get("RegExp");
        let re = ctor
            .as_object()
            .unwrap()
            .construct(&["h(i+)".into(), "i".into()])
            .unwrap();
        let re = re.as_object().unwrap();
        assert_eq!(re.class_name(), "RegExp");
        assert_eq!(call(re, "test", &["oh HIII".into()]), Value::Bool(true));
        let groups = call(re, "exec", &["hii there".into()]);
        assert_eq!(
            array_items(groups.as_object().unwrap()).unwrap(),
            vec![Value::from("hii"), Value::from("ii")]
        );

        let bad = ctor.as_object().unwrap().construct(&["(".into()]);
        assert!(matches!(bad, Err(HostError::Syntax(_))));
    }

    #[test]
    fn test_date_instances() {
        let realm = Realm::new();
        let ctor = realm.global.get("Date");
        let d = ctor.as_object().unwrap().construct(&[Value::Int(0)]).unwrap();
        let d = d.as_object().unwrap();
        assert_eq!(call(d, "getTime", &[]), Value::Int(0));
        assert_eq!(
            call(d, "toISOString", &[]),
            Value::from("1970-01-01T00:00:00.000Z")
        );
    }

    #[test]
    fn test_function_constructor_refuses_dynamic_code() {
        let realm = Realm::new();
        let f = realm.global.get("Function");
        let result = f.as_object().unwrap().call(&Value::Null, &["return 1".into()]);
        assert!(matches!(result, Err(HostError::Type(_))));
    }

    #[test]
    fn test_array_methods() {
        let realm = Realm::new();
        let arr = realm.prototypes.new_array(vec![Value::Int(1)]);
        assert_eq!(call(&arr, "push", &[Value::Int(2), Value::Int(3)]), Value::Int(3));
        assert_eq!(call(&arr, "join", &["-".into()]), Value::from("1-2-3"));
        assert_eq!(call(&arr, "includes", &[Value::Int(2)]), Value::Bool(true));
        assert_eq!(call(&arr, "indexOf", &[Value::Int(9)]), Value::Int(-1));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_int("42px", &Value::Null), 42.0);
        assert_eq!(parse_int("-0x1f", &Value::Null), -31.0);
        assert_eq!(parse_int("101", &Value::Int(2)), 5.0);
        assert!(parse_int("px", &Value::Null).is_nan());
        assert_eq!(parse_float("3.25abc"), 3.25);
        assert_eq!(parse_float("  -1e3"), -1000.0);
        assert!(parse_float("abc").is_nan());
    }

    #[test]
    fn test_sandbox_global_local_table_and_denial() {
        let realm = Realm::new();
        let filter = CapabilityFilter::new();
        let mut local = BTreeMap::new();
        local.insert("sandbox".to_string(), Value::from("test"));
        let global = ObjectRef::new(SandboxGlobal::new(realm.global.clone(), filter.clone(), local));

        assert_eq!(global.get("sandbox"), Value::from("test"));
        let math = global.get("Math");
        assert!(math.as_object().unwrap().proxy_target().is_some());
        assert_eq!(global.get("Math"), math);
        assert!(!global.set("Math", Value::Null));
        assert!(!global.set("fresh", Value::Int(1)));
        assert!(!global.has("fresh"));
        assert!(global.own_keys().contains(&"sandbox".to_string()));
        // Wrapping the global itself is a no-op
        assert_eq!(filter.wrap(Value::Object(global.clone())), Value::Object(global));
    }
}

//! Runtime values.
//!
//! Arrays and objects are shared, interior-mutable containers so that
//! aliasing behaves as scripts expect. A container may be frozen, in which
//! case every write through any alias is rejected.

use super::ast::FunctionDecl;
use super::builtins::Builtin;
use super::interpreter::Environment;
use indexmap::IndexMap;
use serde_json::{Map, Number, Value as Json};
use std::cell::RefCell;
use std::rc::Rc;

/// Depth past which conversions stop recursing.
pub const MAX_VALUE_DEPTH: usize = 64;

#[derive(Debug)]
pub struct Container<T> {
    pub items: T,
    pub frozen: bool,
}

pub type ArrayRef = Rc<RefCell<Container<Vec<Value>>>>;
pub type ObjectRef = Rc<RefCell<Container<IndexMap<String, Value>>>>;

#[derive(Clone)]
pub enum Function {
    User {
        decl: Rc<FunctionDecl>,
        closure: Rc<Environment>,
    },
    Builtin(Builtin),
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(Function),
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            Value::Function(_) => f.write_str("function"),
            other => f.write_str(&other.to_display()),
        }
    }
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn new_array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(Container {
            items,
            frozen: false,
        })))
    }

    pub fn new_object(items: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(RefCell::new(Container {
            items,
            frozen: false,
        })))
    }

    pub fn frozen_object(items: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(RefCell::new(Container {
            items,
            frozen: true,
        })))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Array(_) | Value::Object(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => parse_number(s),
            Value::Array(array) => {
                let array = array.borrow();
                match array.items.as_slice() {
                    [] => 0.0,
                    [single] if !matches!(single, Value::Array(_)) => single.to_number(),
                    _ => f64::NAN,
                }
            }
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    /// String conversion as performed by `String(x)` and concatenation.
    pub fn to_display(&self) -> String {
        self.display_at(0)
    }

    fn display_at(&self, depth: usize) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::Array(array) => {
                if depth >= MAX_VALUE_DEPTH {
                    return String::new();
                }
                array
                    .borrow()
                    .items
                    .iter()
                    .map(|item| {
                        if item.is_nullish() {
                            String::new()
                        } else {
                            item.display_at(depth + 1)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(_) => "function".to_string(),
        }
    }

    /// `===` semantics. Containers compare by identity.
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Build a runtime value from JSON. Every container is frozen when
    /// `frozen` is set.
    pub fn from_json(json: &Json, frozen: bool) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::string(s.as_str()),
            Json::Array(items) => Value::Array(Rc::new(RefCell::new(Container {
                items: items.iter().map(|item| Value::from_json(item, frozen)).collect(),
                frozen,
            }))),
            Json::Object(map) => Value::Object(Rc::new(RefCell::new(Container {
                items: map
                    .iter()
                    .map(|(key, item)| (key.clone(), Value::from_json(item, frozen)))
                    .collect(),
                frozen,
            }))),
        }
    }

    /// Convert to JSON the way `JSON.stringify` does: `undefined` and
    /// functions become `null` inside arrays and are dropped from objects.
    /// Returns `None` for a top-level `undefined` or function.
    pub fn to_json(&self) -> Result<Option<Json>, String> {
        self.json_at(0)
    }

    fn json_at(&self, depth: usize) -> Result<Option<Json>, String> {
        if depth > MAX_VALUE_DEPTH {
            return Err("value is nested too deeply to serialize".to_string());
        }
        Ok(Some(match self {
            Value::Undefined | Value::Function(_) => return Ok(None),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.to_string()),
            Value::Array(array) => {
                let array = array.borrow();
                let mut out = Vec::with_capacity(array.items.len());
                for item in &array.items {
                    out.push(item.json_at(depth + 1)?.unwrap_or(Json::Null));
                }
                Json::Array(out)
            }
            Value::Object(object) => {
                let object = object.borrow();
                let mut out = Map::new();
                for (key, item) in &object.items {
                    if let Some(json) = item.json_at(depth + 1)? {
                        out.insert(key.clone(), json);
                    }
                }
                Json::Object(out)
            }
        }))
    }
}

/// JSON number for `n`; integral values stay integers, non-finite values are `null`.
pub fn number_to_json(n: f64) -> Json {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Json::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
}

/// Number formatting used for string conversion.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// Numeric conversion of a string. Blank strings are zero; anything that is
/// not a complete number is `NaN`.
pub fn parse_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map(|n| n as f64)
            .unwrap_or(f64::NAN);
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if trimmed.chars().all(|c| c.is_ascii_digit() || "+-.eE".contains(c)) => {
            trimmed.parse().unwrap_or(f64::NAN)
        }
        _ => f64::NAN,
    }
}

//! Global objects and built-in methods available to scripts.
//!
//! Scripts get pure computation only. Nothing here reaches the network, the
//! filesystem, the clock or any host state.

use super::ast::DeclKind;
use super::interpreter::{read_only, Environment, Interpreter};
use super::value::{format_number, parse_number, ArrayRef, Function, Value};
use crate::error::{ExecutionError, ExecutionResult};
use crate::gas::GasCost;
use std::rc::Rc;

/// Longest captured `console.log` line.
const MAX_LOG_LINE_CHARS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    MathFloor,
    MathCeil,
    MathRound,
    MathTrunc,
    MathAbs,
    MathMin,
    MathMax,
    MathPow,
    MathSqrt,
    JsonStringify,
    JsonParse,
    ObjectKeys,
    ObjectValues,
    ObjectEntries,
    ArrayIsArray,
    ConsoleLog,
    String,
    Number,
    Boolean,
    ParseInt,
    ParseFloat,
    IsNaN,
}

fn namespace(entries: &[(&str, Value)]) -> Value {
    Value::frozen_object(
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
    )
}

fn builtin(b: Builtin) -> Value {
    Value::Function(Function::Builtin(b))
}

/// Bind every global into `env`.
pub fn install_globals(env: &Environment) {
    let globals = [
        (
            "Math",
            namespace(&[
                ("floor", builtin(Builtin::MathFloor)),
                ("ceil", builtin(Builtin::MathCeil)),
                ("round", builtin(Builtin::MathRound)),
                ("trunc", builtin(Builtin::MathTrunc)),
                ("abs", builtin(Builtin::MathAbs)),
                ("min", builtin(Builtin::MathMin)),
                ("max", builtin(Builtin::MathMax)),
                ("pow", builtin(Builtin::MathPow)),
                ("sqrt", builtin(Builtin::MathSqrt)),
                ("PI", Value::Number(std::f64::consts::PI)),
                ("E", Value::Number(std::f64::consts::E)),
            ]),
        ),
        (
            "JSON",
            namespace(&[
                ("stringify", builtin(Builtin::JsonStringify)),
                ("parse", builtin(Builtin::JsonParse)),
            ]),
        ),
        (
            "Object",
            namespace(&[
                ("keys", builtin(Builtin::ObjectKeys)),
                ("values", builtin(Builtin::ObjectValues)),
                ("entries", builtin(Builtin::ObjectEntries)),
            ]),
        ),
        ("Array", namespace(&[("isArray", builtin(Builtin::ArrayIsArray))])),
        ("console", namespace(&[("log", builtin(Builtin::ConsoleLog))])),
        ("String", builtin(Builtin::String)),
        ("Number", builtin(Builtin::Number)),
        ("Boolean", builtin(Builtin::Boolean)),
        ("parseInt", builtin(Builtin::ParseInt)),
        ("parseFloat", builtin(Builtin::ParseFloat)),
        ("isNaN", builtin(Builtin::IsNaN)),
        ("NaN", Value::Number(f64::NAN)),
        ("Infinity", Value::Number(f64::INFINITY)),
    ];
    for (name, value) in globals {
        // Names are distinct, so declaring into a fresh scope cannot fail.
        let _ = env.declare(name, Some(value), DeclKind::Const);
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

fn number_arg(args: &[Value], index: usize) -> f64 {
    args.get(index).map(Value::to_number).unwrap_or(f64::NAN)
}

/// Resolve a possibly negative position against `len`, as `slice` does.
fn relative_index(value: Option<&Value>, len: usize, default: usize) -> usize {
    match value {
        None | Some(Value::Undefined) => default,
        Some(value) => {
            let n = value.to_number();
            if n.is_nan() {
                0
            } else if n < 0.0 {
                (len as f64 + n.trunc()).max(0.0) as usize
            } else {
                n.trunc().min(len as f64) as usize
            }
        }
    }
}

fn not_a_function(type_name: &str, name: &str) -> ExecutionError {
    ExecutionError::runtime(format!("{}.{} is not a function", type_name, name))
}

impl Interpreter {
    pub(super) fn call_builtin(&mut self, builtin: Builtin, args: Vec<Value>) -> ExecutionResult<Value> {
        let number = |f: fn(f64) -> f64| -> ExecutionResult<Value> {
            Ok(Value::Number(f(number_arg(&args, 0))))
        };
        match builtin {
            Builtin::MathFloor => number(f64::floor),
            Builtin::MathCeil => number(f64::ceil),
            Builtin::MathRound => number(|n| (n + 0.5).floor()),
            Builtin::MathTrunc => number(f64::trunc),
            Builtin::MathAbs => number(f64::abs),
            Builtin::MathSqrt => number(f64::sqrt),
            Builtin::MathPow => {
                self.charge(GasCost::MATH)?;
                Ok(Value::Number(number_arg(&args, 0).powf(number_arg(&args, 1))))
            }
            Builtin::MathMin | Builtin::MathMax => {
                self.charge(GasCost::MATH.saturating_mul(args.len() as u64))?;
                let is_min = builtin == Builtin::MathMin;
                let mut result = if is_min { f64::INFINITY } else { f64::NEG_INFINITY };
                for value in &args {
                    let n = value.to_number();
                    if n.is_nan() {
                        return Ok(Value::Number(f64::NAN));
                    }
                    result = if is_min { result.min(n) } else { result.max(n) };
                }
                Ok(Value::Number(result))
            }
            Builtin::JsonStringify => {
                let Some(json) = arg(&args, 0).to_json().map_err(ExecutionError::runtime)? else {
                    return Ok(Value::Undefined);
                };
                let pretty = match args.get(2) {
                    Some(Value::Number(n)) => *n >= 1.0,
                    Some(Value::String(s)) => !s.is_empty(),
                    _ => false,
                };
                let text = if pretty {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                }
                .map_err(|e| ExecutionError::runtime(e.to_string()))?;
                self.charge(GasCost::string_operation(text.len()))?;
                self.make_string(text)
            }
            Builtin::JsonParse => {
                let text = arg(&args, 0).to_display();
                self.charge(GasCost::string_operation(text.len()))?;
                let json: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|_| ExecutionError::runtime("Unexpected token in JSON input"))?;
                self.charge(GasCost::array_creation(text.len() / 8))?;
                Ok(Value::from_json(&json, false))
            }
            Builtin::ObjectKeys | Builtin::ObjectValues | Builtin::ObjectEntries => {
                let pairs: Vec<(String, Value)> = match arg(&args, 0) {
                    Value::Object(object) => {
                        let pairs = object
                            .borrow()
                            .items
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect::<Vec<_>>();
                        pairs
                    }
                    Value::Array(array) => {
                        let pairs = array
                            .borrow()
                            .items
                            .iter()
                            .enumerate()
                            .map(|(i, v)| (i.to_string(), v.clone()))
                            .collect::<Vec<_>>();
                        pairs
                    }
                    _ => Vec::new(),
                };
                self.charge(GasCost::array_creation(pairs.len()))?;
                let items = pairs
                    .into_iter()
                    .map(|(key, value)| match builtin {
                        Builtin::ObjectKeys => Value::string(key),
                        Builtin::ObjectValues => value,
                        _ => Value::new_array(vec![Value::string(key), value]),
                    })
                    .collect();
                Ok(Value::new_array(items))
            }
            Builtin::ArrayIsArray => Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_)))),
            Builtin::ConsoleLog => {
                let mut line = args
                    .iter()
                    .map(|value| match value {
                        Value::Array(_) | Value::Object(_) => value
                            .to_json()
                            .ok()
                            .flatten()
                            .map(|json| json.to_string())
                            .unwrap_or_else(|| value.to_display()),
                        other => other.to_display(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                self.charge(GasCost::string_operation(line.len()))?;
                if let Some((cut, _)) = line.char_indices().nth(MAX_LOG_LINE_CHARS) {
                    line.truncate(cut);
                }
                if self.logs.len() < self.limits.max_log_lines {
                    self.logs.push(line);
                }
                Ok(Value::Undefined)
            }
            Builtin::String => Ok(match args.first() {
                Some(value) => Value::string(value.to_display()),
                None => Value::string(""),
            }),
            Builtin::Number => Ok(Value::Number(
                args.first().map(Value::to_number).unwrap_or(0.0),
            )),
            Builtin::Boolean => Ok(Value::Bool(arg(&args, 0).truthy())),
            Builtin::ParseInt => Ok(Value::Number(parse_int(
                &arg(&args, 0).to_display(),
                args.get(1).map(Value::to_number),
            ))),
            Builtin::ParseFloat => Ok(Value::Number(parse_float(&arg(&args, 0).to_display()))),
            Builtin::IsNaN => Ok(Value::Bool(number_arg(&args, 0).is_nan())),
        }
    }

    /// Methods on strings, arrays and numbers.
    pub(super) fn call_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> ExecutionResult<Value> {
        self.charge(GasCost::FUNCTION_CALL)?;
        match receiver {
            Value::String(s) => self.string_method(s, name, &args),
            Value::Array(array) => self.array_method(array, name, args),
            Value::Number(n) => match name {
                "toFixed" => {
                    let digits = number_arg(&args, 0);
                    let digits = if digits.is_nan() { 0.0 } else { digits };
                    if !(0.0..=100.0).contains(&digits) {
                        return Err(ExecutionError::runtime("toFixed() digits argument must be between 0 and 100"));
                    }
                    if !n.is_finite() {
                        return Ok(Value::string(format_number(*n)));
                    }
                    Ok(Value::string(format!("{:.*}", digits as usize, n)))
                }
                "toString" => Ok(Value::string(format_number(*n))),
                _ => Err(not_a_function("number", name)),
            },
            other => Err(not_a_function(other.type_of(), name)),
        }
    }

    fn string_method(&mut self, s: &Rc<str>, name: &str, args: &[Value]) -> ExecutionResult<Value> {
        self.charge(GasCost::string_operation(s.len()))?;
        let text = |index: usize| arg(args, index).to_display();
        let char_len = || s.chars().count();
        let value = match name {
            "toUpperCase" => Value::string(s.to_uppercase()),
            "toLowerCase" => Value::string(s.to_lowercase()),
            "trim" => Value::string(s.trim()),
            "trimStart" => Value::string(s.trim_start()),
            "trimEnd" => Value::string(s.trim_end()),
            "toString" => Value::String(s.clone()),
            "includes" => Value::Bool(s.contains(text(0).as_str())),
            "startsWith" => Value::Bool(s.starts_with(text(0).as_str())),
            "endsWith" => Value::Bool(s.ends_with(text(0).as_str())),
            "indexOf" => Value::Number(match s.find(text(0).as_str()) {
                Some(byte) => s[..byte].chars().count() as f64,
                None => -1.0,
            }),
            "charAt" => {
                let index = relative_index(args.first(), usize::MAX, 0);
                Value::string(s.chars().nth(index).map(String::from).unwrap_or_default())
            }
            "slice" => {
                let len = char_len();
                let start = relative_index(args.first(), len, 0);
                let end = relative_index(args.get(1), len, len);
                Value::string(s.chars().skip(start).take(end.saturating_sub(start)).collect::<String>())
            }
            "substring" => {
                let len = char_len();
                let clamp = |value: Option<&Value>, default: usize| match value {
                    None | Some(Value::Undefined) => default,
                    Some(v) => {
                        let n = v.to_number();
                        if n.is_nan() || n < 0.0 { 0 } else { n.trunc().min(len as f64) as usize }
                    }
                };
                let (a, b) = (clamp(args.first(), 0), clamp(args.get(1), len));
                let (start, end) = (a.min(b), a.max(b));
                Value::string(s.chars().skip(start).take(end - start).collect::<String>())
            }
            "split" => {
                let parts: Vec<Value> = match args.first() {
                    None | Some(Value::Undefined) => vec![Value::String(s.clone())],
                    Some(separator) => {
                        let separator = separator.to_display();
                        if separator.is_empty() {
                            s.chars().map(|c| Value::string(c.to_string())).collect()
                        } else {
                            s.split(separator.as_str()).map(Value::string).collect()
                        }
                    }
                };
                self.charge(GasCost::array_creation(parts.len()))?;
                Value::new_array(parts)
            }
            "replace" => {
                let replaced = s.replacen(text(0).as_str(), text(1).as_str(), 1);
                self.make_string(replaced)?
            }
            "replaceAll" => {
                let pattern = text(0);
                if pattern.is_empty() {
                    return Err(ExecutionError::runtime("replaceAll() pattern must not be empty"));
                }
                let replaced = s.replace(pattern.as_str(), text(1).as_str());
                self.charge(GasCost::string_operation(replaced.len()))?;
                self.make_string(replaced)?
            }
            _ => return Err(not_a_function("string", name)),
        };
        Ok(value)
    }

    fn callback(args: &[Value]) -> ExecutionResult<Function> {
        match args.first() {
            Some(Value::Function(function)) => Ok(function.clone()),
            _ => Err(ExecutionError::runtime("callback is not a function")),
        }
    }

    fn array_method(&mut self, array: &ArrayRef, name: &str, args: Vec<Value>) -> ExecutionResult<Value> {
        match name {
            "push" => {
                self.charge(GasCost::ARRAY_ACCESS.saturating_mul(args.len() as u64))?;
                let mut inner = array.borrow_mut();
                if inner.frozen {
                    return Err(read_only("push"));
                }
                inner.items.extend(args);
                return Ok(Value::Number(inner.items.len() as f64));
            }
            "pop" => {
                self.charge(GasCost::ARRAY_ACCESS)?;
                let mut inner = array.borrow_mut();
                if inner.frozen {
                    return Err(read_only("pop"));
                }
                return Ok(inner.items.pop().unwrap_or(Value::Undefined));
            }
            _ => {}
        }

        let items = {
            let items = array.borrow().items.clone();
            items
        };
        match name {
            "includes" | "indexOf" => {
                self.charge(GasCost::COMPARISON.saturating_mul(items.len() as u64))?;
                let needle = arg(&args, 0);
                let position = items.iter().position(|item| item.strict_equals(&needle));
                Ok(if name == "includes" {
                    Value::Bool(position.is_some())
                } else {
                    Value::Number(position.map(|p| p as f64).unwrap_or(-1.0))
                })
            }
            "join" => {
                let separator = match args.first() {
                    None | Some(Value::Undefined) => ",".to_string(),
                    Some(value) => value.to_display(),
                };
                let joined = items
                    .iter()
                    .map(|item| if item.is_nullish() { String::new() } else { item.to_display() })
                    .collect::<Vec<_>>()
                    .join(&separator);
                self.charge(GasCost::string_operation(joined.len()))?;
                self.make_string(joined)
            }
            "slice" => {
                let start = relative_index(args.first(), items.len(), 0);
                let end = relative_index(args.get(1), items.len(), items.len());
                let sliced: Vec<Value> = items
                    .into_iter()
                    .skip(start)
                    .take(end.saturating_sub(start))
                    .collect();
                self.charge(GasCost::array_creation(sliced.len()))?;
                Ok(Value::new_array(sliced))
            }
            "concat" => {
                let mut joined = items;
                for value in args {
                    match value {
                        Value::Array(other) => {
                            let other = other.borrow().items.clone();
                            joined.extend(other);
                        }
                        other => joined.push(other),
                    }
                }
                self.charge(GasCost::array_creation(joined.len()))?;
                Ok(Value::new_array(joined))
            }
            "map" | "filter" | "forEach" | "find" | "some" | "every" => {
                let function = Self::callback(&args)?;
                let mut mapped = Vec::new();
                for (index, item) in items.into_iter().enumerate() {
                    self.charge(GasCost::LOOP_ITERATION)?;
                    let result =
                        self.call_function(&function, vec![item.clone(), Value::Number(index as f64)])?;
                    match name {
                        "map" => mapped.push(result),
                        "filter" if result.truthy() => mapped.push(item),
                        "find" if result.truthy() => return Ok(item),
                        "some" if result.truthy() => return Ok(Value::Bool(true)),
                        "every" if !result.truthy() => return Ok(Value::Bool(false)),
                        _ => {}
                    }
                }
                Ok(match name {
                    "map" | "filter" => {
                        self.charge(GasCost::array_creation(mapped.len()))?;
                        Value::new_array(mapped)
                    }
                    "some" => Value::Bool(false),
                    "every" => Value::Bool(true),
                    _ => Value::Undefined,
                })
            }
            "reduce" => {
                let function = Self::callback(&args)?;
                let mut items = items.into_iter().enumerate();
                let mut accumulator = match args.get(1) {
                    Some(initial) => initial.clone(),
                    None => match items.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(ExecutionError::runtime(
                                "Reduce of empty array with no initial value",
                            ))
                        }
                    },
                };
                for (index, item) in items {
                    self.charge(GasCost::LOOP_ITERATION)?;
                    accumulator = self.call_function(
                        &function,
                        vec![accumulator, item, Value::Number(index as f64)],
                    )?;
                }
                Ok(accumulator)
            }
            _ => Err(not_a_function("array", name)),
        }
    }
}

fn parse_int(text: &str, radix: Option<f64>) -> f64 {
    let mut s = text.trim();
    let negative = s.starts_with('-');
    if let Some(rest) = s.strip_prefix('-').or_else(|| s.strip_prefix('+')) {
        s = rest;
    }
    let explicit = match radix {
        Some(r) if !r.is_nan() && r != 0.0 => Some(r.trunc() as u32),
        _ => None,
    };
    let mut radix = explicit.unwrap_or(10);
    if matches!(explicit, None | Some(16)) {
        if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            radix = 16;
            s = rest;
        }
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let digits: String = s.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let magnitude = digits
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0f64, |acc, d| acc * f64::from(radix) + f64::from(d));
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

fn parse_float(text: &str) -> f64 {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    if s[end..].starts_with("Infinity") {
        return if s.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start || &s[digits_start..end] == "." {
        return f64::NAN;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    parse_number(&s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("42px", None), 42.0);
        assert_eq!(parse_int("  -17", None), -17.0);
        assert_eq!(parse_int("0x1f", None), 31.0);
        assert_eq!(parse_int("101", Some(2.0)), 5.0);
        assert!(parse_int("abc", None).is_nan());
    }

    #[test]
    fn test_parse_float() {
        assert_eq!(parse_float("3.14abc"), 3.14);
        assert_eq!(parse_float("-2.5e3x"), -2500.0);
        assert_eq!(parse_float("1e"), 1.0);
        assert!(parse_float(".").is_nan());
        assert!(parse_float("x1").is_nan());
    }

    #[test]
    fn test_relative_index() {
        let n = |v: f64| Value::Number(v);
        assert_eq!(relative_index(Some(&n(-2.0)), 5, 0), 3);
        assert_eq!(relative_index(Some(&n(10.0)), 5, 0), 5);
        assert_eq!(relative_index(None, 5, 5), 5);
        assert_eq!(relative_index(Some(&n(-10.0)), 5, 0), 0);
    }
}

//! Built-in functions. The names are part of the plan format.

use super::ast::Node;
use super::eval::Evaluator;
use super::ExprError;
use crate::extract::{self, Pattern};
use crate::value::Value;
use chrono::DateTime;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Patterns passed to `regex()`, compiled on first use.
static PATTERNS: LazyLock<RwLock<HashMap<String, Pattern>>> = LazyLock::new(Default::default);

/// Files compared by `equals_on_file()`, read on first use.
static FILES: LazyLock<RwLock<HashMap<String, Arc<str>>>> = LazyLock::new(Default::default);

pub(super) fn call(
    ev: &mut Evaluator<'_>,
    node: &Node,
    name: &str,
    args: &[Node],
) -> Result<Value, ExprError> {
    // exists() must see NotFound instead of propagating it.
    if name == "exists" {
        arity(name, args, 1)?;
        return match ev.eval(&args[0]) {
            Ok(_) => Ok(Value::Bool(true)),
            Err(ExprError::NotFound(_)) => Ok(Value::Bool(false)),
            Err(err) => Err(err),
        };
    }

    let values = args
        .iter()
        .map(|arg| ev.eval(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let result = match name {
        "not" => {
            arity(name, args, 1)?;
            match &values[0] {
                Value::Bool(b) => Value::Bool(!b),
                other => return Err(type_error(name, "bool", other)),
            }
        }
        "equals" => {
            arity(name, args, 2)?;
            Value::Bool(values[0].loose_eq(&values[1]))
        }
        "less_than" | "greater_than" => {
            arity(name, args, 2)?;
            let ordering = numeric_cmp(name, &values[0], &values[1])?;
            Value::Bool(if name == "less_than" {
                ordering == Ordering::Less
            } else {
                ordering == Ordering::Greater
            })
        }
        "in" => {
            arity(name, args, 2)?;
            match &values[1] {
                Value::List(items) => Value::Bool(items.iter().any(|i| i.loose_eq(&values[0]))),
                other => return Err(type_error(name, "list", other)),
            }
        }
        "contains" => {
            arity(name, args, 2)?;
            let haystack = text_arg(name, &values[0])?;
            let needle = text_arg(name, &values[1])?;
            Value::Bool(haystack.contains(needle.as_str()))
        }
        "range" => {
            arity(name, args, 3)?;
            let x = number_arg(name, &values[0])?;
            let lo = number_arg(name, &values[1])?;
            let hi = number_arg(name, &values[2])?;
            Value::Bool(lo <= x && x < hi)
        }
        "time" => {
            arity(name, args, 1)?;
            let text = text_arg(name, &values[0])?;
            let parsed = DateTime::parse_from_rfc3339(&text).map_err(|e| {
                ExprError::Argument(format!("time(): '{text}' is not RFC3339: {e}"))
            })?;
            Value::Time(parsed)
        }
        "json_path" | "xml_path" | "html_path" => {
            arity(name, args, 1)?;
            let path = text_arg(name, &values[0])?;
            let body = ev
                .scope()
                .body()
                .ok_or_else(|| ExprError::NotFound("response body".into()))?;
            let extracted = match name {
                "json_path" => extract::json_path(body, &path),
                "xml_path" => extract::xml_path(body, &path),
                _ => extract::html_path(body, &path),
            };
            let value = extracted.map_err(|e| ExprError::NotFound(e.to_string()))?;
            ev.record(node.to_string(), &value);
            value
        }
        "regex" => {
            arity(name, args, 3)?;
            let text = text_arg(name, &values[0])?;
            let pattern = text_arg(name, &values[1])?;
            let match_no = match &values[2] {
                Value::Int(i) if *i >= 0 => *i as usize,
                other => return Err(type_error(name, "non-negative int", other)),
            };
            let value = cached_pattern(&pattern)
                .and_then(|p| p.find(&text, match_no))
                .map_err(|e| ExprError::NotFound(e.to_string()))?;
            ev.record(node.to_string(), &value);
            value
        }
        "avg" | "min" | "max" | "p99" | "p98" | "p95" | "p90" | "p80" => {
            arity(name, args, 1)?;
            let numbers = number_list(name, &values[0])?;
            let value = aggregate(name, numbers)?;
            ev.record(node.to_string(), &value);
            value
        }
        "equals_on_file" => {
            arity(name, args, 2)?;
            let path = text_arg(name, &values[1])?;
            let content = cached_file(&path)?;
            Value::Bool(values[0].loose_eq(&Value::String(content.to_string())))
        }
        other => return Err(ExprError::NotFound(format!("function '{other}'"))),
    };

    Ok(result)
}

fn cached_pattern(pattern: &str) -> Result<Pattern, extract::ExtractError> {
    if let Some(compiled) = PATTERNS.read().get(pattern) {
        return Ok(compiled.clone());
    }
    let compiled = Pattern::new(pattern)?;
    PATTERNS
        .write()
        .insert(pattern.to_string(), compiled.clone());
    Ok(compiled)
}

fn cached_file(path: &str) -> Result<Arc<str>, ExprError> {
    if let Some(content) = FILES.read().get(path) {
        return Ok(content.clone());
    }
    let content: Arc<str> = std::fs::read_to_string(path)
        .map_err(|e| ExprError::Argument(format!("equals_on_file(): cannot read {path}: {e}")))?
        .into();
    FILES.write().insert(path.to_string(), content.clone());
    Ok(content)
}

fn arity(name: &str, args: &[Node], expected: usize) -> Result<(), ExprError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ExprError::Argument(format!(
            "{name}() takes {expected} argument(s), got {}",
            args.len()
        )))
    }
}

fn type_error(name: &str, expected: &str, got: &Value) -> ExprError {
    ExprError::Argument(format!(
        "{name}() expects {expected}, got {}",
        got.type_name()
    ))
}

fn text_arg(name: &str, value: &Value) -> Result<String, ExprError> {
    value
        .as_text()
        .map(|t| t.into_owned())
        .ok_or_else(|| type_error(name, "string", value))
}

fn number_arg(name: &str, value: &Value) -> Result<f64, ExprError> {
    value.as_f64().ok_or_else(|| type_error(name, "number", value))
}

fn numeric_cmp(name: &str, a: &Value, b: &Value) -> Result<Ordering, ExprError> {
    if !a.is_numeric() || !b.is_numeric() {
        let offender = if a.is_numeric() { b } else { a };
        return Err(type_error(name, "number", offender));
    }
    a.compare(b)
        .ok_or_else(|| ExprError::Argument(format!("{name}(): NaN is not comparable")))
}

fn number_list<'v>(name: &str, value: &'v Value) -> Result<Vec<&'v Value>, ExprError> {
    let Value::List(items) = value else {
        return Err(type_error(name, "list", value));
    };
    if items.is_empty() {
        return Err(ExprError::Argument(format!("{name}() of an empty list")));
    }
    items
        .iter()
        .map(|item| {
            if item.is_numeric() {
                Ok(item)
            } else {
                Err(type_error(name, "list of numbers", item))
            }
        })
        .collect()
}

fn aggregate(name: &str, mut numbers: Vec<&Value>) -> Result<Value, ExprError> {
    if name == "avg" {
        let sum: f64 = numbers.iter().filter_map(|v| v.as_f64()).sum();
        return Ok(Value::Float(sum / numbers.len() as f64));
    }

    numbers.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
    let picked = match name {
        "min" => numbers[0],
        "max" => numbers[numbers.len() - 1],
        _ => {
            let pct: f64 = name[1..]
                .parse()
                .map_err(|_| ExprError::NotFound(format!("function '{name}'")))?;
            numbers[nearest_rank(pct, numbers.len())]
        }
    };
    Ok(picked.clone())
}

/// Nearest-rank percentile index into a sorted slice of length `len`.
pub(crate) fn nearest_rank(pct: f64, len: usize) -> usize {
    let rank = ((pct / 100.0) * len as f64).ceil() as usize;
    rank.clamp(1, len) - 1
}

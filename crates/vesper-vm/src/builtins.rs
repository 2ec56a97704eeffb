//! Core builtin functions and the method tables for string, list, and
//! map values.
//!
//! Methods receive their receiver as the first argument; higher-order
//! methods call back into the VM through [`HostContext`], so resource
//! limits keep applying inside callbacks.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::error::VmError;
use crate::value::{Builtin, HostContext, MapValue, Value};

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<(), VmError> {
    if args.len() != count {
        return Err(VmError::args_error(format!(
            "{}() takes exactly {} argument{} ({} given)",
            name,
            count,
            if count == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

/// The default global environment, in slot order.
pub fn builtin_globals() -> Vec<(String, Value)> {
    let mut globals: Vec<(String, Value)> = Vec::new();
    let mut add = |name: &str, func: fn(&mut dyn HostContext, &[Value]) -> Result<Value, VmError>| {
        globals.push((
            name.to_string(),
            Value::Builtin(Rc::new(Builtin::new(name, func))),
        ));
    };

    add("print", |_, args| {
        let parts: Vec<String> = args.iter().map(|arg| format!("{}", arg)).collect();
        println!("{}", parts.join(" "));
        Ok(Value::Nil)
    });

    add("len", |_, args| {
        expect_args("len", args, 1)?;
        match &args[0] {
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(items.borrow().len() as i64)),
            Value::Map(map) => Ok(Value::Int(map.borrow().len() as i64)),
            other => Err(VmError::type_error(format!(
                "len() not supported for {}",
                other.type_name()
            ))),
        }
    });

    add("type", |_, args| {
        expect_args("type", args, 1)?;
        Ok(Value::string(args[0].type_name().to_string()))
    });

    add("string", |_, args| {
        expect_args("string", args, 1)?;
        match &args[0] {
            Value::String(_) => Ok(args[0].clone()),
            other => Ok(Value::string(format!("{}", other))),
        }
    });

    add("int", |_, args| {
        expect_args("int", args, 1)?;
        match &args[0] {
            Value::Int(_) => Ok(args[0].clone()),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| VmError::value_error(format!("cannot convert \"{}\" to int", s))),
            other => Err(VmError::type_error(format!(
                "cannot convert {} to int",
                other.type_name()
            ))),
        }
    });

    add("float", |_, args| {
        expect_args("float", args, 1)?;
        match &args[0] {
            Value::Float(_) => Ok(args[0].clone()),
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| VmError::value_error(format!("cannot convert \"{}\" to float", s))),
            other => Err(VmError::type_error(format!(
                "cannot convert {} to float",
                other.type_name()
            ))),
        }
    });

    add("bool", |_, args| {
        expect_args("bool", args, 1)?;
        Ok(Value::Bool(args[0].is_truthy()))
    });

    add("list", |_, args| {
        if args.is_empty() {
            return Ok(Value::list(Vec::new()));
        }
        expect_args("list", args, 1)?;
        match &args[0] {
            Value::List(items) => Ok(Value::list(items.borrow().clone())),
            Value::String(s) => Ok(Value::list(
                s.chars().map(|c| Value::string(c.to_string())).collect(),
            )),
            Value::Map(map) => Ok(Value::list(
                map.borrow().keys().map(|k| Value::String(k.clone())).collect(),
            )),
            other => Err(VmError::type_error(format!(
                "cannot convert {} to list",
                other.type_name()
            ))),
        }
    });

    add("range", |_, args| {
        let int_arg = |value: &Value| match value {
            Value::Int(n) => Ok(*n),
            other => Err(VmError::type_error(format!(
                "range() arguments must be integers, got {}",
                other.type_name()
            ))),
        };
        let (start, end, step) = match args.len() {
            1 => (0, int_arg(&args[0])?, 1),
            2 => (int_arg(&args[0])?, int_arg(&args[1])?, 1),
            3 => (int_arg(&args[0])?, int_arg(&args[1])?, int_arg(&args[2])?),
            n => {
                return Err(VmError::args_error(format!(
                    "range() takes 1 to 3 arguments ({} given)",
                    n
                )))
            }
        };
        if step == 0 {
            return Err(VmError::value_error("range() step cannot be zero"));
        }
        let mut items = Vec::new();
        let mut at = start;
        while (step > 0 && at < end) || (step < 0 && at > end) {
            items.push(Value::Int(at));
            at += step;
        }
        Ok(Value::list(items))
    });

    add("error", |_, args| {
        expect_args("error", args, 1)?;
        let message = match &args[0] {
            Value::String(s) => s.to_string(),
            other => format!("{}", other),
        };
        Ok(Value::error(message))
    });

    add("assert", |_, args| {
        if args.is_empty() {
            return Err(VmError::args_error(
                "assert() requires at least 1 argument (0 given)",
            ));
        }
        if !args[0].is_truthy() {
            let message = match args.get(1) {
                Some(Value::String(s)) => s.to_string(),
                Some(other) => format!("{}", other),
                None => "assertion failed".to_string(),
            };
            return Err(VmError::runtime(message));
        }
        Ok(Value::Nil)
    });

    add("keys", |_, args| {
        expect_args("keys", args, 1)?;
        match &args[0] {
            Value::Map(map) => Ok(Value::list(
                map.borrow().keys().map(|k| Value::String(k.clone())).collect(),
            )),
            other => Err(VmError::type_error(format!(
                "keys() requires a map, got {}",
                other.type_name()
            ))),
        }
    });

    add("values", |_, args| {
        expect_args("values", args, 1)?;
        match &args[0] {
            Value::Map(map) => Ok(Value::list(map.borrow().values().cloned().collect())),
            other => Err(VmError::type_error(format!(
                "values() requires a map, got {}",
                other.type_name()
            ))),
        }
    });

    add("sorted", |_, args| {
        expect_args("sorted", args, 1)?;
        match &args[0] {
            Value::List(items) => {
                let mut sorted = items.borrow().clone();
                sorted.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
                Ok(Value::list(sorted))
            }
            other => Err(VmError::type_error(format!(
                "sorted() requires a list, got {}",
                other.type_name()
            ))),
        }
    });

    add("reversed", |_, args| {
        expect_args("reversed", args, 1)?;
        match &args[0] {
            Value::List(items) => {
                let mut reversed = items.borrow().clone();
                reversed.reverse();
                Ok(Value::list(reversed))
            }
            Value::String(s) => Ok(Value::string(s.chars().rev().collect::<String>())),
            other => Err(VmError::type_error(format!(
                "reversed() requires a list or string, got {}",
                other.type_name()
            ))),
        }
    });

    add("min", |_, args| reduce_extreme("min", args, Ordering::Less));
    add("max", |_, args| reduce_extreme("max", args, Ordering::Greater));

    add("sum", |_, args| {
        if args.is_empty() {
            return Err(VmError::args_error(
                "sum() requires at least 1 argument (0 given)",
            ));
        }
        let items: Vec<Value> = if args.len() == 1 {
            match &args[0] {
                Value::List(items) => items.borrow().clone(),
                _ => args.to_vec(),
            }
        } else {
            args.to_vec()
        };
        let mut total = 0.0;
        let mut saw_float = false;
        for item in &items {
            match item {
                Value::Int(n) => total += *n as f64,
                Value::Float(n) => {
                    total += n;
                    saw_float = true;
                }
                other => {
                    return Err(VmError::type_error(format!(
                        "cannot sum {}",
                        other.type_name()
                    )))
                }
            }
        }
        Ok(if saw_float {
            Value::Float(total)
        } else {
            Value::Int(total as i64)
        })
    });

    add("abs", |_, args| {
        expect_args("abs", args, 1)?;
        match &args[0] {
            Value::Int(n) => Ok(Value::Int(n.wrapping_abs())),
            Value::Float(n) => Ok(Value::Float(n.abs())),
            other => Err(VmError::type_error(format!(
                "abs() requires a number, got {}",
                other.type_name()
            ))),
        }
    });

    add("round", |_, args| {
        expect_args("round", args, 1)?;
        match &args[0] {
            Value::Int(_) => Ok(args[0].clone()),
            Value::Float(n) => Ok(Value::Int(n.round() as i64)),
            other => Err(VmError::type_error(format!(
                "round() requires a number, got {}",
                other.type_name()
            ))),
        }
    });

    add("floor", |_, args| {
        expect_args("floor", args, 1)?;
        match &args[0] {
            Value::Int(_) => Ok(args[0].clone()),
            Value::Float(n) => Ok(Value::Int(n.floor() as i64)),
            other => Err(VmError::type_error(format!(
                "floor() requires a number, got {}",
                other.type_name()
            ))),
        }
    });

    add("ceil", |_, args| {
        expect_args("ceil", args, 1)?;
        match &args[0] {
            Value::Int(_) => Ok(args[0].clone()),
            Value::Float(n) => Ok(Value::Int(n.ceil() as i64)),
            other => Err(VmError::type_error(format!(
                "ceil() requires a number, got {}",
                other.type_name()
            ))),
        }
    });

    globals
}

fn reduce_extreme(name: &str, args: &[Value], wanted: Ordering) -> Result<Value, VmError> {
    if args.is_empty() {
        return Err(VmError::args_error(format!(
            "{}() requires at least 1 argument (0 given)",
            name
        )));
    }
    let items: Vec<Value> = if args.len() == 1 {
        match &args[0] {
            Value::List(items) => items.borrow().clone(),
            _ => args.to_vec(),
        }
    } else {
        args.to_vec()
    };
    if items.is_empty() {
        return Err(VmError::value_error(format!("{}() of empty sequence", name)));
    }
    let mut best = items[0].clone();
    for item in items.iter().skip(1) {
        if item.compare(&best) == Some(wanted) {
            best = item.clone();
        }
    }
    Ok(best)
}

/// Names callable as methods, per receiver type; used for attribute
/// error suggestions.
pub fn attr_candidates(value: &Value) -> Vec<String> {
    let names: &[&str] = match value {
        Value::String(_) => &["len", "upper", "lower", "trim", "split", "contains"],
        Value::List(_) => &[
            "len", "append", "pop", "map", "filter", "reduce", "each", "join", "reverse",
            "sort", "contains", "index",
        ],
        Value::Map(_) => &[
            "len", "keys", "values", "entries", "get", "set", "delete", "has", "each",
        ],
        Value::Error(_) => &["message", "kind", "context"],
        _ => &[],
    };
    let mut candidates: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    if let Value::Map(map) = value {
        candidates.extend(map.borrow().keys().map(|k| k.to_string()));
    }
    candidates
}

/// Resolve a method on a receiver. The bound builtin expects the
/// receiver back as its first argument at call time.
pub fn lookup_method(value: &Value, name: &str) -> Option<Value> {
    match value {
        Value::String(s) => string_method(s, name),
        Value::List(items) => list_method(items, name),
        Value::Map(map) => map_method(map, name),
        _ => None,
    }
}

fn method_arg<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a Value, VmError> {
    args.get(index).ok_or_else(|| {
        VmError::args_error(format!(
            "{}() takes {} argument{} ({} given)",
            name,
            index,
            if index == 1 { "" } else { "s" },
            args.len().saturating_sub(1)
        ))
    })
}

fn string_method(s: &Rc<str>, name: &str) -> Option<Value> {
    let builtin = match name {
        "len" => {
            let s = s.clone();
            Builtin::bound(name, move |_, _| Ok(Value::Int(s.chars().count() as i64)))
        }
        "upper" => {
            let s = s.clone();
            Builtin::bound(name, move |_, _| Ok(Value::string(s.to_uppercase())))
        }
        "lower" => {
            let s = s.clone();
            Builtin::bound(name, move |_, _| Ok(Value::string(s.to_lowercase())))
        }
        "trim" => {
            let s = s.clone();
            Builtin::bound(name, move |_, _| Ok(Value::string(s.trim().to_string())))
        }
        "split" => {
            let s = s.clone();
            Builtin::bound(name, move |_, args| {
                let parts: Vec<Value> = match args.get(1) {
                    Some(Value::String(sep)) if !sep.is_empty() => s
                        .split(sep.as_ref())
                        .map(|p| Value::string(p.to_string()))
                        .collect(),
                    Some(other) if !matches!(other, Value::String(_)) => {
                        return Err(VmError::type_error(format!(
                            "split() separator must be a string, got {}",
                            other.type_name()
                        )))
                    }
                    // No (or empty) separator splits on whitespace.
                    _ => s
                        .split_whitespace()
                        .map(|p| Value::string(p.to_string()))
                        .collect(),
                };
                Ok(Value::list(parts))
            })
        }
        "contains" => {
            let s = s.clone();
            Builtin::bound(name, move |_, args| {
                match method_arg("contains", args, 1)? {
                    Value::String(needle) => Ok(Value::Bool(s.contains(needle.as_ref()))),
                    other => Err(VmError::type_error(format!(
                        "contains() requires a string, got {}",
                        other.type_name()
                    ))),
                }
            })
        }
        _ => return None,
    };
    Some(Value::Builtin(Rc::new(builtin)))
}

fn list_method(items: &Rc<RefCell<Vec<Value>>>, name: &str) -> Option<Value> {
    let builtin = match name {
        "len" => {
            let items = items.clone();
            Builtin::bound(name, move |_, _| Ok(Value::Int(items.borrow().len() as i64)))
        }
        "append" => {
            let items = items.clone();
            Builtin::bound(name, move |_, args| {
                items
                    .borrow_mut()
                    .push(method_arg("append", args, 1)?.clone());
                Ok(Value::Nil)
            })
        }
        "pop" => {
            let items = items.clone();
            Builtin::bound(name, move |_, _| {
                items
                    .borrow_mut()
                    .pop()
                    .ok_or_else(|| VmError::value_error("pop from empty list"))
            })
        }
        "map" => {
            let items = items.clone();
            Builtin::bound(name, move |ctx, args| {
                let func = method_arg("map", args, 1)?;
                let snapshot = items.borrow().clone();
                let mut mapped = Vec::with_capacity(snapshot.len());
                for item in snapshot {
                    mapped.push(ctx.call_value(func, &[item])?);
                }
                Ok(Value::list(mapped))
            })
        }
        "filter" => {
            let items = items.clone();
            Builtin::bound(name, move |ctx, args| {
                let func = method_arg("filter", args, 1)?;
                let snapshot = items.borrow().clone();
                let mut kept = Vec::new();
                for item in snapshot {
                    if ctx.call_value(func, &[item.clone()])?.is_truthy() {
                        kept.push(item);
                    }
                }
                Ok(Value::list(kept))
            })
        }
        "reduce" => {
            let items = items.clone();
            Builtin::bound(name, move |ctx, args| {
                let func = method_arg("reduce", args, 1)?;
                let snapshot = items.borrow().clone();
                let (mut acc, skip) = match args.get(2) {
                    Some(initial) => (initial.clone(), 0),
                    None => (
                        snapshot.first().cloned().unwrap_or(Value::Nil),
                        1,
                    ),
                };
                for item in snapshot.into_iter().skip(skip) {
                    acc = ctx.call_value(func, &[acc, item])?;
                }
                Ok(acc)
            })
        }
        "each" => {
            let items = items.clone();
            Builtin::bound(name, move |ctx, args| {
                let func = method_arg("each", args, 1)?;
                let snapshot = items.borrow().clone();
                for item in snapshot {
                    ctx.call_value(func, &[item])?;
                }
                Ok(Value::Nil)
            })
        }
        "join" => {
            let items = items.clone();
            Builtin::bound(name, move |_, args| {
                let sep = match args.get(1) {
                    Some(Value::String(s)) => s.to_string(),
                    _ => String::new(),
                };
                let parts: Vec<String> =
                    items.borrow().iter().map(|v| format!("{}", v)).collect();
                Ok(Value::string(parts.join(&sep)))
            })
        }
        "reverse" => {
            let items = items.clone();
            Builtin::bound(name, move |_, _| {
                let mut reversed = items.borrow().clone();
                reversed.reverse();
                Ok(Value::list(reversed))
            })
        }
        "sort" => {
            let items = items.clone();
            Builtin::bound(name, move |_, _| {
                let mut sorted = items.borrow().clone();
                sorted.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
                Ok(Value::list(sorted))
            })
        }
        "contains" => {
            let items = items.clone();
            Builtin::bound(name, move |_, args| {
                let needle = method_arg("contains", args, 1)?;
                Ok(Value::Bool(
                    items.borrow().iter().any(|item| item.equals(needle)),
                ))
            })
        }
        "index" => {
            let items = items.clone();
            Builtin::bound(name, move |_, args| {
                let needle = method_arg("index", args, 1)?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if item.equals(needle) {
                        return Ok(Value::Int(i as i64));
                    }
                }
                Ok(Value::Nil)
            })
        }
        _ => return None,
    };
    Some(Value::Builtin(Rc::new(builtin)))
}

fn map_method(map: &Rc<RefCell<MapValue>>, name: &str) -> Option<Value> {
    let builtin = match name {
        "len" => {
            let map = map.clone();
            Builtin::bound(name, move |_, _| Ok(Value::Int(map.borrow().len() as i64)))
        }
        "keys" => {
            let map = map.clone();
            Builtin::bound(name, move |_, _| {
                Ok(Value::list(
                    map.borrow().keys().map(|k| Value::String(k.clone())).collect(),
                ))
            })
        }
        "values" => {
            let map = map.clone();
            Builtin::bound(name, move |_, _| {
                Ok(Value::list(map.borrow().values().cloned().collect()))
            })
        }
        "entries" => {
            let map = map.clone();
            Builtin::bound(name, move |_, _| {
                let entries: Vec<Value> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| Value::list(vec![Value::String(k.clone()), v.clone()]))
                    .collect();
                Ok(Value::list(entries))
            })
        }
        "get" => {
            let map = map.clone();
            Builtin::bound(name, move |_, args| {
                let key = match method_arg("get", args, 1)? {
                    Value::String(key) => key.clone(),
                    other => {
                        return Err(VmError::type_error(format!(
                            "map keys must be strings, got {}",
                            other.type_name()
                        )))
                    }
                };
                Ok(map
                    .borrow()
                    .get(&key)
                    .cloned()
                    .or_else(|| args.get(2).cloned())
                    .unwrap_or(Value::Nil))
            })
        }
        "set" => {
            let map = map.clone();
            Builtin::bound(name, move |_, args| {
                let key = match method_arg("set", args, 1)? {
                    Value::String(key) => key.clone(),
                    other => {
                        return Err(VmError::type_error(format!(
                            "map keys must be strings, got {}",
                            other.type_name()
                        )))
                    }
                };
                let value = method_arg("set", args, 2)?.clone();
                map.borrow_mut().insert(key, value);
                Ok(Value::Nil)
            })
        }
        "delete" => {
            let map = map.clone();
            Builtin::bound(name, move |_, args| {
                match method_arg("delete", args, 1)? {
                    Value::String(key) => Ok(Value::Bool(map.borrow_mut().remove(key).is_some())),
                    _ => Ok(Value::Bool(false)),
                }
            })
        }
        "has" => {
            let map = map.clone();
            Builtin::bound(name, move |_, args| {
                match method_arg("has", args, 1)? {
                    Value::String(key) => Ok(Value::Bool(map.borrow().contains_key(key))),
                    _ => Ok(Value::Bool(false)),
                }
            })
        }
        "each" => {
            let map = map.clone();
            Builtin::bound(name, move |ctx, args| {
                let func = method_arg("each", args, 1)?;
                let snapshot: Vec<(Rc<str>, Value)> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, value) in snapshot {
                    ctx.call_value(func, &[Value::String(key), value])?;
                }
                Ok(Value::Nil)
            })
        }
        _ => return None,
    };
    Some(Value::Builtin(Rc::new(builtin)))
}

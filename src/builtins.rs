//! Built-in filters and tests, registered on every new environment.

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::value::{escape_html, Value};

/// Install the default filter and test set.
pub(crate) fn register(env: &mut Environment) {
    env.add_filter("upper", |value, _args, _kwargs, _ctx| {
        Ok(Value::String(value.to_string().to_uppercase()))
    });
    env.add_filter("lower", |value, _args, _kwargs, _ctx| {
        Ok(Value::String(value.to_string().to_lowercase()))
    });
    env.add_filter("trim", |value, _args, _kwargs, _ctx| {
        Ok(Value::String(value.to_string().trim().to_string()))
    });
    env.add_filter("length", filter_length);
    env.add_filter("count", filter_length);
    env.add_filter("join", |value, args, _kwargs, _ctx| {
        let sep = match args.first() {
            Some(sep) => sep.to_string(),
            None => String::new(),
        };
        match value {
            Value::Seq(items) => {
                let parts: Vec<String> = items.iter().map(|item| item.to_string()).collect();
                Ok(Value::String(parts.join(&sep)))
            }
            other => Err(Error::render(
                format!("cannot join {}", other.kind_name()),
                0,
                0,
            )),
        }
    });
    // `default` treats both undefined and none as absent, so chained
    // lookups degrade gracefully either way.
    env.add_filter("default", filter_default);
    env.add_filter("d", filter_default);
    env.add_filter("escape", filter_escape);
    env.add_filter("e", filter_escape);
    env.add_filter("safe", |value, _args, _kwargs, _ctx| {
        Ok(Value::Safe(value.to_string()))
    });
    env.add_filter("first", |value, _args, _kwargs, _ctx| match value {
        Value::Seq(items) => Ok(items.first().cloned().unwrap_or(Value::Undefined)),
        Value::String(s) | Value::Safe(s) => Ok(s
            .chars()
            .next()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Undefined)),
        other => Err(Error::render(
            format!("cannot take first of {}", other.kind_name()),
            0,
            0,
        )),
    });
    env.add_filter("last", |value, _args, _kwargs, _ctx| match value {
        Value::Seq(items) => Ok(items.last().cloned().unwrap_or(Value::Undefined)),
        Value::String(s) | Value::Safe(s) => Ok(s
            .chars()
            .last()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Undefined)),
        other => Err(Error::render(
            format!("cannot take last of {}", other.kind_name()),
            0,
            0,
        )),
    });
    env.add_filter("capitalize", |value, _args, _kwargs, _ctx| {
        let s = value.to_string();
        let mut chars = s.chars();
        Ok(Value::String(match chars.next() {
            Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
            None => String::new(),
        }))
    });
    env.add_filter("replace", |value, args, _kwargs, _ctx| {
        let [from, to] = args else {
            return Err(Error::render("replace takes two arguments", 0, 0));
        };
        Ok(Value::String(
            value.to_string().replace(&from.to_string(), &to.to_string()),
        ))
    });
    env.add_filter("reverse", |value, _args, _kwargs, _ctx| match value {
        Value::Seq(items) => Ok(Value::Seq(items.iter().rev().cloned().collect())),
        Value::String(s) | Value::Safe(s) => Ok(Value::String(s.chars().rev().collect())),
        other => Err(Error::render(
            format!("cannot reverse {}", other.kind_name()),
            0,
            0,
        )),
    });
    env.add_filter("abs", |value, _args, _kwargs, _ctx| match value {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(Error::render(
            format!("abs on {}", other.kind_name()),
            0,
            0,
        )),
    });
    env.add_filter("int", |value, _args, _kwargs, _ctx| {
        let result = match value {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(*b as i64),
            Value::String(s) | Value::Safe(s) => s.trim().parse().ok(),
            _ => None,
        };
        Ok(result.map(Value::Int).unwrap_or(Value::Int(0)))
    });
    env.add_filter("string", |value, _args, _kwargs, _ctx| {
        Ok(Value::String(value.to_string()))
    });
    env.add_filter("list", |value, _args, _kwargs, _ctx| match value {
        Value::Seq(items) => Ok(Value::Seq(items.clone())),
        Value::String(s) | Value::Safe(s) => Ok(Value::Seq(
            s.chars().map(|c| Value::String(c.to_string())).collect(),
        )),
        Value::Map(map) => Ok(Value::Seq(map.keys().map(Value::from).collect())),
        other => Err(Error::render(
            format!("cannot make a list from {}", other.kind_name()),
            0,
            0,
        )),
    });

    env.add_test("defined", |value, _args, _ctx| Ok(!value.is_undefined()));
    env.add_test("undefined", |value, _args, _ctx| Ok(value.is_undefined()));
    env.add_test("none", |value, _args, _ctx| Ok(value.is_none()));
    env.add_test("string", |value, _args, _ctx| {
        Ok(matches!(value, Value::String(_) | Value::Safe(_)))
    });
    env.add_test("number", |value, _args, _ctx| Ok(value.is_number()));
    env.add_test("even", int_test(|n| n % 2 == 0));
    env.add_test("odd", int_test(|n| n % 2 != 0));
    env.add_test("divisibleby", |value, args, _ctx| {
        let (Value::Int(n), Some(Value::Int(d))) = (value, args.first()) else {
            return Err(Error::render("divisibleby expects integers", 0, 0));
        };
        if *d == 0 {
            return Err(Error::render("divisibleby zero", 0, 0));
        }
        Ok(n % d == 0)
    });
    env.add_test("eq", |value, args, _ctx| {
        Ok(args.first().is_some_and(|other| value == other))
    });
    env.add_test("ne", |value, args, _ctx| {
        Ok(args.first().is_some_and(|other| value != other))
    });
    env.add_test("in", |value, args, _ctx| match args.first() {
        Some(Value::Seq(items)) => Ok(items.iter().any(|item| item == value)),
        Some(Value::String(s) | Value::Safe(s)) => {
            Ok(value.as_str().is_some_and(|needle| s.contains(needle)))
        }
        Some(Value::Map(map)) => Ok(value.as_str().is_some_and(|key| map.contains_key(key))),
        _ => Ok(false),
    });
    env.add_test("true", |value, _args, _ctx| {
        Ok(matches!(value, Value::Bool(true)))
    });
    env.add_test("false", |value, _args, _ctx| {
        Ok(matches!(value, Value::Bool(false)))
    });
}

fn filter_length(
    value: &Value,
    _args: &[Value],
    _kwargs: &std::collections::HashMap<String, Value>,
    _ctx: &crate::environment::CallContext<'_>,
) -> Result<Value> {
    match value {
        Value::Seq(items) => Ok(Value::Int(items.len() as i64)),
        Value::Map(map) => Ok(Value::Int(map.len() as i64)),
        Value::String(s) | Value::Safe(s) => Ok(Value::Int(s.chars().count() as i64)),
        other => Err(Error::render(
            format!("{} has no length", other.kind_name()),
            0,
            0,
        )),
    }
}

fn filter_default(
    value: &Value,
    args: &[Value],
    _kwargs: &std::collections::HashMap<String, Value>,
    _ctx: &crate::environment::CallContext<'_>,
) -> Result<Value> {
    if value.is_undefined() || value.is_none() {
        Ok(args.first().cloned().unwrap_or(Value::String(String::new())))
    } else {
        Ok(value.clone())
    }
}

fn filter_escape(
    value: &Value,
    _args: &[Value],
    _kwargs: &std::collections::HashMap<String, Value>,
    _ctx: &crate::environment::CallContext<'_>,
) -> Result<Value> {
    if value.is_safe() {
        return Ok(value.clone());
    }
    Ok(Value::Safe(escape_html(&value.to_string())))
}

/// Integer tests wrap a shared predicate; non-integers are errors.
fn int_test(
    pred: fn(i64) -> bool,
) -> impl Fn(&Value, &[Value], &crate::environment::CallContext<'_>) -> Result<bool> {
    move |value, _args, _ctx| match value {
        Value::Int(n) => Ok(pred(*n)),
        other => Err(Error::render(
            format!("expected an integer, got {}", other.kind_name()),
            0,
            0,
        )),
    }
}

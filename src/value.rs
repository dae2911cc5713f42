use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ast::Stmt;

/// An insertion-ordered string-keyed map.
///
/// Templates iterate mappings in the order keys were bound, so a plain
/// `HashMap` is not enough; inserts that hit an existing key keep the
/// original position.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    entries: Vec<(String, Value)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| o == v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// The runtime value union templates evaluate over.
///
/// Values are passed by sharing; the renderer never mutates a value in
/// place, it only rebinds names in scopes.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    /// The lenient-mode sentinel for a missing binding. Falsy, renders as
    /// the empty string, and only distinguishable from `Null` via the
    /// `defined`/`undefined` tests.
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Marked-safe string: output that bypasses auto-escaping.
    Safe(String),
    Seq(Vec<Value>),
    Map(ValueMap),
    /// The `caller()` body bound inside a `{% call %}`-invoked macro.
    Caller(Arc<Vec<Stmt>>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Undefined => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) | Value::Safe(s) => !s.is_empty(),
            Value::Seq(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Caller(_) => true,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Value::Safe(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Safe(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Type name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) | Value::Safe(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
            Value::Caller(_) => "caller",
        }
    }

    /// Quoted, nested representation used when sequences and mappings are
    /// stringified (`{{ [1, 'a'] }}` renders as `[1, 'a']`).
    pub fn repr(&self) -> String {
        match self {
            Value::Null => "none".to_string(),
            Value::Undefined => "undefined".to_string(),
            Value::String(s) | Value::Safe(s) => format!("'{s}'"),
            Value::Seq(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Null and the undefined sentinel both render as nothing.
            Value::Null | Value::Undefined => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::String(s) | Value::Safe(s) => f.write_str(s),
            Value::Seq(_) | Value::Map(_) => f.write_str(&self.repr()),
            Value::Caller(_) => f.write_str("<caller>"),
        }
    }
}

/// Equality is numeric-aware: `1 == 1.0` holds, and marked-safe strings
/// compare equal to plain strings with the same content.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a) | Value::Safe(a), Value::String(b) | Value::Safe(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Ordering for `< <= > >=`. `None` means the two kinds are not
    /// comparable and the renderer reports a type error.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => {
                a.as_f64().unwrap().partial_cmp(&b.as_f64().unwrap())
            }
            (Value::String(a) | Value::Safe(a), Value::String(b) | Value::Safe(b)) => {
                Some(a.cmp(b))
            }
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Seq(a), Value::Seq(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        std::cmp::Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Seq(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(map: HashMap<String, Value>) -> Self {
        Value::Map(map.into_iter().collect())
    }
}

/// HTML-escape `&`, `<`, `>`, `"`, and `'`.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(!Value::Seq(vec![]).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::from("x").is_truthy());
    }

    #[test]
    fn numeric_equality_crosses_representations() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Float(1.5));
        assert_ne!(Value::Null, Value::Undefined);
    }

    #[test]
    fn map_preserves_insertion_order() {
        let mut map = ValueMap::new();
        map.insert("b", 1);
        map.insert("a", 2);
        map.insert("b", 3);
        let keys: Vec<&str> = map.keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(map.get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn floats_render_with_a_decimal_point() {
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
    }

    #[test]
    fn escape_html_covers_the_five_specials() {
        assert_eq!(escape_html("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#x27;");
    }
}

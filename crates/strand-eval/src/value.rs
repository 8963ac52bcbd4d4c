//! Runtime values for Strand.
//!
//! `Value` is a closed enum. Aggregates keep their payload behind an `Arc` as a
//! sorted vector, so clone is O(1) and equality/hashing are structural and
//! independent of construction order. Updates never mutate a shared payload:
//! they go through `Arc::make_mut`, which copies when the payload is aliased
//! (for example by a context snapshot taken with `get_context`).
//!
//! Values are totally ordered. The order compares a type class first and the
//! payload second, so minimum selection, set layout and dict key layout are
//! the same on every run.

use crate::context::Context;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// Runtime value.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(into = "ValueRepr", from = "ValueRepr")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// String value.
    Atom(Arc<str>),
    /// The absence marker.
    None,
    /// Sorted, deduplicated elements.
    Set(Arc<Vec<Value>>),
    /// Entries sorted by key. Used as tuple/list (keys 0..n), record
    /// (atom keys) and bag (value -> count).
    Dict(Arc<Vec<(Value, Value)>>),
    /// Path of index keys from a root dict.
    Address(Arc<Vec<Value>>),
    /// Instruction index.
    Pc(usize),
    /// Placeholder for a code address, replaced when a program is linked.
    Label(Arc<str>),
    /// Snapshot of a thread.
    Context(Arc<Context>),
}

/// Failure to resolve an address path inside a nested dict.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("{0} is not a dictionary")]
    NotADict(Value),

    #[error("no entry {key} in {container}")]
    NoEntry { key: Value, container: Value },

    #[error("bad address")]
    BadAddress,
}

// === Constructors ===

impl Value {
    pub fn atom(s: &str) -> Self {
        Value::Atom(Arc::from(s))
    }

    pub fn label(s: &str) -> Self {
        Value::Label(Arc::from(s))
    }

    pub fn empty_set() -> Self {
        Value::Set(Arc::new(Vec::new()))
    }

    pub fn empty_dict() -> Self {
        Value::Dict(Arc::new(Vec::new()))
    }

    pub fn set_from_iter(iter: impl IntoIterator<Item = Value>) -> Self {
        let mut v: Vec<Value> = iter.into_iter().collect();
        v.sort();
        v.dedup();
        Value::Set(Arc::new(v))
    }

    /// Later entries win when a key repeats.
    pub fn dict_from_iter(iter: impl IntoIterator<Item = (Value, Value)>) -> Self {
        let mut entries = Vec::new();
        for (k, v) in iter {
            Value::dict_insert(&mut entries, k, v);
        }
        Value::Dict(Arc::new(entries))
    }

    /// A list is a dict keyed by 0..n.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        let entries = items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (Value::Int(i as i64), v))
            .collect();
        Value::Dict(Arc::new(entries))
    }

    pub fn address(keys: impl IntoIterator<Item = Value>) -> Self {
        Value::Address(Arc::new(keys.into_iter().collect()))
    }

    pub fn context(ctx: Context) -> Self {
        Value::Context(Arc::new(ctx))
    }
}

// === Accessors ===

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Atom(_) => "str",
            Value::None => "None",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Address(_) => "address",
            Value::Pc(_) => "pc",
            Value::Label(_) => "label",
            Value::Context(_) => "context",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Value::Atom(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&[Value]> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<&[Value]> {
        match self {
            Value::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_pc(&self) -> Option<usize> {
        match self {
            Value::Pc(pc) => Some(*pc),
            _ => None,
        }
    }

    pub fn as_context(&self) -> Option<&Context> {
        match self {
            Value::Context(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Values of a dict whose keys are exactly 0..n, in key order.
    pub fn list_values(&self) -> Option<Vec<Value>> {
        let entries = self.as_dict()?;
        let mut out = Vec::with_capacity(entries.len());
        for (i, (k, v)) in entries.iter().enumerate() {
            if k.as_int() != Some(i as i64) {
                return None;
            }
            out.push(v.clone());
        }
        Some(out)
    }

    pub fn is_list(&self) -> bool {
        match self.as_dict() {
            Some(entries) => entries
                .iter()
                .enumerate()
                .all(|(i, (k, _))| k.as_int() == Some(i as i64)),
            None => false,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Atom(s) => !s.is_empty(),
            Value::None => false,
            Value::Set(s) => !s.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::Address(_) | Value::Pc(_) | Value::Label(_) | Value::Context(_) => true,
        }
    }

    /// True if a label placeholder occurs anywhere inside this value.
    pub fn has_label(&self) -> bool {
        match self {
            Value::Label(_) => true,
            Value::Set(s) | Value::Address(s) => s.iter().any(Value::has_label),
            Value::Dict(d) => d.iter().any(|(k, v)| k.has_label() || v.has_label()),
            _ => false,
        }
    }

    /// Replace every label placeholder using `resolve`.
    pub fn substitute<E>(
        &self,
        resolve: &mut impl FnMut(&str) -> Result<Value, E>,
    ) -> Result<Value, E> {
        if !self.has_label() {
            return Ok(self.clone());
        }
        match self {
            Value::Label(name) => resolve(name),
            Value::Set(s) => {
                let items = s
                    .iter()
                    .map(|v| v.substitute(resolve))
                    .collect::<Result<Vec<_>, E>>()?;
                Ok(Value::set_from_iter(items))
            }
            Value::Address(a) => {
                let keys = a
                    .iter()
                    .map(|v| v.substitute(resolve))
                    .collect::<Result<Vec<_>, E>>()?;
                Ok(Value::address(keys))
            }
            Value::Dict(d) => {
                let mut entries = Vec::with_capacity(d.len());
                for (k, v) in d.iter() {
                    entries.push((k.substitute(resolve)?, v.substitute(resolve)?));
                }
                Ok(Value::dict_from_iter(entries))
            }
            _ => Ok(self.clone()),
        }
    }
}

// === Sorted-vector helpers ===

impl Value {
    pub fn set_insert(set: &mut Vec<Value>, val: Value) -> bool {
        match set.binary_search(&val) {
            Ok(_) => false,
            Err(pos) => {
                set.insert(pos, val);
                true
            }
        }
    }

    pub fn set_contains(set: &[Value], val: &Value) -> bool {
        set.binary_search(val).is_ok()
    }

    pub fn dict_lookup<'a>(dict: &'a [(Value, Value)], key: &Value) -> Option<&'a Value> {
        dict.binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| &dict[idx].1)
    }

    pub fn dict_insert(dict: &mut Vec<(Value, Value)>, key: Value, value: Value) {
        match dict.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(idx) => dict[idx].1 = value,
            Err(pos) => dict.insert(pos, (key, value)),
        }
    }

    pub fn dict_remove(dict: &mut Vec<(Value, Value)>, key: &Value) -> Option<Value> {
        match dict.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(idx) => Some(dict.remove(idx).1),
            Err(_) => None,
        }
    }
}

// === Address paths ===

impl Value {
    /// Walk `path` through nested dicts.
    pub fn get_path(&self, path: &[Value]) -> Result<Value, AccessError> {
        let mut cur = self;
        for key in path {
            let Value::Dict(entries) = cur else {
                return Err(AccessError::NotADict(cur.clone()));
            };
            cur = Value::dict_lookup(entries, key).ok_or_else(|| AccessError::NoEntry {
                key: key.clone(),
                container: cur.clone(),
            })?;
        }
        Ok(cur.clone())
    }

    /// Return a copy of `self` with the location at `path` set to `value`.
    /// Missing intermediate dicts are created; an empty path replaces the root.
    pub fn set_path(&self, path: &[Value], value: Value) -> Result<Value, AccessError> {
        let Some((key, rest)) = path.split_first() else {
            return Ok(value);
        };
        let Value::Dict(entries) = self else {
            return Err(AccessError::NotADict(self.clone()));
        };
        let child = match Value::dict_lookup(entries, key) {
            Some(existing) => existing.set_path(rest, value)?,
            None => Value::empty_dict().set_path(rest, value)?,
        };
        let mut entries = Arc::clone(entries);
        Value::dict_insert(Arc::make_mut(&mut entries), key.clone(), child);
        Ok(Value::Dict(entries))
    }

    /// Return a copy of `self` with the entry at `path` removed. Removing a
    /// missing final key is a no-op.
    pub fn delete_path(&self, path: &[Value]) -> Result<Value, AccessError> {
        let Some((key, rest)) = path.split_first() else {
            return Err(AccessError::BadAddress);
        };
        let Value::Dict(entries) = self else {
            return Err(AccessError::NotADict(self.clone()));
        };
        let mut updated = Arc::clone(entries);
        if rest.is_empty() {
            if Value::dict_lookup(entries, key).is_some() {
                Value::dict_remove(Arc::make_mut(&mut updated), key);
            }
            return Ok(Value::Dict(updated));
        }
        let child = Value::dict_lookup(entries, key).ok_or_else(|| AccessError::NoEntry {
            key: key.clone(),
            container: self.clone(),
        })?;
        let child = child.delete_path(rest)?;
        Value::dict_insert(Arc::make_mut(&mut updated), key.clone(), child);
        Ok(Value::Dict(updated))
    }
}

// === PartialEq / Eq / Ord ===

impl Value {
    /// Type class for the cross-type order. Int and Float share a class and
    /// compare numerically.
    fn class(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Atom(_) => 2,
            Value::Pc(_) => 3,
            Value::Dict(_) => 4,
            Value::Set(_) => 5,
            Value::Address(_) => 6,
            Value::None => 7,
            Value::Context(_) => 8,
            Value::Label(_) => 9,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        // Fast path: both Int (the common case for keys and counters).
        if let (Value::Int(a), Value::Int(b)) = (self, other) {
            return a.cmp(b);
        }

        match self.class().cmp(&other.class()) {
            Ordering::Equal => {}
            other => return other,
        }

        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            // Equal magnitudes: Int sorts first so Int(1) != Float(1.0).
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
            (Value::Atom(a), Value::Atom(b)) => a.cmp(b),
            (Value::Pc(a), Value::Pc(b)) => a.cmp(b),
            (Value::Dict(a), Value::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    Ordering::Equal
                } else {
                    a.cmp(b)
                }
            }
            (Value::Set(a), Value::Set(b)) => {
                if Arc::ptr_eq(a, b) {
                    Ordering::Equal
                } else {
                    a.cmp(b)
                }
            }
            (Value::Address(a), Value::Address(b)) => a.cmp(b),
            (Value::None, Value::None) => Ordering::Equal,
            (Value::Context(a), Value::Context(b)) => {
                if Arc::ptr_eq(a, b) {
                    Ordering::Equal
                } else {
                    a.cmp(b)
                }
            }
            (Value::Label(a), Value::Label(b)) => a.cmp(b),
            _ => unreachable!("type classes should match"),
        }
    }
}

// === Hash ===

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Int(n) => n.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Atom(s) => s.hash(state),
            Value::None => {}
            Value::Set(s) => {
                s.len().hash(state);
                for v in s.iter() {
                    v.hash(state);
                }
            }
            Value::Dict(d) => {
                d.len().hash(state);
                for (k, v) in d.iter() {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Value::Address(a) => {
                a.len().hash(state);
                for v in a.iter() {
                    v.hash(state);
                }
            }
            Value::Pc(pc) => pc.hash(state),
            Value::Label(l) => l.hash(state),
            Value::Context(c) => c.hash(state),
        }
    }
}

// === Display ===

fn write_joined<'a, I>(f: &mut fmt::Formatter<'_>, items: I) -> fmt::Result
where
    I: IntoIterator<Item = &'a Value>,
{
    for (i, v) in items.into_iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", v)?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Atom(s) => write!(f, "\"{}\"", s),
            Value::None => write!(f, "None"),
            Value::Set(s) if s.is_empty() => write!(f, "{{}}"),
            Value::Set(s) => {
                write!(f, "{{ ")?;
                write_joined(f, s.iter())?;
                write!(f, " }}")
            }
            Value::Dict(d) if self.is_list() => {
                write!(f, "[")?;
                write_joined(f, d.iter().map(|(_, v)| v))?;
                write!(f, "]")
            }
            Value::Dict(d) => {
                write!(f, "{{ ")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, " }}")
            }
            Value::Address(a) => {
                write!(f, "?")?;
                for (i, k) in a.iter().enumerate() {
                    match (i, k) {
                        (0, Value::Atom(name)) => write!(f, "{}", name)?,
                        _ => write!(f, "[{}]", k)?,
                    }
                }
                Ok(())
            }
            Value::Pc(pc) => write!(f, "PC({})", pc),
            Value::Label(l) => write!(f, "LABEL({})", l),
            Value::Context(c) => write!(f, "CONTEXT({}, {})", c.name, c.entry),
        }
    }
}

// === Serde representation ===

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
enum ValueRepr {
    Bool(bool),
    Int(i64),
    Float(f64),
    Atom(String),
    None,
    Set(Vec<Value>),
    Dict(Vec<DictEntry>),
    Address(Vec<Value>),
    Pc(usize),
    Label(String),
    Context(Box<Context>),
}

#[derive(Serialize, Deserialize)]
struct DictEntry {
    key: Value,
    value: Value,
}

impl From<Value> for ValueRepr {
    fn from(v: Value) -> Self {
        match v {
            Value::Bool(b) => ValueRepr::Bool(b),
            Value::Int(n) => ValueRepr::Int(n),
            Value::Float(x) => ValueRepr::Float(x),
            Value::Atom(s) => ValueRepr::Atom(s.to_string()),
            Value::None => ValueRepr::None,
            Value::Set(s) => ValueRepr::Set(s.as_ref().clone()),
            Value::Dict(d) => ValueRepr::Dict(
                d.iter()
                    .map(|(key, value)| DictEntry {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            ),
            Value::Address(a) => ValueRepr::Address(a.as_ref().clone()),
            Value::Pc(pc) => ValueRepr::Pc(pc),
            Value::Label(l) => ValueRepr::Label(l.to_string()),
            Value::Context(c) => ValueRepr::Context(Box::new(c.as_ref().clone())),
        }
    }
}

impl From<ValueRepr> for Value {
    fn from(r: ValueRepr) -> Self {
        match r {
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Int(n) => Value::Int(n),
            ValueRepr::Float(x) => Value::Float(x),
            ValueRepr::Atom(s) => Value::Atom(Arc::from(s)),
            ValueRepr::None => Value::None,
            ValueRepr::Set(items) => Value::set_from_iter(items),
            ValueRepr::Dict(entries) => {
                Value::dict_from_iter(entries.into_iter().map(|e| (e.key, e.value)))
            }
            ValueRepr::Address(keys) => Value::address(keys),
            ValueRepr::Pc(pc) => Value::Pc(pc),
            ValueRepr::Label(l) => Value::Label(Arc::from(l)),
            ValueRepr::Context(c) => Value::Context(Arc::new(*c)),
        }
    }
}

// === Tests ===

//! Global machine state.
//!
//! The shared store is a single root dict. Every live thread is in exactly one
//! place: the runnable bag, the stopped bag of some address, the terminated
//! bag, or owned by the driver while it is being stepped.

use crate::bytecode::Op;
use crate::context::Context;
use crate::value::{AccessError, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Multiset of values with positive multiplicities.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bag {
    entries: BTreeMap<Value, usize>,
}

impl Bag {
    pub fn new() -> Self {
        Bag::default()
    }

    pub fn add(&mut self, v: Value) {
        *self.entries.entry(v).or_insert(0) += 1;
    }

    /// Remove one occurrence. Removing a non-member is a driver bug.
    pub fn remove(&mut self, v: &Value) {
        assert!(self.try_remove(v), "bag remove of non-member {}", v);
    }

    /// Remove one occurrence if present.
    pub fn try_remove(&mut self, v: &Value) -> bool {
        match self.entries.get_mut(v) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.entries.remove(v);
                true
            }
            None => false,
        }
    }

    pub fn count(&self, v: &Value) -> usize {
        self.entries.get(v).copied().unwrap_or(0)
    }

    /// Total multiplicity.
    pub fn len(&self) -> usize {
        self.entries.values().sum()
    }

    pub fn distinct(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, usize)> {
        self.entries.iter().map(|(v, n)| (v, *n))
    }

    /// The `n`th distinct member in value order.
    pub fn nth(&self, n: usize) -> Option<&Value> {
        self.entries.keys().nth(n)
    }

    pub fn first(&self) -> Option<&Value> {
        self.entries.keys().next()
    }

    /// As a dict from member to multiplicity.
    pub fn to_value(&self) -> Value {
        Value::dict_from_iter(
            self.entries
                .iter()
                .map(|(v, n)| (v.clone(), Value::Int(*n as i64))),
        )
    }
}

#[derive(Debug, Clone)]
pub struct GlobalState {
    pub code: Arc<[Op]>,
    /// Shared store, always a dict.
    pub vars: Value,
    pub ctxbag: Bag,
    /// Stopped contexts, keyed by the address they were saved at.
    pub stopbag: BTreeMap<Value, Bag>,
    pub termbag: Bag,
    /// Code addresses of registered invariants.
    pub invariants: BTreeSet<usize>,
    /// Addresses declared sequentially consistent.
    pub sequential: BTreeSet<Value>,
    /// Witnessed `Possibly` indices.
    pub possibly: BTreeSet<usize>,
    /// Print log. Not part of state identity.
    pub prints: Vec<Value>,
}

impl PartialEq for GlobalState {
    fn eq(&self, other: &Self) -> bool {
        self.vars == other.vars
            && self.ctxbag == other.ctxbag
            && self.stopbag == other.stopbag
            && self.termbag == other.termbag
    }
}

impl Eq for GlobalState {}

impl GlobalState {
    pub fn new(code: Arc<[Op]>) -> Self {
        GlobalState {
            code,
            vars: Value::empty_dict(),
            ctxbag: Bag::new(),
            stopbag: BTreeMap::new(),
            termbag: Bag::new(),
            invariants: BTreeSet::new(),
            sequential: BTreeSet::new(),
            possibly: BTreeSet::new(),
            prints: Vec::new(),
        }
    }

    /// A state whose only thread is the initial one at pc 0.
    pub fn boot(code: Arc<[Op]>) -> Self {
        let mut state = GlobalState::new(code);
        state.ctxbag.add(Context::initial().to_value());
        state
    }

    pub fn get(&self, path: &[Value]) -> Result<Value, AccessError> {
        self.vars.get_path(path)
    }

    pub fn set(&mut self, path: &[Value], v: Value) -> Result<(), AccessError> {
        self.vars = self.vars.set_path(path, v)?;
        Ok(())
    }

    pub fn delete(&mut self, path: &[Value]) -> Result<(), AccessError> {
        self.vars = self.vars.delete_path(path)?;
        Ok(())
    }

    pub fn has_var(&self, name: &Value) -> bool {
        self.vars
            .as_dict()
            .is_some_and(|d| Value::dict_lookup(d, name).is_some())
    }

    /// Save a stopped context at `address` and file it under that address.
    pub fn stop(&mut self, address: &[Value], ctx: &Context) -> Result<(), AccessError> {
        let snapshot = ctx.to_value();
        self.set(address, snapshot.clone())?;
        self.stopbag
            .entry(Value::address(address.iter().cloned()))
            .or_default()
            .add(snapshot);
        Ok(())
    }

    /// Drop one stopped occurrence of `ctx`, wherever it is filed.
    pub fn remove_stopped(&mut self, ctx: &Value) -> bool {
        let Some(address) = self
            .stopbag
            .iter()
            .find(|(_, bag)| bag.count(ctx) > 0)
            .map(|(a, _)| a.clone())
        else {
            return false;
        };
        if let Some(bag) = self.stopbag.get_mut(&address) {
            bag.remove(ctx);
            if bag.is_empty() {
                self.stopbag.remove(&address);
            }
        }
        true
    }

    /// Resume a stopped context: it becomes runnable with `value` on top of
    /// its stack.
    pub fn go(&mut self, ctx: &Context, value: Value) {
        let key = ctx.to_value();
        self.remove_stopped(&key);
        let mut resumed = ctx.clone();
        resumed.stopped = false;
        resumed.push(value);
        self.ctxbag.add(resumed.to_value());
    }

    pub fn stopped_len(&self) -> usize {
        self.stopbag.values().map(Bag::len).sum()
    }

    pub fn stopped_contexts(&self) -> impl Iterator<Item = (&Value, usize)> {
        self.stopbag.values().flat_map(Bag::iter)
    }

    /// Every known context with its multiplicity, runnable, stopped and
    /// terminated alike.
    pub fn all_contexts(&self) -> Value {
        let mut all = Bag::new();
        let bags = std::iter::once(&self.ctxbag)
            .chain(self.stopbag.values())
            .chain(std::iter::once(&self.termbag));
        for bag in bags {
            for (ctx, n) in bag.iter() {
                for _ in 0..n {
                    all.add(ctx.clone());
                }
            }
        }
        all.to_value()
    }

    pub fn take_prints(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.prints)
    }
}

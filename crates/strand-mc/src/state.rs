//! State fingerprinting.
//!
//! A fingerprint identifies a global state by the shared store and the three
//! context bags. The print log, registered invariants and other bookkeeping
//! are not part of state identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use strand_eval::{Bag, GlobalState, Value};

/// A fingerprint is a 64-bit hash identifying a state.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn hash_var(name: &Value, val: &Value) -> u64 {
    let mut hasher = ahash::AHasher::default();
    name.hash(&mut hasher);
    val.hash(&mut hasher);
    hasher.finish()
}

fn hash_bag(tag: u8, bag: &Bag) -> u64 {
    let mut hasher = ahash::AHasher::default();
    tag.hash(&mut hasher);
    bag.hash(&mut hasher);
    hasher.finish()
}

/// Fingerprint of a global state: XOR of the per-variable hashes of the
/// shared store, mixed with the hashes of the context bags.
pub fn fingerprint(state: &GlobalState) -> Fingerprint {
    let mut h: u64 = 0;
    if let Some(entries) = state.vars.as_dict() {
        for (name, val) in entries {
            h ^= hash_var(name, val);
        }
    }
    h ^= hash_bag(1, &state.ctxbag);
    h ^= hash_bag(2, &state.termbag);
    let mut hasher = ahash::AHasher::default();
    3u8.hash(&mut hasher);
    state.stopbag.hash(&mut hasher);
    h ^= hasher.finish();
    Fingerprint(h)
}

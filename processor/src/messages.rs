use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use murmur_core::{Op, Value};

// SPEC
// ================================================================================================

/// The value registered for a `(message, type)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Spec {
    /// A compiled block to call.
    Block(Value),
    /// A foreign handler to call.
    Native(Value),
    /// A bare opcode tag; the send site rewrites itself to this opcode.
    Primitive(Op),
    /// A record key; the send becomes a field read.
    Property(Value),
    /// A constant; the send pushes it.
    Constant(Value),
}

impl Spec {
    /// The single value stored in a cache-slot spec cell.
    pub fn cache_value(&self) -> Value {
        match self {
            Spec::Block(v) | Spec::Native(v) | Spec::Property(v) | Spec::Constant(v) => *v,
            Spec::Primitive(op) => Value::primitive(*op as u8),
        }
    }
}

// MESSAGE TABLE
// ================================================================================================

/// The process-wide map from `(message, receiver type)` to specialization.
///
/// Writers hold the table mutex and bump the generation with release ordering before the lock
/// drops; sends read the generation with acquire ordering and treat any cached slot whose
/// snapshot differs as invalid. The counter is monotonic; each write bumps it by exactly one.
#[derive(Debug, Default)]
pub struct MessageTable {
    map: Mutex<HashMap<(u64, u64), Spec>>,
    generation: AtomicU64,
}

impl MessageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current specs generation.
    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Registers `spec` for `(message, type_key)`, invalidating every cached send site.
    pub fn define(&self, message: Value, type_key: Value, spec: Spec) {
        let mut map = self.map.lock().expect("message table poisoned");
        map.insert((message.bits(), type_key.bits()), spec);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Looks up the specialization for an exact type key.
    pub fn lookup(&self, message: Value, type_key: Value) -> Option<Spec> {
        let map = self.map.lock().expect("message table poisoned");
        map.get(&(message.bits(), type_key.bits())).cloned()
    }

    /// Snapshot of every `(type, spec)` pair registered for a message.
    pub fn specs_of(&self, message: Value) -> Vec<(Value, Spec)> {
        let map = self.map.lock().expect("message table poisoned");
        map.iter()
            .filter(|((m, _), _)| *m == message.bits())
            .map(|((_, t), spec)| (Value::from_bits(*t), spec.clone()))
            .collect()
    }
}

// TESTS
// ================================================================================================

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use murmur_core::well_known;

// INTERNER
// ================================================================================================

/// The global sigil/string interner.
///
/// Sigils and strings share one id space; the value tag tells them apart. Ids are dense and
/// stable for the life of the engine, which is what makes bitwise value equality structural for
/// interned kinds.
///
/// Writers take the mutex; readers resolve names through the same lock. The dispatch loop never
/// resolves names on the hot path (it compares ids), so the lock is uncontended in practice.
#[derive(Debug)]
pub struct Interner {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    ids: HashMap<Arc<str>, u32>,
    names: Vec<Arc<str>>,
}

impl Interner {
    /// Creates an interner seeded with the well-known sigil spellings at their canonical ids.
    pub fn new() -> Self {
        let interner = Self { inner: Mutex::new(Inner::default()) };
        for (id, name) in well_known::NAMES.iter().enumerate() {
            let seeded = interner.intern(name);
            debug_assert_eq!(seeded, id as u32);
        }
        interner
    }

    /// Interns a spelling, returning its id.
    pub fn intern(&self, name: &str) -> u32 {
        let mut inner = self.inner.lock().expect("interner poisoned");
        if let Some(&id) = inner.ids.get(name) {
            return id;
        }
        let id = inner.names.len() as u32;
        let name: Arc<str> = name.into();
        inner.names.push(name.clone());
        inner.ids.insert(name, id);
        id
    }

    /// Resolves an id back to its spelling.
    pub fn name(&self, id: u32) -> Arc<str> {
        let inner = self.inner.lock().expect("interner poisoned");
        inner.names[id as usize].clone()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

// TESTS
// ================================================================================================

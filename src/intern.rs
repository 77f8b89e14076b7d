use std::sync::{Arc, RwLock};

use hashbrown::HashMap;
use once_cell::sync::Lazy;

/// Process wide table of function and callee names. Symbols are leaked so
/// that a [`InternedSymbol`] can hand out `&'static str` without holding the
/// lock.
#[derive(Debug, Default)]
pub struct InterningTable {
    inner: RwLock<TableInner>,
}

#[derive(Debug, Default)]
struct TableInner {
    strings: Vec<&'static str>,
    lookup: HashMap<&'static str, u32>,
}

pub static INTERNING_TABLE: Lazy<Arc<InterningTable>> = Lazy::new(Default::default);

impl InterningTable {
    pub fn get(&self, index: u32) -> Option<&'static str> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        inner.strings.get(index as usize).copied()
    }

    pub fn insert_if_absent(&self, string: &str) -> u32 {
        if let Some(index) = self.index_of(string) {
            return index;
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        // another writer may have raced us between the read and write locks
        if let Some(index) = inner.lookup.get(string) {
            return *index;
        }

        let leaked: &'static str = Box::leak(string.to_owned().into_boxed_str());
        let index = inner.strings.len() as u32;
        inner.strings.push(leaked);
        inner.lookup.insert(leaked, index);
        index
    }

    pub fn index_of(&self, string: &str) -> Option<u32> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        inner.lookup.get(string).copied()
    }
}

/// An index into the string interning table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternedSymbol(u32);

impl InternedSymbol {
    pub fn new(value: &str) -> Self {
        Self(INTERNING_TABLE.insert_if_absent(value))
    }

    pub fn value(&self) -> &'static str {
        // Symbols are only constructed through `new`, which inserts first
        INTERNING_TABLE.get(self.0).unwrap_or_default()
    }
}

impl core::fmt::Debug for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InternedSymbol")
            .field(&self.0)
            .field(&self.value())
            .finish()
    }
}

impl core::fmt::Display for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

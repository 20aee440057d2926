//! Namespaced string-to-integer id allocation.
//!
//! Several parts of the pipeline need a stable, small integer for an opaque
//! string key: security-group sets are matched in registers by integer id,
//! and per-rule cookies are derived the same way. Ids are allocated on first
//! use, reused from a free list after release, and garbage collected against
//! a caller-supplied liveness predicate.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Error type for id allocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("unknown id namespace: {0}")]
    UnknownNamespace(String),

    #[error("id space exhausted in namespace {0}")]
    Exhausted(String),
}

#[derive(Debug, Default)]
struct Namespace {
    ids: HashMap<String, u32>,
    free: BTreeSet<u32>,
    next: u32,
}

impl Namespace {
    fn new() -> Self {
        Namespace {
            ids: HashMap::new(),
            free: BTreeSet::new(),
            next: 1,
        }
    }

    fn allocate(&mut self, key: &str) -> Option<u32> {
        if let Some(&id) = self.ids.get(key) {
            return Some(id);
        }
        let id = if let Some(&id) = self.free.iter().next() {
            self.free.remove(&id);
            id
        } else {
            if self.next == u32::MAX {
                return None;
            }
            let id = self.next;
            self.next += 1;
            id
        };
        self.ids.insert(key.to_string(), id);
        Some(id)
    }

    fn release(&mut self, key: &str) -> Option<u32> {
        let id = self.ids.remove(key)?;
        self.free.insert(id);
        Some(id)
    }
}

/// Thread-safe allocator of stable integer ids per namespace.
///
/// A namespace must be initialized with [`IdAllocator::init_namespace`]
/// before ids can be allocated in it; asking for an id in an unknown
/// namespace is an error rather than an implicit creation.
#[derive(Debug, Default)]
pub struct IdAllocator {
    namespaces: Mutex<HashMap<String, Namespace>>,
}

impl IdAllocator {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        IdAllocator {
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Initializes a namespace. Idempotent; existing ids are preserved.
    pub fn init_namespace(&self, ns: &str) {
        let mut namespaces = self.namespaces.lock().unwrap();
        namespaces.entry(ns.to_string()).or_insert_with(Namespace::new);
    }

    /// Returns the id for `key` in `ns`, allocating one on first use.
    pub fn get_id(&self, ns: &str, key: &str) -> Result<u32, IdError> {
        let mut namespaces = self.namespaces.lock().unwrap();
        let namespace = namespaces
            .get_mut(ns)
            .ok_or_else(|| IdError::UnknownNamespace(ns.to_string()))?;
        namespace
            .allocate(key)
            .ok_or_else(|| IdError::Exhausted(ns.to_string()))
    }

    /// Returns the id for `key` if one is currently allocated.
    pub fn lookup(&self, ns: &str, key: &str) -> Option<u32> {
        let namespaces = self.namespaces.lock().unwrap();
        namespaces.get(ns)?.ids.get(key).copied()
    }

    /// Releases the id for `key`, returning it to the free list.
    pub fn erase(&self, ns: &str, key: &str) {
        let mut namespaces = self.namespaces.lock().unwrap();
        if let Some(namespace) = namespaces.get_mut(ns) {
            if let Some(id) = namespace.release(key) {
                debug!(ns, key, id, "released id");
            }
        }
    }

    /// Returns the number of live ids in a namespace.
    pub fn size(&self, ns: &str) -> usize {
        let namespaces = self.namespaces.lock().unwrap();
        namespaces.get(ns).map(|n| n.ids.len()).unwrap_or(0)
    }

    /// Garbage collects a namespace.
    ///
    /// Every key for which `alive` returns false is released. The predicate
    /// is evaluated outside any notion of ordering; keys surviving one
    /// collection keep their ids.
    pub fn collect_garbage<F>(&self, ns: &str, alive: F)
    where
        F: Fn(&str) -> bool,
    {
        let mut namespaces = self.namespaces.lock().unwrap();
        let Some(namespace) = namespaces.get_mut(ns) else {
            return;
        };
        let dead: Vec<String> = namespace
            .ids
            .keys()
            .filter(|key| !alive(key))
            .cloned()
            .collect();
        for key in dead {
            if let Some(id) = namespace.release(&key) {
                debug!(ns, key = key.as_str(), id, "collected stale id");
            }
        }
    }
}

// Job Counters
// Named counters incrementable from inside graph operations

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Handle to a named counter
///
/// Clones share the same value, so a counter can be moved into transform
/// closures running on worker threads.
#[derive(Debug, Clone)]
pub struct Counter {
    name: Arc<str>,
    value: Arc<AtomicI64>,
}

impl Counter {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            value: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, amount: i64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters registered on an execution context, in registration order
#[derive(Debug, Clone, Default)]
pub struct CounterSet {
    counters: Arc<RwLock<Vec<Counter>>>,
}

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter, returning the existing one if the name is taken
    pub fn register(&self, name: &str) -> Counter {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut counters = self.counters.write();
        // Re-check under the write lock
        if let Some(existing) = counters.iter().find(|c| c.name() == name) {
            return existing.clone();
        }
        let counter = Counter::new(name);
        counters.push(counter.clone());
        counter
    }

    pub fn get(&self, name: &str) -> Option<Counter> {
        self.counters.read().iter().find(|c| c.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.counters.read().iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of every counter, keyed by name
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters
            .read()
            .iter()
            .map(|c| (c.name().to_string(), c.get()))
            .collect()
    }
}

//! Bounded cache of recent portal searches.
//!
//! Explicitly constructed and injected into the aggregator; never
//! process-wide state. Least-recently-used entry is evicted at capacity.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::PortalAnalysis;

pub struct SearchCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    entries: HashMap<String, PortalAnalysis>,
    /// Recency order, oldest first. Bounded by `capacity`, so the linear
    /// scans stay cheap.
    order: Vec<String>,
}

impl SearchCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<PortalAnalysis> {
        let mut inner = self.inner.lock().ok()?;
        let hit = inner.entries.get(key).cloned();
        if hit.is_some() {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                let k = inner.order.remove(pos);
                inner.order.push(k);
            }
        }
        hit
    }

    pub fn insert(&self, key: &str, analysis: PortalAnalysis) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
        } else if inner.entries.len() >= self.capacity {
            let evicted = inner.order.remove(0);
            inner.entries.remove(&evicted);
        }
        inner.entries.insert(key.to_string(), analysis);
        inner.order.push(key.to_string());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Minimal counter/gauge storage with a serializable snapshot, enough to
//! carry cumulative metrics across a hot restart.

use std::{collections::HashMap, sync::Mutex};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
struct StatsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, u64>,
}

/// Process-wide stats store. Shared with the hot-restart parent role, which
/// snapshots it from its serving thread.
#[derive(Debug, Default)]
pub struct StatsStore {
    inner: Mutex<StatsInner>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_counter(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        *inner.counters.entry(name.to_string()).or_default() += delta;
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.gauges.insert(name.to_string(), value);
    }

    pub fn add_gauge(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        *inner.gauges.entry(name.to_string()).or_default() += delta;
    }

    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().expect("stats lock poisoned");
        inner.counters.get(name).copied().unwrap_or_default()
    }

    pub fn gauge(&self, name: &str) -> u64 {
        let inner = self.inner.lock().expect("stats lock poisoned");
        inner.gauges.get(name).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().expect("stats lock poisoned");
        StatsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            memory_allocated: 0,
            num_connections: inner.gauges.get("server.connections").copied().unwrap_or(0),
        }
    }

    /// Fold a previous generation's snapshot into this store so cumulative
    /// metrics survive the restart. Counters and gauges both accumulate.
    pub fn merge(&self, parent: &StatsSnapshot) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        for (name, value) in &parent.counters {
            *inner.counters.entry(name.clone()).or_default() += value;
        }
        for (name, value) in &parent.gauges {
            *inner.gauges.entry(name.clone()).or_default() += value;
        }
    }
}

/// Wire-serializable view of the store, exchanged over the hot-restart
/// control channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
    pub memory_allocated: u64,
    pub num_connections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_counters_and_gauges() {
        let store = StatsStore::new();
        store.inc_counter("listener.accepts", 5);
        store.set_gauge("server.connections", 2);

        let mut parent = StatsSnapshot::default();
        parent.counters.insert("listener.accepts".to_string(), 7);
        parent.counters.insert("listener.drains".to_string(), 1);
        parent.gauges.insert("server.connections".to_string(), 3);

        store.merge(&parent);
        assert_eq!(store.counter("listener.accepts"), 12);
        assert_eq!(store.counter("listener.drains"), 1);
        assert_eq!(store.gauge("server.connections"), 5);
    }

    #[test]
    fn snapshot_reports_connection_count() {
        let store = StatsStore::new();
        store.set_gauge("server.connections", 42);
        assert_eq!(store.snapshot().num_connections, 42);
    }
}

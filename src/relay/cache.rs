//! Bounded LRU cache of relay connections
//!
//! Keys are `(address family, client endpoint)`. Every lookup promotes
//! the entry to most-recently-used; inserting past capacity evicts the
//! least-recently-used entry and hands it back so the caller can tear
//! it down.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    /// Upstream family not determined yet (unresolved domain target)
    Unspec,
    V4,
    V6,
}

impl From<SocketAddr> for Family {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub family: Family,
    pub client: SocketAddr,
}

pub struct ConnCache<V> {
    capacity: usize,
    /// monotonic access stamp; larger = more recent
    seq: u64,
    entries: HashMap<ConnKey, (u64, V)>,
    order: BTreeMap<u64, ConnKey>,
}

impl<V> ConnCache<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self { capacity, seq: 0, entries: HashMap::new(), order: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ConnKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up and promote to most-recently-used.
    pub fn get(&mut self, key: &ConnKey) -> Option<&V> {
        self.promote(key);
        self.entries.get(key).map(|(_, v)| v)
    }

    /// Insert as most-recently-used. Returns the evicted LRU entry when
    /// the insert pushed the cache over capacity.
    pub fn insert(&mut self, key: ConnKey, value: V) -> Option<(ConnKey, V)> {
        if let Some((old_seq, _)) = self.entries.remove(&key) {
            self.order.remove(&old_seq);
        }

        self.seq += 1;
        self.entries.insert(key, (self.seq, value));
        self.order.insert(self.seq, key);

        if self.entries.len() > self.capacity {
            let (_, oldest) = self.order.pop_first()?;
            let (_, value) = self.entries.remove(&oldest)?;
            return Some((oldest, value));
        }
        None
    }

    pub fn remove(&mut self, key: &ConnKey) -> Option<V> {
        let (seq, value) = self.entries.remove(key)?;
        self.order.remove(&seq);
        Some(value)
    }

    /// Remove and return everything, for teardown.
    pub fn drain(&mut self) -> Vec<V> {
        self.order.clear();
        self.entries.drain().map(|(_, (_, v))| v).collect()
    }

    fn promote(&mut self, key: &ConnKey) {
        if let Some((seq, _)) = self.entries.get(key) {
            let old_seq = *seq;
            self.seq += 1;
            self.order.remove(&old_seq);
            self.order.insert(self.seq, *key);
            if let Some((seq_slot, _)) = self.entries.get_mut(key) {
                *seq_slot = self.seq;
            }
        }
    }
}

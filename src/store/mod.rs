//! # Replicated Store Adapter
//!
//! The benchmark never talks to a concrete replicated store directly. It
//! consumes the narrow contracts defined here:
//!
//! - [`ReplicatedMap`]: `put` / `get` plus change-listener registration
//! - [`ReplicatedSet`]: `add` / `remove` / `snapshot` plus listener registration
//! - [`ChangeListener`]: callback invoked by the store after a change lands
//!
//! Stores are handed to the benchmark by a [`StoreProvider`] passed in
//! through constructors. The crate ships an in-memory implementation
//! ([`memory::InMemoryStoreHub`]) that applies every operation on a dedicated
//! dispatcher thread after a configurable propagation delay and then invokes
//! listeners from that thread, like a real replication layer would.
//!
//! [`probe`] adapts each supported data structure to a common
//! publish/observe interface used by the workload nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod probe;

pub use memory::{InMemoryMap, InMemorySet, InMemoryStoreHub};
pub use probe::{open_probe, ProbeChannel, ProbeSample};

/// Handle returned when registering a listener, used to remove it again
pub type ListenerId = u64;

/// Errors reported by store adapters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store {0} is closed")]
    Closed(String),

    #[error("store {name} is unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("malformed value in {name}: {reason}")]
    Malformed { name: String, reason: String },
}

/// Callback invoked by a store after a change has been applied
///
/// Implementations are called from the store's own thread and must not block.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self);
}

/// Key-value view of a replicated structure
pub trait ReplicatedMap<K, V>: Send + Sync {
    /// Store `value` under `key`. The change may become visible later.
    fn put(&self, key: K, value: V) -> Result<(), StoreError>;

    /// Current value under `key`, if any.
    fn get(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// Number of applied entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId;

    /// Returns `false` if `id` was not registered.
    fn remove_change_listener(&self, id: ListenerId) -> bool;

    /// Block until every previously issued write has been applied locally.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Set view of a replicated structure
pub trait ReplicatedSet<T>: Send + Sync {
    fn add(&self, item: T) -> Result<(), StoreError>;

    fn remove(&self, item: T) -> Result<(), StoreError>;

    /// Copy of the applied members.
    fn snapshot(&self) -> Result<Vec<T>, StoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId;

    fn remove_change_listener(&self, id: ListenerId) -> bool;

    /// Block until every previously issued change has been applied locally.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Source of named replicated structures
pub trait StoreProvider: Send + Sync {
    fn arp_table(&self, name: &str) -> Result<Arc<dyn ReplicatedMap<Ipv4Addr, ArpEntry>>, StoreError>;

    fn mac_table(&self, name: &str) -> Result<Arc<dyn ReplicatedMap<MacAddr, Uuid>>, StoreError>;

    fn routing_table(&self, name: &str) -> Result<Arc<dyn ReplicatedSet<Route>>, StoreError>;

    /// ARP entries carried by a message-bus backed merged map.
    fn merged_map(&self, name: &str)
        -> Result<Arc<dyn ReplicatedMap<Ipv4Addr, ArpEntry>>, StoreError>;
}

/// 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddr(u64);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr(0);

    /// Keep the low 48 bits of `raw`.
    pub fn new(raw: u64) -> Self {
        Self(raw & 0xFFFF_FFFF_FFFF)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// ARP table entry
///
/// Besides the resolved address the entry carries three timestamps-or-counters
/// that the probe channel reuses to embed a version and a write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub mac: MacAddr,
    pub expiry: u64,
    pub stale: u64,
    pub last_arp: u64,
}

/// Routing table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub metric: u64,
    pub installed_at_ns: u64,
}

impl Route {
    /// Whether this is a default route (`0.0.0.0/0`).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0 && self.destination.is_unspecified()
    }
}

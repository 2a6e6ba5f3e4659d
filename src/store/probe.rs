//! Probe channels.
//!
//! A probe channel reduces a replicated structure to what the latency
//! experiment needs: bulk population, publishing a versioned timestamp, and
//! observing the latest published one. The writer embeds its send time in
//! the value itself, so readers can compute propagation latency without a
//! side channel.
//!
//! | Storage type | Probe key | Version | Write time |
//! |--------------|-----------|---------|------------|
//! | ARP table / ARP merged map | `0.0.0.0` | `expiry` | `stale` |
//! | MAC table | `00:00:00:00:00:00` | UUID low half | UUID high half |
//! | Routing table | default routes | `metric` | `installed_at_ns` |

use super::{ArpEntry, ChangeListener, ListenerId, MacAddr, ReplicatedMap, ReplicatedSet, Route};
use super::{StoreError, StoreProvider};
use crate::cli::StorageType;
use parking_lot::Mutex;
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

/// A versioned write time carried through the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub version: u64,
    pub written_at_ns: u64,
}

/// Publish/observe view over one replicated structure
pub trait ProbeChannel: Send + Sync {
    fn storage_type(&self) -> StorageType;

    /// Name of the underlying structure.
    fn name(&self) -> &str;

    /// Insert one background entry per nonzero key and wait until they are
    /// applied. Key 0 is reserved for the probe. Returns the number of
    /// entries written.
    fn populate(&self, keys: &[i64]) -> Result<usize, StoreError>;

    /// Background churn ahead of the warmup writes: alternately add and
    /// withdraw a non-probe entry, so the structure ends at its populated
    /// size. An odd `operations` drops the last addition. Returns the number
    /// of operations applied; structures without a churn workload apply none.
    fn churn(&self, _operations: usize) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Publish `sample`, replacing the previously published one.
    fn publish(&self, sample: ProbeSample) -> Result<(), StoreError>;

    /// Latest published sample, if any.
    fn observe(&self) -> Result<Option<ProbeSample>, StoreError>;

    fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;

    /// Number of entries currently held, probe entries included.
    fn entry_count(&self) -> usize;
}

/// Open the probe channel for `storage` on the structure called `name`.
pub fn open_probe(
    provider: &dyn StoreProvider,
    storage: StorageType,
    name: &str,
) -> Result<Arc<dyn ProbeChannel>, StoreError> {
    let probe: Arc<dyn ProbeChannel> = match storage {
        StorageType::ArpTable => Arc::new(ArpProbe {
            name: name.to_string(),
            storage,
            map: provider.arp_table(name)?,
        }),
        StorageType::ArpMergedMap => Arc::new(ArpProbe {
            name: name.to_string(),
            storage,
            map: provider.merged_map(name)?,
        }),
        StorageType::MacTable => Arc::new(MacProbe {
            name: name.to_string(),
            map: provider.mac_table(name)?,
        }),
        StorageType::RoutingTable => Arc::new(RouteProbe {
            name: name.to_string(),
            set: provider.routing_table(name)?,
            background: Mutex::new(Vec::new()),
        }),
    };
    Ok(probe)
}

fn key_as_ipv4(key: i64) -> Ipv4Addr {
    Ipv4Addr::from(key as u32)
}

struct ArpProbe {
    name: String,
    storage: StorageType,
    map: Arc<dyn ReplicatedMap<Ipv4Addr, ArpEntry>>,
}

impl ProbeChannel for ArpProbe {
    fn storage_type(&self) -> StorageType {
        self.storage
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn populate(&self, keys: &[i64]) -> Result<usize, StoreError> {
        let mut rng = rand::thread_rng();
        let mut written = 0;
        for &key in keys.iter().filter(|&&key| key != 0) {
            let entry = ArpEntry {
                mac: MacAddr::new(rng.gen()),
                expiry: 0,
                stale: 0,
                last_arp: 0,
            };
            self.map.put(key_as_ipv4(key), entry)?;
            written += 1;
        }
        self.map.flush()?;
        Ok(written)
    }

    fn publish(&self, sample: ProbeSample) -> Result<(), StoreError> {
        let entry = ArpEntry {
            mac: MacAddr::new(sample.version),
            expiry: sample.version,
            stale: sample.written_at_ns,
            last_arp: sample.written_at_ns,
        };
        self.map.put(Ipv4Addr::UNSPECIFIED, entry)
    }

    fn observe(&self) -> Result<Option<ProbeSample>, StoreError> {
        Ok(self
            .map
            .get(&Ipv4Addr::UNSPECIFIED)?
            .map(|entry| ProbeSample {
                version: entry.expiry,
                written_at_ns: entry.stale,
            }))
    }

    fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.map.add_change_listener(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.map.remove_change_listener(id)
    }

    fn entry_count(&self) -> usize {
        self.map.len()
    }
}

struct MacProbe {
    name: String,
    map: Arc<dyn ReplicatedMap<MacAddr, Uuid>>,
}

impl ProbeChannel for MacProbe {
    fn storage_type(&self) -> StorageType {
        StorageType::MacTable
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn populate(&self, keys: &[i64]) -> Result<usize, StoreError> {
        let mut written = 0;
        for &key in keys.iter().filter(|&&key| key != 0) {
            self.map.put(MacAddr::new(key as u64), Uuid::new_v4())?;
            written += 1;
        }
        self.map.flush()?;
        Ok(written)
    }

    fn publish(&self, sample: ProbeSample) -> Result<(), StoreError> {
        let port = Uuid::from_u64_pair(sample.written_at_ns, sample.version);
        self.map.put(MacAddr::ZERO, port)
    }

    fn observe(&self) -> Result<Option<ProbeSample>, StoreError> {
        Ok(self.map.get(&MacAddr::ZERO)?.map(|port| {
            let (written_at_ns, version) = port.as_u64_pair();
            ProbeSample {
                version,
                written_at_ns,
            }
        }))
    }

    fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.map.add_change_listener(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.map.remove_change_listener(id)
    }

    fn entry_count(&self) -> usize {
        self.map.len()
    }
}

/// Probe routes are default routes; the newest one has the highest metric.
/// Published routes are never withdrawn, so the set grows by one per write.
struct RouteProbe {
    name: String,
    set: Arc<dyn ReplicatedSet<Route>>,
    /// Non-probe routes added through this channel, candidates for removal
    background: Mutex<Vec<Route>>,
}

fn background_route(destination: Ipv4Addr, rng: &mut impl Rng) -> Route {
    Route {
        destination,
        prefix_len: 32,
        gateway: Ipv4Addr::from(rng.gen::<u32>()),
        metric: 0,
        installed_at_ns: 0,
    }
}

impl ProbeChannel for RouteProbe {
    fn storage_type(&self) -> StorageType {
        StorageType::RoutingTable
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn populate(&self, keys: &[i64]) -> Result<usize, StoreError> {
        let mut rng = rand::thread_rng();
        let mut background = self.background.lock();
        let mut written = 0;
        for &key in keys.iter().filter(|&&key| key != 0) {
            let route = background_route(key_as_ipv4(key), &mut rng);
            self.set.add(route)?;
            background.push(route);
            written += 1;
        }
        self.set.flush()?;
        Ok(written)
    }

    fn churn(&self, operations: usize) -> Result<usize, StoreError> {
        let mut rng = rand::thread_rng();
        let mut background = self.background.lock();
        let operations = operations - operations % 2;
        for op in 0..operations {
            if op % 2 == 0 {
                let destination = Ipv4Addr::from(rng.gen_range(1..=u32::MAX));
                let route = background_route(destination, &mut rng);
                self.set.add(route)?;
                background.push(route);
            } else {
                let index = rng.gen_range(0..background.len());
                self.set.remove(background.swap_remove(index))?;
            }
        }
        self.set.flush()?;
        Ok(operations)
    }

    fn publish(&self, sample: ProbeSample) -> Result<(), StoreError> {
        self.set.add(Route {
            destination: Ipv4Addr::UNSPECIFIED,
            prefix_len: 0,
            gateway: Ipv4Addr::LOCALHOST,
            metric: sample.version,
            installed_at_ns: sample.written_at_ns,
        })
    }

    fn observe(&self) -> Result<Option<ProbeSample>, StoreError> {
        Ok(self
            .set
            .snapshot()?
            .into_iter()
            .filter(Route::is_default)
            .max_by_key(|route| route.metric)
            .map(|route| ProbeSample {
                version: route.metric,
                written_at_ns: route.installed_at_ns,
            }))
    }

    fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.set.add_change_listener(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.set.remove_change_listener(id)
    }

    fn entry_count(&self) -> usize {
        self.set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStoreHub;
    use std::time::Duration;

    const ALL_TYPES: [StorageType; 4] = [
        StorageType::ArpTable,
        StorageType::ArpMergedMap,
        StorageType::MacTable,
        StorageType::RoutingTable,
    ];

    /// Every storage type carries version and write time through the store
    #[test]
    fn test_publish_then_observe_latest() {
        let hub = InMemoryStoreHub::new(Duration::ZERO);
        for storage in ALL_TYPES {
            let probe = open_probe(&hub, storage, "probe").unwrap();
            assert_eq!(probe.observe().unwrap(), None, "{}", storage);

            assert_eq!(probe.populate(&[11, 12, 0, 13]).unwrap(), 3);
            for version in 1..=3 {
                probe
                    .publish(ProbeSample {
                        version,
                        written_at_ns: 1_000 + version,
                    })
                    .unwrap();
            }
            // Populated entries are applied synchronously; wait for the probes.
            probe.populate(&[]).unwrap();

            assert_eq!(
                probe.observe().unwrap(),
                Some(ProbeSample {
                    version: 3,
                    written_at_ns: 1_003
                }),
                "{}",
                storage
            );
            assert!(probe.entry_count() >= 4);
        }
    }

    /// Route churn withdraws as many routes as it adds
    #[test]
    fn test_route_churn_keeps_set_size() {
        let hub = InMemoryStoreHub::new(Duration::ZERO);
        let routes = open_probe(&hub, StorageType::RoutingTable, "churn").unwrap();
        assert_eq!(routes.populate(&[21, 22, 23]).unwrap(), 3);

        assert_eq!(routes.churn(7).unwrap(), 6);
        assert_eq!(routes.entry_count(), 3);
        assert_eq!(routes.observe().unwrap(), None);

        let arp = open_probe(&hub, StorageType::ArpTable, "churn").unwrap();
        assert_eq!(arp.churn(4).unwrap(), 0);
    }

    #[test]
    fn test_merged_map_and_arp_table_are_distinct() {
        let hub = InMemoryStoreHub::new(Duration::ZERO);
        let arp = open_probe(&hub, StorageType::ArpTable, "same").unwrap();
        let merged = open_probe(&hub, StorageType::ArpMergedMap, "same").unwrap();
        arp.publish(ProbeSample {
            version: 1,
            written_at_ns: 1,
        })
        .unwrap();
        arp.populate(&[]).unwrap();
        assert!(arp.observe().unwrap().is_some());
        assert!(merged.observe().unwrap().is_none());
    }
}

//! In-memory replicated store.
//!
//! Writes are queued on a crossbeam channel and applied by one dispatcher
//! thread per structure once their propagation delay has elapsed. After a
//! change is applied, every registered listener is invoked from the
//! dispatcher thread. Reads see only applied changes.

use super::{
    ArpEntry, ChangeListener, ListenerId, MacAddr, ReplicatedMap, ReplicatedSet, Route,
    StoreError, StoreProvider,
};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

type ListenerList = Arc<Mutex<Vec<(ListenerId, Arc<dyn ChangeListener>)>>>;

enum Command<Op> {
    Apply { enqueued: Instant, op: Op },
    Sync(Sender<()>),
}

/// Listener registry plus the queue feeding the dispatcher thread
struct Dispatcher<Op> {
    name: String,
    sender: Option<Sender<Command<Op>>>,
    worker: Option<JoinHandle<()>>,
    listeners: ListenerList,
    next_listener: AtomicU64,
}

impl<Op: Send + 'static> Dispatcher<Op> {
    /// `apply` returns whether the operation changed the structure.
    fn spawn<F>(name: &str, delay: Duration, mut apply: F) -> Result<Self, StoreError>
    where
        F: FnMut(Op) -> bool + Send + 'static,
    {
        let (sender, receiver): (Sender<Command<Op>>, Receiver<Command<Op>>) = channel::unbounded();
        let listeners: ListenerList = Arc::new(Mutex::new(Vec::new()));
        let worker_listeners = Arc::clone(&listeners);

        let worker = std::thread::Builder::new()
            .name(format!("store-{}", name))
            .spawn(move || {
                for command in receiver.iter() {
                    match command {
                        Command::Apply { enqueued, op } => {
                            let due = enqueued + delay;
                            let now = Instant::now();
                            if due > now {
                                std::thread::sleep(due - now);
                            }
                            if apply(op) {
                                let current: Vec<Arc<dyn ChangeListener>> = worker_listeners
                                    .lock()
                                    .iter()
                                    .map(|(_, l)| Arc::clone(l))
                                    .collect();
                                for listener in current {
                                    listener.on_change();
                                }
                            }
                        }
                        Command::Sync(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| StoreError::Unavailable {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            worker: Some(worker),
            listeners,
            next_listener: AtomicU64::new(1),
        })
    }

    fn submit(&self, op: Op) -> Result<(), StoreError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| StoreError::Closed(self.name.clone()))?;
        sender
            .send(Command::Apply {
                enqueued: Instant::now(),
                op,
            })
            .map_err(|_| StoreError::Closed(self.name.clone()))
    }

    fn sync(&self) -> Result<(), StoreError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| StoreError::Closed(self.name.clone()))?;
        let (done_tx, done_rx) = channel::bounded(1);
        sender
            .send(Command::Sync(done_tx))
            .map_err(|_| StoreError::Closed(self.name.clone()))?;
        done_rx
            .recv()
            .map_err(|_| StoreError::Closed(self.name.clone()))
    }

    fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

impl<Op> Drop for Dispatcher<Op> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Dispatcher thread for {} panicked", self.name);
            }
        }
    }
}

enum MapOp<K, V> {
    Put(K, V),
}

/// In-memory [`ReplicatedMap`]
pub struct InMemoryMap<K, V> {
    entries: Arc<RwLock<HashMap<K, V>>>,
    dispatcher: Dispatcher<MapOp<K, V>>,
}

impl<K, V> InMemoryMap<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &str, propagation_delay: Duration) -> Result<Self, StoreError> {
        let entries: Arc<RwLock<HashMap<K, V>>> = Arc::new(RwLock::new(HashMap::new()));
        let applied = Arc::clone(&entries);
        let dispatcher = Dispatcher::spawn(name, propagation_delay, move |op| match op {
            MapOp::Put(key, value) => {
                applied.write().insert(key, value);
                true
            }
        })?;
        Ok(Self {
            entries,
            dispatcher,
        })
    }
}

impl<K, V> ReplicatedMap<K, V> for InMemoryMap<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn put(&self, key: K, value: V) -> Result<(), StoreError> {
        self.dispatcher.submit(MapOp::Put(key, value))
    }

    fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.dispatcher.add_listener(listener)
    }

    fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.dispatcher.sync()
    }
}

enum SetOp<T> {
    Add(T),
    Remove(T),
}

/// In-memory [`ReplicatedSet`]
pub struct InMemorySet<T> {
    members: Arc<RwLock<HashSet<T>>>,
    dispatcher: Dispatcher<SetOp<T>>,
}

impl<T> InMemorySet<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(name: &str, propagation_delay: Duration) -> Result<Self, StoreError> {
        let members: Arc<RwLock<HashSet<T>>> = Arc::new(RwLock::new(HashSet::new()));
        let applied = Arc::clone(&members);
        let dispatcher = Dispatcher::spawn(name, propagation_delay, move |op| match op {
            SetOp::Add(item) => applied.write().insert(item),
            SetOp::Remove(item) => applied.write().remove(&item),
        })?;
        Ok(Self {
            members,
            dispatcher,
        })
    }
}

impl<T> ReplicatedSet<T> for InMemorySet<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn add(&self, item: T) -> Result<(), StoreError> {
        self.dispatcher.submit(SetOp::Add(item))
    }

    fn remove(&self, item: T) -> Result<(), StoreError> {
        self.dispatcher.submit(SetOp::Remove(item))
    }

    fn snapshot(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.members.read().iter().cloned().collect())
    }

    fn len(&self) -> usize {
        self.members.read().len()
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.dispatcher.add_listener(listener)
    }

    fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.dispatcher.sync()
    }
}

type Registry<S> = Mutex<HashMap<String, Arc<S>>>;

/// Named in-memory structures shared by every rank of a local group
///
/// Opening the same name twice returns the same structure, so a writer and
/// its readers running as tasks of one process observe each other's changes.
pub struct InMemoryStoreHub {
    propagation_delay: Duration,
    arp_tables: Registry<InMemoryMap<Ipv4Addr, ArpEntry>>,
    mac_tables: Registry<InMemoryMap<MacAddr, Uuid>>,
    routing_tables: Registry<InMemorySet<Route>>,
    merged_maps: Registry<InMemoryMap<Ipv4Addr, ArpEntry>>,
}

impl InMemoryStoreHub {
    pub fn new(propagation_delay: Duration) -> Self {
        Self {
            propagation_delay,
            arp_tables: Mutex::new(HashMap::new()),
            mac_tables: Mutex::new(HashMap::new()),
            routing_tables: Mutex::new(HashMap::new()),
            merged_maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn propagation_delay(&self) -> Duration {
        self.propagation_delay
    }

    fn open<S, F>(registry: &Registry<S>, name: &str, create: F) -> Result<Arc<S>, StoreError>
    where
        F: FnOnce() -> Result<S, StoreError>,
    {
        let mut registry = registry.lock();
        if let Some(existing) = registry.get(name) {
            return Ok(Arc::clone(existing));
        }
        debug!("Creating in-memory structure {}", name);
        let created = Arc::new(create()?);
        registry.insert(name.to_string(), Arc::clone(&created));
        Ok(created)
    }
}

impl StoreProvider for InMemoryStoreHub {
    fn arp_table(&self, name: &str) -> Result<Arc<dyn ReplicatedMap<Ipv4Addr, ArpEntry>>, StoreError> {
        let delay = self.propagation_delay;
        let map = Self::open(&self.arp_tables, name, || InMemoryMap::new(name, delay))?;
        Ok(map)
    }

    fn mac_table(&self, name: &str) -> Result<Arc<dyn ReplicatedMap<MacAddr, Uuid>>, StoreError> {
        let delay = self.propagation_delay;
        let map = Self::open(&self.mac_tables, name, || InMemoryMap::new(name, delay))?;
        Ok(map)
    }

    fn routing_table(&self, name: &str) -> Result<Arc<dyn ReplicatedSet<Route>>, StoreError> {
        let delay = self.propagation_delay;
        let set = Self::open(&self.routing_tables, name, || InMemorySet::new(name, delay))?;
        Ok(set)
    }

    fn merged_map(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ReplicatedMap<Ipv4Addr, ArpEntry>>, StoreError> {
        let delay = self.propagation_delay;
        let map = Self::open(&self.merged_maps, name, || InMemoryMap::new(name, delay))?;
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
    }

    impl ChangeListener for CountingListener {
        fn on_change(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_put_visible_after_flush() {
        let map: InMemoryMap<u32, String> = InMemoryMap::new("t", Duration::ZERO).unwrap();
        map.put(1, "one".to_string()).unwrap();
        map.flush().unwrap();
        assert_eq!(map.get(&1).unwrap().as_deref(), Some("one"));
        assert_eq!(map.len(), 1);
    }

    /// Writes only become visible once the propagation delay has passed
    #[test]
    fn test_propagation_delay_applies() {
        let map: InMemoryMap<u32, u32> = InMemoryMap::new("slow", Duration::from_millis(50)).unwrap();
        let started = Instant::now();
        map.put(7, 7).unwrap();
        assert_eq!(map.get(&7).unwrap(), None);
        map.flush().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(map.get(&7).unwrap(), Some(7));
    }

    #[test]
    fn test_listeners_notified_until_removed() {
        let map: InMemoryMap<u32, u32> = InMemoryMap::new("listen", Duration::ZERO).unwrap();
        let listener = Arc::new(CountingListener::default());
        let id = map.add_change_listener(listener.clone());

        map.put(1, 1).unwrap();
        map.put(2, 2).unwrap();
        map.flush().unwrap();
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);

        assert!(map.remove_change_listener(id));
        assert!(!map.remove_change_listener(id));
        map.put(3, 3).unwrap();
        map.flush().unwrap();
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
    }

    /// Removing an absent member is not a change and notifies nobody
    #[test]
    fn test_set_notifies_only_on_change() {
        let set: InMemorySet<u32> = InMemorySet::new("set", Duration::ZERO).unwrap();
        let listener = Arc::new(CountingListener::default());
        set.add_change_listener(listener.clone());

        set.add(5).unwrap();
        set.add(5).unwrap();
        set.remove(9).unwrap();
        set.flush().unwrap();
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(set.snapshot().unwrap(), vec![5]);
    }

    #[test]
    fn test_hub_returns_shared_instances() {
        let hub = InMemoryStoreHub::new(Duration::ZERO);
        let writer = hub.arp_table("arp-0").unwrap();
        let reader = hub.arp_table("arp-0").unwrap();
        let other = hub.merged_map("arp-0").unwrap();

        let entry = ArpEntry {
            mac: MacAddr::new(1),
            expiry: 1,
            stale: 2,
            last_arp: 3,
        };
        writer.put(Ipv4Addr::new(10, 0, 0, 1), entry).unwrap();
        writer.flush().unwrap();
        assert_eq!(reader.get(&Ipv4Addr::new(10, 0, 0, 1)).unwrap(), Some(entry));
        assert!(other.is_empty());
    }
}

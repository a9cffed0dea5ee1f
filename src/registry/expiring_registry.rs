use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// A record together with the time of its most recent activity
#[derive(Debug)]
pub struct Timestamped<V> {
    pub last_seen: Instant,
    pub value: V,
    /// set under the index lock when the record is removed from the index
    retired: bool,
}

impl<V> Timestamped<V> {
    fn new(value: V, now: Instant) -> Timestamped<V> {
        Timestamped {
            last_seen: now,
            value,
            retired: false,
        }
    }
}

/// A keyed collection of records that expire when there was no activity for longer than a
///  configured threshold. This is the common pattern behind all of the protocol's caches (peer
///  links, receiver flows, observed senders, ...).
///
/// There are two levels of locking: the index maps keys to individually locked records, and it is
///  only held for lookup, insert or removal of a single key. Work on a record's value happens
///  under the record's own lock, so packet processing on one flow is never blocked by a sweep
///  or by work on other flows for longer than it takes to examine one record.
///
/// A caller can hold on to a record after the index lock is released. Records are therefore
///  marked as retired when they leave the index, and activity on a retired record is redirected
///  to the key's current record. Locks are always taken in index-then-record order.
///
/// NB: All locks are synchronous and are never held across I/O or `.await` points.
pub struct ExpiringRegistry<K, V> {
    name: &'static str,
    ttl: Duration,
    index: Mutex<FxHashMap<K, Arc<Mutex<Timestamped<V>>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panic while holding the lock leaves a consistent record: all mutations are single-step
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl <K: Hash + Eq + Clone + Debug, V> ExpiringRegistry<K, V> {
    pub fn new(name: &'static str, ttl: Duration) -> ExpiringRegistry<K, V> {
        ExpiringRegistry {
            name,
            ttl,
            index: Default::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        lock(&self.index).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &K) -> bool {
        lock(&self.index).contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        lock(&self.index).keys().cloned().collect()
    }

    fn record(&self, key: &K) -> Option<Arc<Mutex<Timestamped<V>>>> {
        lock(&self.index).get(key).cloned()
    }

    /// inserts a record, replacing a previous one for the same key
    pub fn insert(&self, key: K, value: V, now: Instant) {
        let record = Arc::new(Mutex::new(Timestamped::new(value, now)));
        let mut index = lock(&self.index);
        if let Some(replaced) = index.insert(key, record) {
            lock(&replaced).retired = true;
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> where V: Clone {
        let mut index = lock(&self.index);
        let record = index.remove(key)?;
        let mut record = lock(&record);
        record.retired = true;
        drop(index);
        Some(record.value.clone())
    }

    /// Applies `f` to the record for `key` without counting this as activity
    pub fn with_value<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let record = self.record(key)?;
        let mut record = lock(&record);
        Some(f(&mut record.value))
    }

    /// Registers activity for `key`, refreshing its timestamp and applying `f` to its value.
    ///  Returns `None` if there is no record for `key`.
    pub fn refresh_with<R>(&self, key: &K, now: Instant, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        loop {
            let record = self.record(key)?;
            let mut record = lock(&record);
            if record.retired {
                continue;
            }
            record.last_seen = now;
            return Some(f(&mut record.value));
        }
    }

    /// Registers activity for `key`, creating the record if there is none. `f` is applied to the
    ///  value together with a flag whether the record was freshly created.
    ///
    /// NB: `create` is called under the index lock and should be cheap
    pub fn upsert_with<R>(&self, key: K, now: Instant, create: impl FnOnce() -> V, f: impl FnOnce(&mut V, bool) -> R) -> R {
        loop {
            let mut index = lock(&self.index);
            let existing = index.get(&key).cloned();
            match existing {
                Some(record) => {
                    drop(index);
                    let mut record = lock(&record);
                    if record.retired {
                        trace!(registry = self.name, ?key, "record was evicted concurrently, retrying");
                        continue;
                    }
                    record.last_seen = now;
                    return f(&mut record.value, false);
                }
                None => {
                    trace!(registry = self.name, ?key, "creating record");
                    let record = Arc::new(Mutex::new(Timestamped::new(create(), now)));
                    // locked before it becomes visible, so it cannot be retired in between
                    let mut locked = lock(&record);
                    index.insert(key, record.clone());
                    drop(index);
                    return f(&mut locked.value, true);
                }
            }
        }
    }

    pub fn get_cloned(&self, key: &K) -> Option<V> where V: Clone {
        self.with_value(key, |v| v.clone())
    }

    pub fn last_seen(&self, key: &K) -> Option<Instant> {
        let record = self.record(key)?;
        let last_seen = lock(&record).last_seen;
        Some(last_seen)
    }

    /// clones of all records, in no particular order
    pub fn entries(&self) -> Vec<(K, V)> where V: Clone {
        self.keys().into_iter()
            .filter_map(|k| self.get_cloned(&k).map(|v| (k, v)))
            .collect()
    }

    /// Removes all records whose most recent activity is more than the registry's TTL before
    ///  `now`, returning the removed records.
    ///
    /// The index lock is taken once to collect the keys, and then once per key - foreground
    ///  processing can interleave between records.
    pub fn sweep(&self, now: Instant) -> Vec<(K, V)> where V: Clone {
        let mut evicted = Vec::new();

        for key in self.keys() {
            let mut index = lock(&self.index);
            let is_expired = match index.get(&key) {
                Some(record) => {
                    let mut record = lock(record);
                    let is_expired = now.saturating_duration_since(record.last_seen) > self.ttl;
                    record.retired = is_expired;
                    is_expired
                }
                None => false,
            };
            if !is_expired {
                continue;
            }

            if let Some(record) = index.remove(&key) {
                drop(index);
                debug!(registry = self.name, ?key, "evicting expired record");
                // other holders of the record may still be finishing work on it
                let value = match Arc::try_unwrap(record) {
                    Ok(record) => record.into_inner().unwrap_or_else(PoisonError::into_inner).value,
                    Err(record) => lock(&record).value.clone(),
                };
                evicted.push((key, value));
            }
        }
        evicted
    }

    /// Replaces the registry's contents, e.g. from a snapshot written by a different process.
    ///  All loaded records count as seen at `now`.
    pub fn replace_all(&self, entries: impl IntoIterator<Item=(K, V)>, now: Instant) {
        let new_index = entries.into_iter()
            .map(|(k, v)| (k, Arc::new(Mutex::new(Timestamped::new(v, now)))))
            .collect::<FxHashMap<_, _>>();
        let mut index = lock(&self.index);
        for record in index.values() {
            lock(record).retired = true;
        }
        *index = new_index;
    }
}

/// Periodically sweeps a registry, passing evicted records to `on_evicted`. This loop runs until
///  the surrounding task is dropped.
pub async fn run_sweep_loop<K, V>(registry: Arc<ExpiringRegistry<K, V>>, sweep_interval: Duration, mut on_evicted: impl FnMut(K, V) + Send)
where K: Hash + Eq + Clone + Debug + Send + Sync, V: Clone + Send,
{
    let mut ticks = interval(sweep_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        let evicted = registry.sweep(Instant::now());
        if !evicted.is_empty() {
            debug!(registry = registry.name(), "evicted {} records", evicted.len());
        }
        for (key, value) in evicted {
            on_evicted(key, value);
        }
    }
}

//! Cache bundle
//!
//! A set of named cache instances sharing one persistence root and the
//! background timers: the periodic writer (collection drain), the periodic
//! compactor, and one TTL sweeper per expiring instance. Also carries the
//! transaction buffer so multi-operation transactions apply in one shot.
//!
//! Startup replays each instance's segment directory into a fresh cache,
//! installs the collector's routers, and opens a new active segment.
//! Shutdown drains once more, compacts when so configured, and closes the
//! active segments, deleting empty ones.

use crate::cache::{Cache, CacheStats, InstanceConfig};
use crate::collector::Collector;
use duracache_common::{Cloner, DumpInterval, Error, PersistConfig, Result, RewriteInterval};
use duracache_log::codec::ChangeRecord;
use duracache_log::{clean_segment_dir, reader};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Instance used when an operation names an unknown instance id.
pub const DEFAULT_INSTANCE: &str = "*default";

enum Verb {
    Set,
    Remove,
    RemoveGroup,
}

struct TransactionItem<V> {
    verb: Verb,
    instance_id: String,
    item_id: String,
    value: Option<V>,
    group_ids: Vec<String>,
}

struct Instance<V> {
    cache: RwLock<Cache<V>>,
    collector: Option<Arc<Collector>>,
}

struct BundleInner<V> {
    // Bundle-wide operation lock: shared for single operations, exclusive
    // while a transaction buffer is applied in one shot.
    ops: RwLock<()>,
    instances: HashMap<String, Arc<Instance<V>>>,
    persist: Option<PersistConfig>,
    transactions: Mutex<HashMap<String, Vec<TransactionItem<V>>>>,
    commit_lock: Mutex<()>,
    shutdown: AtomicBool,
    timer_lock: Mutex<()>,
    timer_cv: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<V> BundleInner<V> {
    fn instance(&self, instance_id: &str) -> &Arc<Instance<V>> {
        self.instances
            .get(instance_id)
            .unwrap_or_else(|| &self.instances[DEFAULT_INSTANCE])
    }

    // Sleep until `timeout` elapses or shutdown is signalled; returns
    // whether the bundle is still running.
    fn wait(&self, timeout: Duration) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self.timer_lock.lock();
        self.timer_cv.wait_for(&mut guard, timeout);
        !self.shutdown.load(Ordering::SeqCst)
    }
}

/// Multi-instance cache with optional durable log and transactions.
pub struct CacheBundle<V> {
    inner: Arc<BundleInner<V>>,
}

impl<V: Send + Sync + 'static> CacheBundle<V> {
    /// Create a bundle with no persistence. A `*default` instance is always
    /// present.
    pub fn new(mut configs: HashMap<String, InstanceConfig<V>>) -> Self {
        configs
            .entry(DEFAULT_INSTANCE.to_string())
            .or_insert_with(InstanceConfig::unbounded);

        let instances = configs
            .into_iter()
            .map(|(id, cfg)| {
                let instance = Arc::new(Instance {
                    cache: RwLock::new(Cache::new(cfg)),
                    collector: None,
                });
                (id, instance)
            })
            .collect();

        let bundle = Self {
            inner: Arc::new(BundleInner {
                ops: RwLock::new(()),
                instances,
                persist: None,
                transactions: Mutex::new(HashMap::new()),
                commit_lock: Mutex::new(()),
                shutdown: AtomicBool::new(false),
                timer_lock: Mutex::new(()),
                timer_cv: Condvar::new(),
                threads: Mutex::new(Vec::new()),
            }),
        };
        bundle.start_sweepers();
        bundle
    }

    fn start_sweepers(&self) {
        let mut threads = self.inner.threads.lock();
        for (id, instance) in &self.inner.instances {
            let Some(ttl) = instance.cache.read().ttl() else {
                continue;
            };
            let inner = Arc::clone(&self.inner);
            let instance = Arc::clone(instance);
            let id = id.clone();
            threads.push(thread::spawn(move || loop {
                let wait = {
                    let mut cache = instance.cache.write();
                    let removed = cache.remove_expired(SystemTime::now());
                    if removed > 0 {
                        tracing::debug!(instance = %id, removed, "swept expired items");
                    }
                    match cache.next_expiry() {
                        Some(at) => at
                            .duration_since(SystemTime::now())
                            .unwrap_or(Duration::ZERO)
                            .max(Duration::from_millis(1)),
                        None => ttl,
                    }
                };
                if !inner.wait(wait) {
                    return;
                }
            }));
        }
    }
}

impl<V: Serialize + DeserializeOwned + Send + Sync + 'static> CacheBundle<V> {
    /// Create a bundle that recovers each instance from its on-disk log and
    /// keeps the log current according to `persist`.
    ///
    /// Replay failures are fatal: partial state is never exposed.
    pub fn with_persistence(
        persist: PersistConfig,
        mut configs: HashMap<String, InstanceConfig<V>>,
    ) -> Result<Self> {
        if persist.dump_interval == DumpInterval::Disabled {
            return Ok(Self::new(configs));
        }

        configs
            .entry(DEFAULT_INSTANCE.to_string())
            .or_insert_with(InstanceConfig::unbounded);
        fs::create_dir_all(&persist.root_path)?;

        let instances = Self::recover_instances(&persist, configs)?;

        let bundle = Self {
            inner: Arc::new(BundleInner {
                ops: RwLock::new(()),
                instances,
                persist: Some(persist.clone()),
                transactions: Mutex::new(HashMap::new()),
                commit_lock: Mutex::new(()),
                shutdown: AtomicBool::new(false),
                timer_lock: Mutex::new(()),
                timer_cv: Condvar::new(),
                threads: Mutex::new(Vec::new()),
            }),
        };

        if persist.rewrite_interval == RewriteInterval::OnStartup {
            bundle.compact_all();
        }

        bundle.start_sweepers();
        bundle.start_writer_timer();
        bundle.start_compactor_timer();
        Ok(bundle)
    }

    // Replay every instance directory concurrently.
    fn recover_instances(
        persist: &PersistConfig,
        configs: HashMap<String, InstanceConfig<V>>,
    ) -> Result<HashMap<String, Arc<Instance<V>>>> {
        let results: Vec<(String, Result<Instance<V>>)> = thread::scope(|scope| {
            let handles: Vec<_> = configs
                .into_iter()
                .map(|(id, cfg)| {
                    let persist = persist.clone();
                    scope.spawn(move || {
                        let built = Self::recover_instance(&persist, &id, cfg);
                        (id, built)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("instance recovery thread panicked"))
                .collect()
        });

        let mut instances = HashMap::with_capacity(results.len());
        for (id, built) in results {
            let instance = built.inspect_err(|e| {
                error!(instance = %id, error = %e, "startup replay failed");
            })?;
            instances.insert(id, Arc::new(instance));
        }
        Ok(instances)
    }

    fn recover_instance(
        persist: &PersistConfig,
        instance_id: &str,
        config: InstanceConfig<V>,
    ) -> Result<Instance<V>> {
        let dir = persist.root_path.join(instance_id);
        fs::create_dir_all(&dir)?;

        let segments = clean_segment_dir(&dir)?;
        let state = reader::replay::<V>(&segments)?;

        let mut cache = Cache::new(config);
        let restored = state.len();
        for (item_id, record) in state {
            if let Some(value) = record.value {
                cache.set_restored(&item_id, value, record.group_ids, record.expiry_time);
            }
        }

        let collector = Arc::new(Collector::open(
            instance_id,
            dir,
            persist.dump_interval,
            persist.write_limit_mib,
        )?);

        let remove_router = Arc::clone(&collector);
        cache.add_eviction_callback(Arc::new(move |item_id: &str, _: &V| {
            remove_router.note_remove::<V>(item_id);
        }));

        let set_router = Arc::clone(&collector);
        let sync = persist.dump_interval.is_sync();
        cache.set_set_notifier(Arc::new(
            move |item_id: &str,
                  value: &Arc<V>,
                  group_ids: &HashSet<String>,
                  expiry_time: Option<SystemTime>| {
                if sync {
                    let record = ChangeRecord::set(
                        item_id,
                        &**value,
                        group_ids.iter().cloned().collect(),
                        expiry_time,
                    );
                    let _ = set_router.write_entity(&record);
                } else {
                    set_router.note_set(item_id);
                }
            },
        ));

        info!(instance = %instance_id, restored, "recovered cache instance");
        Ok(Instance {
            cache: RwLock::new(cache),
            collector: Some(collector),
        })
    }

    fn start_writer_timer(&self) {
        let Some(period) = self
            .inner
            .persist
            .as_ref()
            .and_then(|p| p.dump_interval.period())
        else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        self.inner.threads.lock().push(thread::spawn(move || {
            while inner.wait(period) {
                drain_all(&inner);
            }
        }));
    }

    fn start_compactor_timer(&self) {
        let Some(period) = self
            .inner
            .persist
            .as_ref()
            .and_then(|p| p.rewrite_interval.period())
        else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        self.inner.threads.lock().push(thread::spawn(move || {
            while inner.wait(period) {
                compact_all(&inner);
            }
        }));
    }

    fn compact_all(&self) {
        compact_all(&self.inner);
    }

    /// Look up a value, refreshing its recency.
    pub fn get(&self, instance_id: &str, item_id: &str) -> Option<Arc<V>> {
        let _ops = self.inner.ops.read();
        self.inner.instance(instance_id).cache.write().get(item_id)
    }

    /// Return an independent copy of a value via its [`Cloner`] capability.
    pub fn get_cloned(&self, instance_id: &str, item_id: &str) -> Result<V>
    where
        V: Cloner,
    {
        let value = self.get(instance_id, item_id).ok_or(Error::NotFound)?;
        value.clone_value()
    }

    /// Insert or replace an item.
    pub fn set(&self, instance_id: &str, item_id: &str, value: V, group_ids: &[String]) {
        let _ops = self.inner.ops.read();
        self.inner
            .instance(instance_id)
            .cache
            .write()
            .set(item_id, value, group_ids);
    }

    /// Remove an item; returns whether it existed.
    pub fn remove(&self, instance_id: &str, item_id: &str) -> bool {
        let _ops = self.inner.ops.read();
        self.inner.instance(instance_id).cache.write().remove(item_id)
    }

    /// Remove every member of a group.
    pub fn remove_group(&self, instance_id: &str, group_id: &str) {
        let _ops = self.inner.ops.read();
        self.inner
            .instance(instance_id)
            .cache
            .write()
            .remove_group(group_id);
    }

    /// Remove all items from the named instances, or from every instance
    /// when `instance_ids` is `None`.
    pub fn clear(&self, instance_ids: Option<&[&str]>) {
        let _ops = self.inner.ops.read();
        match instance_ids {
            Some(ids) => {
                for id in ids {
                    self.inner.instance(id).cache.write().clear();
                }
            }
            None => {
                for instance in self.inner.instances.values() {
                    instance.cache.write().clear();
                }
            }
        }
    }

    pub fn has_item(&self, instance_id: &str, item_id: &str) -> bool {
        let _ops = self.inner.ops.read();
        self.inner.instance(instance_id).cache.read().has_item(item_id)
    }

    pub fn has_group(&self, instance_id: &str, group_id: &str) -> bool {
        let _ops = self.inner.ops.read();
        self.inner.instance(instance_id).cache.read().has_group(group_id)
    }

    pub fn group_item_ids(&self, instance_id: &str, group_id: &str) -> Vec<String> {
        let _ops = self.inner.ops.read();
        self.inner
            .instance(instance_id)
            .cache
            .read()
            .group_item_ids(group_id)
    }

    pub fn group_items(&self, instance_id: &str, group_id: &str) -> Vec<Arc<V>> {
        let _ops = self.inner.ops.read();
        self.inner
            .instance(instance_id)
            .cache
            .read()
            .group_items(group_id)
    }

    /// Item ids starting with `prefix`.
    pub fn item_ids_with_prefix(&self, instance_id: &str, prefix: &str) -> Vec<String> {
        let _ops = self.inner.ops.read();
        self.inner
            .instance(instance_id)
            .cache
            .read()
            .item_ids_with_prefix(prefix)
    }

    /// The expiry of an item; `Ok(None)` when it never expires.
    pub fn item_expiry_time(
        &self,
        instance_id: &str,
        item_id: &str,
    ) -> Result<Option<SystemTime>> {
        let _ops = self.inner.ops.read();
        self.inner
            .instance(instance_id)
            .cache
            .read()
            .item_expiry_time(item_id)
            .ok_or(Error::NotFound)
    }

    /// Item and group counts for the named instances, or for all of them.
    pub fn cache_stats(&self, instance_ids: Option<&[&str]>) -> HashMap<String, CacheStats> {
        let _ops = self.inner.ops.read();
        match instance_ids {
            Some(ids) => ids
                .iter()
                .map(|id| (id.to_string(), self.inner.instance(id).cache.read().stats()))
                .collect(),
            None => self
                .inner
                .instances
                .iter()
                .map(|(id, instance)| (id.clone(), instance.cache.read().stats()))
                .collect(),
        }
    }

    /// Open a new transaction buffer and return its id.
    pub fn begin_transaction(&self) -> String {
        let trans_id = Uuid::new_v4().to_string();
        self.inner
            .transactions
            .lock()
            .insert(trans_id.clone(), Vec::new());
        trans_id
    }

    /// Queue a set into a transaction buffer.
    pub fn queue_set(
        &self,
        trans_id: &str,
        instance_id: &str,
        item_id: &str,
        value: V,
        group_ids: &[String],
    ) {
        self.queue(
            trans_id,
            TransactionItem {
                verb: Verb::Set,
                instance_id: instance_id.to_string(),
                item_id: item_id.to_string(),
                value: Some(value),
                group_ids: group_ids.to_vec(),
            },
        );
    }

    /// Queue a removal into a transaction buffer.
    pub fn queue_remove(&self, trans_id: &str, instance_id: &str, item_id: &str) {
        self.queue(
            trans_id,
            TransactionItem {
                verb: Verb::Remove,
                instance_id: instance_id.to_string(),
                item_id: item_id.to_string(),
                value: None,
                group_ids: Vec::new(),
            },
        );
    }

    /// Queue a group removal into a transaction buffer.
    pub fn queue_remove_group(&self, trans_id: &str, instance_id: &str, group_id: &str) {
        self.queue(
            trans_id,
            TransactionItem {
                verb: Verb::RemoveGroup,
                instance_id: instance_id.to_string(),
                item_id: String::new(),
                value: None,
                group_ids: vec![group_id.to_string()],
            },
        );
    }

    fn queue(&self, trans_id: &str, item: TransactionItem<V>) {
        let mut transactions = self.inner.transactions.lock();
        if let Some(buffer) = transactions.get_mut(trans_id) {
            buffer.push(item);
        } else {
            warn!(trans_id, "queue on unknown transaction, dropping");
        }
    }

    /// Discard a transaction buffer.
    pub fn rollback_transaction(&self, trans_id: &str) {
        self.inner.transactions.lock().remove(trans_id);
    }

    /// Apply a transaction buffer in one shot, in queue order.
    pub fn commit_transaction(&self, trans_id: &str) {
        let _commit = self.inner.commit_lock.lock();
        let Some(buffer) = self.inner.transactions.lock().remove(trans_id) else {
            return;
        };
        let _ops = self.inner.ops.write();
        for item in buffer {
            let instance = self.inner.instance(&item.instance_id);
            match item.verb {
                Verb::Set => {
                    if let Some(value) = item.value {
                        instance
                            .cache
                            .write()
                            .set(&item.item_id, value, &item.group_ids);
                    }
                }
                Verb::Remove => {
                    instance.cache.write().remove(&item.item_id);
                }
                Verb::RemoveGroup => {
                    if let Some(group_id) = item.group_ids.first() {
                        instance.cache.write().remove_group(group_id);
                    }
                }
            }
        }
    }

    /// Stop the timers, drain once more, compact when so configured, and
    /// close every active segment (deleting empty ones). Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.timer_cv.notify_all();
        let handles = std::mem::take(&mut *self.inner.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }

        let Some(persist) = self.inner.persist.clone() else {
            return;
        };

        drain_all(&self.inner);
        if persist.rewrite_interval.compact_on_shutdown() {
            compact_all(&self.inner);
        }
        for (id, instance) in &self.inner.instances {
            if let Some(collector) = &instance.collector {
                if let Err(e) = collector.close_active() {
                    error!(instance = %id, error = %e, "failed to close active segment");
                }
            }
        }
        info!("cache bundle shut down");
    }
}

fn drain_all<V: Serialize>(inner: &BundleInner<V>) {
    for (id, instance) in &inner.instances {
        if let Some(collector) = &instance.collector {
            if let Err(e) = collector.drain_to_disk(&instance.cache) {
                error!(instance = %id, error = %e, "drain failed, entries kept for retry");
            }
        }
    }
}

fn compact_all<V: Serialize + DeserializeOwned>(inner: &BundleInner<V>) {
    for (id, instance) in &inner.instances {
        if let Some(collector) = &instance.collector {
            if let Err(e) = collector.compact::<V>() {
                error!(instance = %id, error = %e, "compaction failed, will retry");
            }
        }
    }
}

impl<V> Drop for CacheBundle<V> {
    fn drop(&mut self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.timer_cv.notify_all();
        let handles = std::mem::take(&mut *self.inner.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

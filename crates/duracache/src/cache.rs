//! Cache engine
//!
//! One named cache instance: item map, recency order, expiry order, and the
//! group index, updated together under the instance's engine lock (owned by
//! the bundle). Every removal pathway routes through the eviction callbacks
//! after the item has been unlinked from all four structures; the
//! collector's removal router is installed as one such callback.

use crate::lru::LruList;
use crate::ttl::TtlList;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Fired after an item has been unlinked from every structure.
///
/// Callbacks must not re-enter the engine lock.
pub type EvictionCallback<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

/// Collector notification for sets; carries the item's live state so
/// synchronous mode can persist it without re-entering the engine.
pub(crate) type SetNotifier<V> =
    Arc<dyn Fn(&str, &Arc<V>, &HashSet<String>, Option<SystemTime>) + Send + Sync>;

/// Configuration for a single cache instance.
pub struct InstanceConfig<V> {
    /// Maximum number of items; `None` (or zero) is unbounded
    pub max_entries: Option<usize>,
    /// Time-to-live for new items; `None` means items never expire
    pub ttl: Option<Duration>,
    /// When true, `set` on an existing item does not refresh its expiry
    pub static_ttl: bool,
    /// Eviction callbacks, fired in registration order
    pub on_evicted: Vec<EvictionCallback<V>>,
}

impl<V> Default for InstanceConfig<V> {
    fn default() -> Self {
        Self {
            max_entries: None,
            ttl: None,
            static_ttl: false,
            on_evicted: Vec::new(),
        }
    }
}

impl<V> Clone for InstanceConfig<V> {
    fn clone(&self) -> Self {
        Self {
            max_entries: self.max_entries,
            ttl: self.ttl,
            static_ttl: self.static_ttl,
            on_evicted: self.on_evicted.clone(),
        }
    }
}

impl<V> InstanceConfig<V> {
    /// An unbounded instance with no expiry
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// Item counts for one instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub items: usize,
    pub groups: usize,
}

struct CachedItem<V> {
    value: Arc<V>,
    group_ids: HashSet<String>,
    expiry_time: Option<SystemTime>,
}

/// One cache instance's in-memory state.
pub struct Cache<V> {
    items: HashMap<String, CachedItem<V>>,
    lru: LruList,
    ttl_order: TtlList,
    groups: HashMap<String, HashSet<String>>,
    max_entries: Option<usize>,
    ttl: Option<Duration>,
    static_ttl: bool,
    on_evicted: Vec<EvictionCallback<V>>,
    set_notifier: Option<SetNotifier<V>>,
}

impl<V> Cache<V> {
    pub fn new(config: InstanceConfig<V>) -> Self {
        Self {
            items: HashMap::new(),
            lru: LruList::new(),
            ttl_order: TtlList::new(),
            groups: HashMap::new(),
            max_entries: config.max_entries.filter(|&m| m > 0),
            ttl: config.ttl.filter(|t| !t.is_zero()),
            static_ttl: config.static_ttl,
            on_evicted: config.on_evicted,
            set_notifier: None,
        }
    }

    /// Append an eviction callback; fired after any already registered.
    pub(crate) fn add_eviction_callback(&mut self, cb: EvictionCallback<V>) {
        self.on_evicted.push(cb);
    }

    pub(crate) fn set_set_notifier(&mut self, notifier: SetNotifier<V>) {
        self.set_notifier = Some(notifier);
    }

    pub(crate) fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Look up an item, refreshing its recency on hit.
    pub fn get(&mut self, item_id: &str) -> Option<Arc<V>> {
        let item = self.items.get(item_id)?;
        let value = Arc::clone(&item.value);
        self.lru.move_to_front(item_id);
        Some(value)
    }

    /// Insert or replace an item.
    ///
    /// Replacing refreshes the recency position, swaps group membership, and
    /// (unless `static_ttl`) recomputes the expiry from now.
    pub fn set(&mut self, item_id: &str, value: V, group_ids: &[String]) {
        if self.items.contains_key(item_id) {
            self.replace(item_id, value, group_ids);
        } else {
            self.insert(item_id, value, group_ids);
        }
        if let Some(notify) = self.set_notifier.clone() {
            let item = &self.items[item_id];
            notify(item_id, &item.value, &item.group_ids, item.expiry_time);
        }
    }

    fn replace(&mut self, item_id: &str, value: V, group_ids: &[String]) {
        let new_groups: HashSet<String> = group_ids.iter().cloned().collect();
        let old_groups = {
            let item = self.items.get_mut(item_id).expect("checked by caller");
            item.value = Arc::new(value);
            std::mem::replace(&mut item.group_ids, new_groups.clone())
        };

        for gone in old_groups.difference(&new_groups) {
            if let Some(members) = self.groups.get_mut(gone) {
                members.remove(item_id);
                if members.is_empty() {
                    self.groups.remove(gone);
                }
            }
        }
        for added in new_groups.difference(&old_groups) {
            self.groups
                .entry(added.clone())
                .or_default()
                .insert(item_id.to_string());
        }

        self.lru.move_to_front(item_id);

        if !self.static_ttl {
            if let Some(ttl) = self.ttl {
                let expiry = SystemTime::now() + ttl;
                self.items.get_mut(item_id).expect("checked by caller").expiry_time =
                    Some(expiry);
                self.ttl_order.insert(item_id, expiry);
            }
        }
    }

    fn insert(&mut self, item_id: &str, value: V, group_ids: &[String]) {
        if let Some(max) = self.max_entries {
            while self.items.len() >= max {
                let Some(victim) = self.lru.pop_back() else {
                    break;
                };
                self.remove_item(&victim);
            }
        }

        let expiry_time = self.ttl.map(|ttl| SystemTime::now() + ttl);
        let group_set: HashSet<String> = group_ids.iter().cloned().collect();
        for group in &group_set {
            self.groups
                .entry(group.clone())
                .or_default()
                .insert(item_id.to_string());
        }
        self.items.insert(
            item_id.to_string(),
            CachedItem {
                value: Arc::new(value),
                group_ids: group_set,
                expiry_time,
            },
        );
        self.lru.push_front(item_id);
        if let Some(expiry) = expiry_time {
            self.ttl_order.insert(item_id, expiry);
        }
    }

    /// Startup-replay insert preserving the persisted expiry time; does not
    /// notify the collector.
    pub(crate) fn set_restored(
        &mut self,
        item_id: &str,
        value: V,
        group_ids: Vec<String>,
        expiry_time: Option<SystemTime>,
    ) {
        if let Some(max) = self.max_entries {
            while self.items.len() >= max {
                let Some(victim) = self.lru.pop_back() else {
                    break;
                };
                self.remove_item(&victim);
            }
        }

        let group_set: HashSet<String> = group_ids.into_iter().collect();
        for group in &group_set {
            self.groups
                .entry(group.clone())
                .or_default()
                .insert(item_id.to_string());
        }
        self.items.insert(
            item_id.to_string(),
            CachedItem {
                value: Arc::new(value),
                group_ids: group_set,
                expiry_time,
            },
        );
        self.lru.push_front(item_id);
        if let Some(expiry) = expiry_time {
            self.ttl_order.insert(item_id, expiry);
        }
    }

    /// Remove an item; returns whether it existed.
    pub fn remove(&mut self, item_id: &str) -> bool {
        self.remove_item(item_id)
    }

    // Unlink from all four structures, then fire every eviction callback.
    fn remove_item(&mut self, item_id: &str) -> bool {
        let Some(item) = self.items.remove(item_id) else {
            return false;
        };
        self.lru.remove(item_id);
        self.ttl_order.remove(item_id);
        for group in &item.group_ids {
            if let Some(members) = self.groups.get_mut(group) {
                members.remove(item_id);
                if members.is_empty() {
                    self.groups.remove(group);
                }
            }
        }
        for cb in &self.on_evicted {
            cb(item_id, &item.value);
        }
        true
    }

    /// Remove every member of a group.
    pub fn remove_group(&mut self, group_id: &str) {
        let Some(members) = self.groups.get(group_id) else {
            return;
        };
        let ids: Vec<String> = members.iter().cloned().collect();
        for id in ids {
            self.remove_item(&id);
        }
    }

    /// Remove every item, leaving empty structures.
    pub fn clear(&mut self) {
        let ids: Vec<String> = self.items.keys().cloned().collect();
        for id in ids {
            self.remove_item(&id);
        }
    }

    /// Remove every item whose expiry is at or before `now`; returns how
    /// many were removed.
    pub(crate) fn remove_expired(&mut self, now: SystemTime) -> usize {
        let expired = self.ttl_order.pop_expired(now);
        let count = expired.len();
        for id in expired {
            self.remove_item(&id);
        }
        count
    }

    /// The earliest linked expiry, if any item carries one.
    pub(crate) fn next_expiry(&self) -> Option<SystemTime> {
        self.ttl_order.earliest()
    }

    pub fn has_item(&self, item_id: &str) -> bool {
        self.items.contains_key(item_id)
    }

    pub fn has_group(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Item ids of a group; empty when the group does not exist.
    pub fn group_item_ids(&self, group_id: &str) -> Vec<String> {
        self.groups
            .get(group_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Values of a group's members.
    pub fn group_items(&self, group_id: &str) -> Vec<Arc<V>> {
        self.group_item_ids(group_id)
            .iter()
            .filter_map(|id| self.items.get(id).map(|item| Arc::clone(&item.value)))
            .collect()
    }

    /// Item ids starting with `prefix`.
    pub fn item_ids_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.items
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// The expiry of an item; `None` when the item does not exist, inner
    /// `None` when it never expires.
    pub fn item_expiry_time(&self, item_id: &str) -> Option<Option<SystemTime>> {
        self.items.get(item_id).map(|item| item.expiry_time)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            items: self.items.len(),
            groups: self.groups.len(),
        }
    }

    /// Live state of one item for the collector's drain.
    pub(crate) fn snapshot_item(
        &self,
        item_id: &str,
    ) -> Option<(Arc<V>, Vec<String>, Option<SystemTime>)> {
        self.items.get(item_id).map(|item| {
            (
                Arc::clone(&item.value),
                item.group_ids.iter().cloned().collect(),
                item.expiry_time,
            )
        })
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        assert_eq!(self.lru.len(), self.items.len(), "lru domain mismatch");
        let with_expiry = self
            .items
            .values()
            .filter(|item| item.expiry_time.is_some())
            .count();
        assert_eq!(self.ttl_order.len(), with_expiry, "ttl domain mismatch");
        for (group, members) in &self.groups {
            assert!(!members.is_empty(), "empty group {group} retained");
            for id in members {
                assert!(
                    self.items
                        .get(id)
                        .map(|item| item.group_ids.contains(group))
                        .unwrap_or(false),
                    "group index not inverse of membership"
                );
            }
        }
        for (id, item) in &self.items {
            for group in &item.group_ids {
                assert!(
                    self.groups
                        .get(group)
                        .map(|members| members.contains(id))
                        .unwrap_or(false),
                    "membership not in group index"
                );
            }
        }
    }
}

// Bounded LRU cache and the engagement change detector built on it.
//
// Recency is tracked with a monotonically increasing tick per access: the
// map holds each entry's current tick and a BTreeMap orders ticks, so the
// least-recently-used key is always the first entry of `order`.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::db::models::{EngagementSnapshot, PostKey, PostType};

/// A fixed-capacity map that evicts the least-recently-used entry on insert.
///
/// Both `get` and `put` count as a use.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// A cache holding at most `capacity` entries. A capacity of zero is
    /// treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tick: 0,
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Membership test that does not refresh recency.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a value and mark it most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (_, last) = self.entries.get_mut(key)?;
        let previous = std::mem::replace(last, tick);
        if let Some(k) = self.order.remove(&previous) {
            self.order.insert(tick, k);
        }
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Insert or replace a value, marking it most-recently-used. Returns the
    /// entry evicted to make room, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        let tick = self.next_tick();

        if let Some((_, previous)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&previous);
            self.order.insert(tick, key);
            return None;
        }
        self.order.insert(tick, key);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let (_, oldest) = self.order.pop_first()?;
        self.entries
            .remove(&oldest)
            .map(|(value, _)| (oldest, value))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, tick) = self.entries.remove(key)?;
        self.order.remove(&tick);
        Some(value)
    }
}

/// Remembers the last engagement snapshot seen for each post so impact is
/// only recomputed when a post's counters actually moved.
///
/// Entries are keyed by the full post identity. A post evicted from the
/// cache reports as changed the next time it is seen.
#[derive(Debug)]
pub struct ChangeCache {
    inner: LruCache<PostKey, EngagementSnapshot>,
}

impl ChangeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Returns true if `snapshot` differs from the one cached for this post
    /// (or none is cached), and stores it. Returns false without touching
    /// the entry's contents when the snapshot is unchanged.
    pub fn consider(&mut self, post_type: PostType, post_id: i64, snapshot: EngagementSnapshot) -> bool {
        let key = PostKey::new(post_type, post_id);
        if self.inner.get(&key) == Some(&snapshot) {
            return false;
        }
        self.inner.put(key, snapshot);
        true
    }

    /// Drop a post's entry, so its next observation counts as a change.
    /// Used when the write carrying that change never reached the store.
    pub fn forget(&mut self, key: &PostKey) {
        self.inner.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(post_type: PostType, interaction: i64, likes: i64) -> EngagementSnapshot {
        EngagementSnapshot {
            post_type,
            interaction_total: interaction,
            likes_total: likes,
        }
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        // Touch "a" so "b" becomes the eviction candidate
        assert_eq!(cache.get(&"a"), Some(&1));
        let evicted = cache.put("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_capacity_plus_one_evicts_oldest() {
        let mut cache = LruCache::new(3);
        for key in 1..=3 {
            assert!(cache.put(key, key * 10).is_none());
        }
        assert_eq!(cache.put(4, 40), Some((1, 10)));
        assert_eq!(cache.len(), 3);
        assert!((2..=4).all(|key| cache.contains(&key)));
    }

    #[test]
    fn test_lru_replace_does_not_evict() {
        let mut cache = LruCache::new(2);
        cache.put(1, "x");
        cache.put(2, "y");
        assert_eq!(cache.put(1, "z"), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(&"z"));
    }

    #[test]
    fn test_lru_remove() {
        let mut cache = LruCache::new(3);
        cache.put(1, ());
        assert_eq!(cache.remove(&1), Some(()));
        assert_eq!(cache.remove(&1), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_zero_capacity_holds_one() {
        let mut cache = LruCache::new(0);
        cache.put(1, 1);
        cache.put(2, 2);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.contains(&2));
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_change_cache_reports_changes_only() {
        let mut cache = ChangeCache::new(10);
        let s = snapshot(PostType::Stocktwit, 2, 5);
        assert!(cache.consider(PostType::Stocktwit, 1, s));
        assert!(!cache.consider(PostType::Stocktwit, 1, s));
        assert!(cache.consider(
            PostType::Stocktwit,
            1,
            snapshot(PostType::Stocktwit, 2, 6)
        ));
    }

    #[test]
    fn test_change_cache_keys_on_full_identity() {
        let mut cache = ChangeCache::new(10);
        assert!(cache.consider(PostType::TwitterTopic, 7, snapshot(PostType::TwitterTopic, 1, 1)));
        // Same numeric id from another source is a different post
        assert!(cache.consider(PostType::TwitterUser, 7, snapshot(PostType::TwitterUser, 1, 1)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_change_cache_evicted_post_is_new_again() {
        let mut cache = ChangeCache::new(2);
        let s = snapshot(PostType::Stocktwit, 0, 0);
        for id in 1..=3 {
            cache.consider(PostType::Stocktwit, id, s);
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.consider(PostType::Stocktwit, 3, s));
        assert!(cache.consider(PostType::Stocktwit, 1, s));
    }

    #[test]
    fn test_change_cache_forget() {
        let mut cache = ChangeCache::new(10);
        let s = snapshot(PostType::Stocktwit, 0, 0);
        cache.consider(PostType::Stocktwit, 3, s);
        cache.forget(&PostKey::new(PostType::Stocktwit, 3));
        assert!(cache.consider(PostType::Stocktwit, 3, s));
    }
}

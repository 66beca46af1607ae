use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Hash map that remembers the order in which entries were last touched.
///
/// Every insert or `get` moves the entry to the most recent end; `pop_lru` takes from the
/// other end.
pub(crate) struct LruMap<K, V> {
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Hash + Eq + Clone, V> LruMap<K, V> {
    pub(crate) fn new() -> Self {
        LruMap {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry and marks it most recently used.
    pub(crate) fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        let old = std::mem::replace(&mut entry.1, tick);
        if let Some(stored_key) = self.order.remove(&old) {
            self.order.insert(tick, stored_key);
        }
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Looks up an entry without touching its recency.
    pub(crate) fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Inserts or replaces an entry, marking it most recently used. Returns the old value.
    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<V> {
        let tick = self.next_tick();
        self.order.insert(tick, key.clone());
        match self.entries.insert(key, (value, tick)) {
            Some((old, stamp)) => {
                self.order.remove(&stamp);
                Some(old)
            }
            None => None,
        }
    }

    pub(crate) fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (value, stamp) = self.entries.remove(key)?;
        self.order.remove(&stamp);
        Some(value)
    }

    /// Removes and returns the least recently used entry.
    pub(crate) fn pop_lru(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let (value, _) = self.entries.remove(&key)?;
        Some((key, value))
    }

    /// Keys from least to most recently used.
    pub(crate) fn keys_lru(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(key, (value, _))| (key, value))
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut map = LruMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);
        assert_eq!(Some(&1), map.get("a"));
        assert_eq!(Some(("b", 2)), map.pop_lru());
        assert_eq!(Some(("c", 3)), map.pop_lru());
        assert_eq!(Some(("a", 1)), map.pop_lru());
        assert!(map.is_empty());
    }

    #[test]
    fn replace_and_remove() {
        let mut map = LruMap::new();
        assert_eq!(None, map.insert(1, "x"));
        assert_eq!(Some("x"), map.insert(1, "y"));
        map.insert(2, "z");
        assert_eq!(vec![&1, &2], map.keys_lru().collect::<Vec<_>>());
        assert_eq!(Some(&"y"), map.peek(&1));
        assert_eq!(vec![&1, &2], map.keys_lru().collect::<Vec<_>>());
        assert_eq!(Some("y"), map.remove(&1));
        assert_eq!(1, map.len());
        assert_eq!(None, map.peek(&1));
    }
}

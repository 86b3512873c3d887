//! A thin ordered-map wrapper over `BTreeMap<u32, V>`: insert / delete /
//! point lookup / in-order iteration / `search_le` / `search_ge` /
//! `set_value`, keyed by page index.
//!
//! The idiomatic Rust realization of "a balanced ordered map from
//! 32-bit integer keys to pointer-sized values" is simply
//! `std::collections::BTreeMap`, built directly on rather than reaching
//! for an external tree crate to stand in for something the standard
//! library already does well.
use std::collections::BTreeMap;

use crate::ids::PageIdx;

/// Keys are page indices; values are whatever the buddy core or block
/// cache needs to associate with a leader (`()` for a pure set, a byte
/// length for the allocated index, a cache slot id for the cache's
/// auxiliary index).
#[derive(Debug, Default)]
pub(crate) struct OrderedMap<V> {
    inner: BTreeMap<u32, V>,
}

impl<V: Copy> OrderedMap<V> {
    pub fn new() -> Self {
        OrderedMap {
            inner: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn insert(&mut self, key: PageIdx, value: V) {
        self.inner.insert(key.0, value);
    }

    pub fn delete(&mut self, key: PageIdx) -> Option<V> {
        self.inner.remove(&key.0)
    }

    pub fn get(&self, key: PageIdx) -> Option<V> {
        self.inner.get(&key.0).copied()
    }

    pub fn contains(&self, key: PageIdx) -> bool {
        self.inner.contains_key(&key.0)
    }

    /// Overwrites the value for a key that must already be present.
    pub fn set_value(&mut self, key: PageIdx, value: V) {
        let slot = self
            .inner
            .get_mut(&key.0)
            .expect("set_value on an absent key");
        *slot = value;
    }

    /// The minimum-keyed entry, i.e. the lowest-address block
    /// currently present -- used by the buddy core's deterministic
    /// address-ordered first-fit.
    pub fn min(&self) -> Option<(PageIdx, V)> {
        self.inner.iter().next().map(|(k, v)| (PageIdx(*k), *v))
    }

    /// The entry with the largest key `<= key.0`.
    pub fn search_le(&self, key: PageIdx) -> Option<(PageIdx, V)> {
        self.inner
            .range(..=key.0)
            .next_back()
            .map(|(k, v)| (PageIdx(*k), *v))
    }

    /// The entry with the smallest key `>= key.0`.
    pub fn search_ge(&self, key: PageIdx) -> Option<(PageIdx, V)> {
        self.inner
            .range(key.0..)
            .next()
            .map(|(k, v)| (PageIdx(*k), *v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageIdx, V)> + '_ {
        self.inner.iter().map(|(k, v)| (PageIdx(*k), *v))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn search_le_ge() {
        let mut m: OrderedMap<u64> = OrderedMap::new();
        m.insert(PageIdx(2), 20);
        m.insert(PageIdx(5), 50);
        m.insert(PageIdx(9), 90);

        assert_eq!(m.search_le(PageIdx(5)), Some((PageIdx(5), 50)));
        assert_eq!(m.search_le(PageIdx(6)), Some((PageIdx(5), 50)));
        assert_eq!(m.search_le(PageIdx(1)), None);

        assert_eq!(m.search_ge(PageIdx(5)), Some((PageIdx(5), 50)));
        assert_eq!(m.search_ge(PageIdx(6)), Some((PageIdx(9), 90)));
        assert_eq!(m.search_ge(PageIdx(10)), None);
    }

    #[test]
    fn min_and_delete() {
        let mut m: OrderedMap<()> = OrderedMap::new();
        m.insert(PageIdx(7), ());
        m.insert(PageIdx(3), ());
        assert_eq!(m.min(), Some((PageIdx(3), ())));
        m.delete(PageIdx(3));
        assert_eq!(m.min(), Some((PageIdx(7), ())));
        assert!(m.delete(PageIdx(3)).is_none());
    }
}

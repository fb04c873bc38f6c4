//! A map-like object for maps with few entries, implemented as a list of
//! pairs.  Plan rows carry a handful of pass-through columns at most, so
//! linear scans beat hashing there.

use std::borrow::Borrow;

#[derive(Debug, Clone)]
pub struct SmallMap<K, V>(Vec<(K, V)>);

impl<K, V> Default for SmallMap<K, V> {
    fn default() -> Self {
        SmallMap(Vec::new())
    }
}

impl<K: PartialEq, V> SmallMap<K, V> {
    /// Insert, returning the previous value for the key if there was one.
    pub fn insert(&mut self, k: K, v: V) -> Option<V> {
        for (ik, iv) in self.0.iter_mut() {
            if *ik == k {
                return Some(std::mem::replace(iv, v));
            }
        }
        self.0.push((k, v));
        None
    }

    pub fn get<Q>(&self, q: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: PartialEq + ?Sized,
    {
        self.0
            .iter()
            .find(|(k, _)| k.borrow() == q)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (K, V)> {
        self.0.iter()
    }
}

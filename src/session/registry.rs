//! Id-keyed resource tables owned by a session

use std::collections::btree_map;
use std::collections::BTreeMap;

/// Map from a protocol id to a session resource.
///
/// Fresh ids come from a monotonic counter that skips ids the client chose
/// itself, so generated and client-supplied ids never collide.
#[derive(Debug)]
pub struct ResourceTable<K, V> {
    entries: BTreeMap<K, V>,
    next_id: u64,
}

impl<K, V> Default for ResourceTable<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<K: Ord + Copy + From<u64>, V> ResourceTable<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused id. Zero is never handed out.
    pub fn fresh_id(&mut self) -> K {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                continue;
            }
            let id = K::from(self.next_id);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Insert under `id`. Gives the value back if the id is live.
    pub fn insert(&mut self, id: K, value: V) -> Result<(), V> {
        match self.entries.entry(id) {
            btree_map::Entry::Occupied(_) => Err(value),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    pub fn insert_fresh(&mut self, value: V) -> K {
        let id = self.fresh_id();
        self.entries.insert(id, value);
        id
    }

    /// Insert a value built from its fresh id
    pub fn insert_with(&mut self, make: impl FnOnce(K) -> V) -> K {
        let id = self.fresh_id();
        self.entries.insert(id, make(id));
        id
    }

    pub fn get(&self, id: K) -> Option<&V> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut V> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: K) -> Option<V> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: K) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<K> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.entries.iter()
    }

    pub fn values_mut(&mut self) -> btree_map::ValuesMut<'_, K, V> {
        self.entries.values_mut()
    }

    /// Remove and return every entry
    pub fn take_all(&mut self) -> BTreeMap<K, V> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageId;

    #[test]
    fn fresh_ids_skip_client_ids() {
        let mut table: ResourceTable<ImageId, &str> = ResourceTable::new();
        table.insert(ImageId(2), "client").unwrap();
        assert_eq!(table.insert_fresh("a"), ImageId(1));
        assert_eq!(table.insert_fresh("b"), ImageId(3));
        assert_eq!(table.insert(ImageId(3), "dup"), Err("dup"));
        assert_eq!(table.ids(), vec![ImageId(1), ImageId(2), ImageId(3)]);
        let values: Vec<_> = table.iter().map(|(_, value)| *value).collect();
        assert_eq!(values, vec!["a", "client", "b"]);
    }

    #[test]
    fn take_all_empties_table() {
        let mut table: ResourceTable<ImageId, u8> = ResourceTable::new();
        table.insert_fresh(1);
        table.insert_fresh(2);
        assert_eq!(table.take_all().len(), 2);
        assert!(table.is_empty());
    }
}

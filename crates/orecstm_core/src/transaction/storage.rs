//! Storage strategies for the tranlocals of a transaction.
//!
//! Small transactions are the common case, so the executor starts with a single
//! slot and only moves to an array, and then to a hash map, when a transaction
//! proved to need more.

use crate::tranlocal::Tranlocal;
use crate::types::RefId;
use std::collections::HashMap;
use std::fmt;

/// Layout of the tranlocal storage of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// One slot.
    Mono,
    /// A fixed number of slots searched linearly.
    Array,
    /// Unbounded, hashed by reference id.
    Map,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mono => "mono",
            Self::Array => "array",
            Self::Map => "map",
        };
        f.write_str(name)
    }
}

pub(crate) trait TranlocalStorage: Send {
    fn kind(&self) -> StorageKind;

    /// Slot count, `None` when unbounded.
    fn capacity(&self) -> Option<usize>;

    fn len(&self) -> usize;

    fn get(&self, id: RefId) -> Option<&Tranlocal>;

    fn get_mut(&mut self, id: RefId) -> Option<&mut Tranlocal>;

    /// Adds a tranlocal for a reference not yet stored. The caller checks
    /// [`is_full`](Self::is_full) first.
    fn insert(&mut self, tranlocal: Tranlocal);

    fn iter(&self) -> Box<dyn Iterator<Item = &Tranlocal> + '_>;

    fn iter_mut(&mut self) -> Box<dyn Iterator<Item = &mut Tranlocal> + '_>;

    fn clear(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.capacity().is_some_and(|capacity| self.len() >= capacity)
    }

    fn contains(&self, id: RefId) -> bool {
        self.get(id).is_some()
    }
}

/// Creates storage of `kind`; `fixed_capacity` sizes the array variant.
pub(crate) fn new_storage(kind: StorageKind, fixed_capacity: usize) -> Box<dyn TranlocalStorage> {
    match kind {
        StorageKind::Mono => Box::new(MonoStorage::default()),
        StorageKind::Array => Box::new(ArrayStorage::with_capacity(fixed_capacity)),
        StorageKind::Map => Box::new(MapStorage::default()),
    }
}

#[derive(Default)]
struct MonoStorage {
    slot: Option<Tranlocal>,
}

impl TranlocalStorage for MonoStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Mono
    }

    fn capacity(&self) -> Option<usize> {
        Some(1)
    }

    fn len(&self) -> usize {
        usize::from(self.slot.is_some())
    }

    fn get(&self, id: RefId) -> Option<&Tranlocal> {
        self.slot.as_ref().filter(|tranlocal| tranlocal.reference() == id)
    }

    fn get_mut(&mut self, id: RefId) -> Option<&mut Tranlocal> {
        self.slot
            .as_mut()
            .filter(|tranlocal| tranlocal.reference() == id)
    }

    fn insert(&mut self, tranlocal: Tranlocal) {
        assert!(self.slot.is_none(), "mono storage is already occupied");
        self.slot = Some(tranlocal);
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Tranlocal> + '_> {
        Box::new(self.slot.iter())
    }

    fn iter_mut(&mut self) -> Box<dyn Iterator<Item = &mut Tranlocal> + '_> {
        Box::new(self.slot.iter_mut())
    }

    fn clear(&mut self) {
        self.slot = None;
    }
}

struct ArrayStorage {
    slots: Vec<Tranlocal>,
    capacity: usize,
}

impl ArrayStorage {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

impl TranlocalStorage for ArrayStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Array
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, id: RefId) -> Option<&Tranlocal> {
        self.slots.iter().find(|tranlocal| tranlocal.reference() == id)
    }

    fn get_mut(&mut self, id: RefId) -> Option<&mut Tranlocal> {
        self.slots
            .iter_mut()
            .find(|tranlocal| tranlocal.reference() == id)
    }

    fn insert(&mut self, tranlocal: Tranlocal) {
        assert!(
            self.slots.len() < self.capacity,
            "array storage is full at {} slots",
            self.capacity
        );
        self.slots.push(tranlocal);
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Tranlocal> + '_> {
        Box::new(self.slots.iter())
    }

    fn iter_mut(&mut self) -> Box<dyn Iterator<Item = &mut Tranlocal> + '_> {
        Box::new(self.slots.iter_mut())
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}

#[derive(Default)]
struct MapStorage {
    slots: HashMap<RefId, Tranlocal>,
}

impl TranlocalStorage for MapStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Map
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, id: RefId) -> Option<&Tranlocal> {
        self.slots.get(&id)
    }

    fn get_mut(&mut self, id: RefId) -> Option<&mut Tranlocal> {
        self.slots.get_mut(&id)
    }

    fn insert(&mut self, tranlocal: Tranlocal) {
        self.slots.insert(tranlocal.reference(), tranlocal);
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Tranlocal> + '_> {
        Box::new(self.slots.values())
    }

    fn iter_mut(&mut self) -> Box<dyn Iterator<Item = &mut Tranlocal> + '_> {
        Box::new(self.slots.values_mut())
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StmConfig;
    use crate::object::{RefInner, TxnObject};
    use crate::stm::StmShared;
    use crate::tranlocal::TranlocalMode;
    use std::sync::Arc;

    fn tranlocals(count: usize) -> Vec<Tranlocal> {
        let stm = Arc::new(StmShared::new(StmConfig::default()));
        (0..count)
            .map(|i| {
                let owner: Arc<dyn TxnObject> =
                    Arc::new(RefInner::committed(Arc::clone(&stm), i as i64));
                Tranlocal::new(owner, TranlocalMode::Read, false)
            })
            .collect()
    }

    fn exercise(kind: StorageKind, capacity: Option<usize>) {
        let mut storage = new_storage(kind, 4);
        assert_eq!(storage.kind(), kind);
        assert_eq!(storage.capacity(), capacity);
        assert!(storage.is_empty());

        let items = tranlocals(capacity.unwrap_or(8));
        let ids: Vec<RefId> = items.iter().map(Tranlocal::reference).collect();
        for tranlocal in items {
            assert!(!storage.is_full());
            storage.insert(tranlocal);
        }
        assert_eq!(storage.is_full(), capacity.is_some());
        for id in &ids {
            assert!(storage.contains(*id));
            assert_eq!(storage.get_mut(*id).map(|t| t.reference()), Some(*id));
        }
        assert_eq!(storage.iter().count(), ids.len());
        assert_eq!(storage.iter_mut().count(), ids.len());
        assert!(!storage.contains(RefId::new(u64::MAX)));

        storage.clear();
        assert!(storage.is_empty());
        assert!(!storage.contains(ids[0]));
    }

    #[test]
    fn mono_storage() {
        exercise(StorageKind::Mono, Some(1));
    }

    #[test]
    fn array_storage() {
        exercise(StorageKind::Array, Some(4));
    }

    #[test]
    fn map_storage() {
        exercise(StorageKind::Map, None);
    }

    #[test]
    #[should_panic(expected = "already occupied")]
    fn mono_storage_rejects_second_insert() {
        let mut storage = new_storage(StorageKind::Mono, 4);
        for tranlocal in tranlocals(2) {
            storage.insert(tranlocal);
        }
    }
}

//! Thread-safe map from [TransactionId] to transaction state.
use alloc::vec::Vec;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("transaction {0} is already active")]
    AlreadyActive(TransactionId),
}

/// All operations are serialized by one lock. Closures passed to [Self::with] and
/// [Self::retain] run while the lock is held, so they must not access the registry again.
#[derive(Debug)]
pub struct TransactionRegistry<T> {
    map: Mutex<HashMap<TransactionId, T>>,
}

impl<T> Default for TransactionRegistry<T> {
    fn default() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> TransactionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: TransactionId, transaction: T) -> Result<(), RegistryError> {
        let mut map = self.map.lock();
        if map.contains_key(&id) {
            return Err(RegistryError::AlreadyActive(id));
        }
        map.insert(id, transaction);
        Ok(())
    }

    /// Runs the closure on the transaction with the given ID. Returns [None] if the transaction
    /// does not exist.
    pub fn with<R>(&self, id: &TransactionId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.map.lock().get_mut(id).map(f)
    }

    pub fn remove(&self, id: &TransactionId) -> Option<T> {
        self.map.lock().remove(id)
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.map.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<TransactionId> {
        self.map.lock().keys().copied().collect()
    }

    /// Keeps only the transactions for which the closure returns [true].
    pub fn retain(&self, mut f: impl FnMut(&TransactionId, &mut T) -> bool) {
        self.map.lock().retain(|id, transaction| f(id, transaction));
    }

    /// Removes and returns all transactions for which the closure returns [true].
    pub fn extract_if(&self, mut f: impl FnMut(&TransactionId, &mut T) -> bool) -> Vec<(TransactionId, T)> {
        let mut map = self.map.lock();
        let ids: Vec<TransactionId> = map
            .iter_mut()
            .filter_map(|(id, transaction)| f(id, transaction).then_some(*id))
            .collect();
        ids.into_iter()
            .filter_map(|id| map.remove(&id).map(|transaction| (id, transaction)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use spacepackets::util::{UnsignedByteFieldU16, UnsignedByteFieldU8, UnsignedEnum};

    use super::*;

    fn id(seq: u16) -> TransactionId {
        TransactionId::new(
            UnsignedByteFieldU16::new(1).into(),
            UnsignedByteFieldU16::new(seq).into(),
        )
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = TransactionRegistry::new();
        registry.insert(id(1), 5_u32).unwrap();
        assert!(registry.contains(&id(1)));
        assert_eq!(registry.with(&id(1), |v| *v), Some(5));
        assert_eq!(registry.with(&id(2), |v| *v), None);
        assert_eq!(
            registry.insert(id(1), 6).unwrap_err(),
            RegistryError::AlreadyActive(id(1))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_width_independent() {
        let registry = TransactionRegistry::new();
        registry.insert(id(3), ()).unwrap();
        let narrow = TransactionId::new(
            UnsignedByteFieldU8::new(1).into(),
            UnsignedByteFieldU8::new(3).into(),
        );
        assert!(registry.contains(&narrow));
    }

    #[test]
    fn test_remove_and_retain() {
        let registry = TransactionRegistry::new();
        for seq in 0..4 {
            registry.insert(id(seq), seq).unwrap();
        }
        assert_eq!(registry.remove(&id(0)), Some(0));
        registry.retain(|_, v| *v != 1);
        let mut ids = registry.ids();
        ids.sort_by_key(|id| id.seq_num().value());
        assert_eq!(ids, [id(2), id(3)]);
        let extracted = registry.extract_if(|_, v| *v == 3);
        assert_eq!(extracted, [(id(3), 3)]);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let registry = Arc::new(TransactionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|seq| {
                let registry = registry.clone();
                thread::spawn(move || {
                    registry.insert(id(seq), 0_u32).unwrap();
                    for _ in 0..100 {
                        registry.with(&id(seq), |v| *v += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 8);
        for seq in 0..8 {
            assert_eq!(registry.with(&id(seq), |v| *v), Some(100));
        }
    }
}

//! Content-addressed object store.
//!
//! Objects are immutable byte strings named by their blake3 digest. The
//! store remembers which objects have not been synced to peers yet; a
//! commit reports the unsynced objects it references so the sync layer
//! can upload them.

use parking_lot::RwLock;
use sio_error::{Result, SioError};
use sio_types::ObjectIdentifier;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Objects {
    data: HashMap<ObjectIdentifier, Arc<[u8]>>,
    unsynced: BTreeSet<ObjectIdentifier>,
}

/// Shared, thread-safe object store.
#[derive(Debug, Default)]
pub struct ObjectStore {
    inner: RwLock<Objects>,
}

impl ObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes`. Returns the id and whether the object was new.
    pub fn put(&self, bytes: Vec<u8>) -> (ObjectIdentifier, bool) {
        let id = ObjectIdentifier::for_bytes(&bytes);
        let mut inner = self.inner.write();
        if inner.data.contains_key(&id) {
            return (id, false);
        }
        inner.data.insert(id, Arc::from(bytes));
        inner.unsynced.insert(id);
        (id, true)
    }

    /// Store a value blob and return its id.
    pub fn add_object(&self, bytes: impl Into<Vec<u8>>) -> ObjectIdentifier {
        self.put(bytes.into()).0
    }

    pub fn get(&self, id: &ObjectIdentifier) -> Result<Arc<[u8]>> {
        self.inner
            .read()
            .data
            .get(id)
            .cloned()
            .ok_or_else(|| SioError::NotFound(format!("object {id}")))
    }

    #[must_use]
    pub fn contains(&self, id: &ObjectIdentifier) -> bool {
        self.inner.read().data.contains_key(id)
    }

    #[must_use]
    pub fn is_synced(&self, id: &ObjectIdentifier) -> bool {
        !self.inner.read().unsynced.contains(id)
    }

    /// Every object not yet marked synced.
    #[must_use]
    pub fn unsynced(&self) -> BTreeSet<ObjectIdentifier> {
        self.inner.read().unsynced.clone()
    }

    pub fn mark_synced<'a>(&self, ids: impl IntoIterator<Item = &'a ObjectIdentifier>) {
        let mut inner = self.inner.write();
        for id in ids {
            inner.unsynced.remove(id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent() {
        let store = ObjectStore::new();
        let (a, new_a) = store.put(b"value".to_vec());
        let (b, new_b) = store.put(b"value".to_vec());
        assert_eq!(a, b);
        assert!(new_a);
        assert!(!new_b);
        assert_eq!(store.len(), 1);
        assert_eq!(&*store.get(&a).unwrap(), b"value");
    }

    #[test]
    fn missing_object_is_not_found() {
        let store = ObjectStore::new();
        let id = ObjectIdentifier::for_bytes(b"nope");
        assert!(matches!(store.get(&id), Err(SioError::NotFound(_))));
    }

    #[test]
    fn sync_tracking() {
        let store = ObjectStore::new();
        let a = store.add_object("a");
        let b = store.add_object("b");
        assert_eq!(store.unsynced().len(), 2);
        store.mark_synced([&a]);
        assert!(store.is_synced(&a));
        assert!(!store.is_synced(&b));
        assert_eq!(store.unsynced().into_iter().collect::<Vec<_>>(), vec![b]);
    }
}

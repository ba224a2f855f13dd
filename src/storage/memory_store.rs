use super::{ArtifactHandle, ArtifactStore, StorageError};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory artifact store, used by tests and the fingerprint CLI.
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<ArtifactHandle, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of artifacts currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, bytes: &[u8]) -> Result<ArtifactHandle, StorageError> {
        let handle = ArtifactHandle::generate();
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.clone(), bytes.to_vec());
        Ok(handle)
    }

    fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(handle)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(handle.clone()))
    }

    fn delete(&self, handle: &ArtifactHandle) -> Result<(), StorageError> {
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(handle.clone()))
    }

    fn exists(&self, handle: &ArtifactHandle) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_delete() {
        let store = MemoryArtifactStore::new();
        let a = store.put(b"a").unwrap();
        let b = store.put(b"b").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);

        store.delete(&a).unwrap();
        assert!(matches!(store.get(&a), Err(StorageError::NotFound(_))));
        assert!(matches!(store.delete(&a), Err(StorageError::NotFound(_))));
        assert_eq!(store.get(&b).unwrap(), b"b");
    }
}

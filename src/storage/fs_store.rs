//! Filesystem-backed artifact store.

use super::{ArtifactHandle, ArtifactStore, StorageError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stores each artifact as a single file named after its handle.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, handle: &ArtifactHandle) -> Result<PathBuf, StorageError> {
        let name = handle.as_str();
        // Handles are generated uuids; anything path-like is rejected.
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StorageError::InvalidHandle(name.to_string()));
        }
        Ok(self.root.join(format!("{}.bin", name)))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, bytes: &[u8]) -> Result<ArtifactHandle, StorageError> {
        let handle = ArtifactHandle::generate();
        let path = self.path_for(&handle)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &path)?;
        debug!("Stored artifact {} ({} bytes)", handle, bytes.len());
        Ok(handle)
    }

    fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(handle)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(handle.clone()),
            _ => StorageError::Io(e),
        })
    }

    fn delete(&self, handle: &ArtifactHandle) -> Result<(), StorageError> {
        let path = self.path_for(handle)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(handle.clone()),
            _ => StorageError::Io(e),
        })?;
        debug!("Deleted artifact {}", handle);
        Ok(())
    }

    fn exists(&self, handle: &ArtifactHandle) -> bool {
        self.path_for(handle).map(|p| p.is_file()).unwrap_or(false)
    }
}

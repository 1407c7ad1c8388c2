use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use super::{BytesParameter, BytesResolver, ResolveError};

/// Blob storage addressed by id.
pub trait BlobStore: Send + Sync {
    fn stream_to(&self, id: &str, writer: &mut dyn Write) -> io::Result<()>;
}

/// Resolves bytes parameters by their `id` through a [`BlobStore`].
pub struct StoreResolver<S: BlobStore> {
    store: S,
}

impl<S: BlobStore> StoreResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: BlobStore> BytesResolver for StoreResolver<S> {
    fn resolve(&self, value: &BytesParameter, writer: &mut dyn Write) -> Result<(), ResolveError> {
        self.store
            .stream_to(&value.id, writer)
            .map_err(|e| ResolveError::Store {
                id: value.id.clone(),
                reason: e.to_string(),
            })
    }
}

/// Blobs kept as files named by id under one directory.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for DirectoryStore {
    fn stream_to(&self, id: &str, writer: &mut dyn Write) -> io::Result<()> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob id {:?}", id),
            ));
        }

        let mut blob = File::open(self.root.join(id))?;
        io::copy(&mut blob, writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn param(id: &str) -> BytesParameter {
        BytesParameter {
            kind: "store".to_string(),
            filename: "out.txt".to_string(),
            id: id.to_string(),
            content_type: None,
        }
    }

    #[test]
    fn test_directory_store_streams_blob() {
        let root = std::env::temp_dir().join(format!("blobs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("5cd2152c759cb4d72646a59a"), b"blob").unwrap();

        let resolver = StoreResolver::new(DirectoryStore::new(&root));
        let mut out = Vec::new();
        resolver
            .resolve(&param("5cd2152c759cb4d72646a59a"), &mut out)
            .unwrap();
        assert_eq!(out, b"blob");

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_blob() {
        let resolver = StoreResolver::new(DirectoryStore::new(std::env::temp_dir()));
        let err = resolver
            .resolve(&param(&uuid::Uuid::new_v4().to_string()), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, ResolveError::Store { .. }));
    }

    #[test]
    fn test_rejects_traversal_ids() {
        let resolver = StoreResolver::new(DirectoryStore::new(std::env::temp_dir()));
        let err = resolver.resolve(&param("../etc/passwd"), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, ResolveError::Store { .. }));
    }
}

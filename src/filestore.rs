//! Stores for files kept between requests, referenced by random ids.

mod local;
mod memory;
mod timeout;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::envexec::File;

pub use local::LocalFileStore;
pub use memory::MemoryFileStore;
pub use timeout::TimeoutFileStore;

pub trait FileStore: Send + Sync {
    /// Moves the file at `path` into the store, returns its id
    fn add(&self, name: &str, path: &Path) -> Result<String>;

    /// Returns the original name and a fresh handle on the content
    fn get(&self, id: &str) -> Option<(String, File)>;

    fn remove(&self, id: &str) -> bool;

    /// Every stored id with its name
    fn list(&self) -> HashMap<String, String>;

    /// Creates a scratch file to be filled and then passed to `add`
    fn new_file(&self) -> Result<(fs::File, PathBuf)>;
}

/// Writes `content` into a new store file and adds it under `name`
pub fn store_bytes(store: &dyn FileStore, name: &str, content: &[u8]) -> Result<String> {
    let (mut file, path) = store.new_file()?;
    if let Err(e) = file.write_all(content) {
        let _ = fs::remove_file(&path);
        return Err(e).with_context(|| format!("write store file {}", path.display()));
    }
    drop(file);
    store.add(name, &path)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use super::*;

    pub(super) fn read_all(file: File) -> Vec<u8> {
        let mut content = Vec::new();
        file.into_reader().unwrap().read_to_end(&mut content).unwrap();
        content
    }

    fn check_store(store: &dyn FileStore) {
        let id = store_bytes(store, "out.txt", b"stored").unwrap();
        assert_eq!(id.len(), 32);

        let (name, file) = store.get(&id).unwrap();
        assert_eq!(name, "out.txt");
        assert_eq!(read_all(file), b"stored");
        // every get opens a new handle
        assert_eq!(read_all(store.get(&id).unwrap().1), b"stored");

        assert_eq!(store.list().get(&id).map(String::as_str), Some("out.txt"));
        assert!(store.remove(&id));
        assert!(!store.remove(&id));
        assert!(store.get(&id).is_none());
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_memory_store() {
        check_store(&MemoryFileStore::new());
    }

    #[test]
    fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path()).unwrap();
        check_store(&store);
    }

    #[tokio::test]
    async fn test_timeout_store_forwards() {
        let inner: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let store = TimeoutFileStore::new(inner, std::time::Duration::from_secs(60));
        check_store(store.as_ref());
    }
}

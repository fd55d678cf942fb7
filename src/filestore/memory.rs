use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use super::{FileStore, new_id};
use crate::envexec::File;

/// Keeps file contents in memory
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<String, (String, Arc<[u8]>)>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Reader sharing the stored bytes instead of copying them
struct SharedBytes(Arc<[u8]>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FileStore for MemoryFileStore {
    fn add(&self, name: &str, path: &Path) -> Result<String> {
        let content = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        if let Err(e) = fs::remove_file(path) {
            log::warn!("Failed to remove {}: {e}", path.display());
        }
        let id = new_id();
        self.files
            .lock()
            .insert(id.clone(), (name.to_string(), content.into()));
        Ok(id)
    }

    fn get(&self, id: &str) -> Option<(String, File)> {
        let files = self.files.lock();
        let (name, content) = files.get(id)?;
        let reader = Cursor::new(SharedBytes(content.clone()));
        Some((name.clone(), File::reader(reader)))
    }

    fn remove(&self, id: &str) -> bool {
        self.files.lock().remove(id).is_some()
    }

    fn list(&self) -> HashMap<String, String> {
        self.files
            .lock()
            .iter()
            .map(|(id, (name, _))| (id.clone(), name.clone()))
            .collect()
    }

    fn new_file(&self) -> Result<(fs::File, PathBuf)> {
        let (file, path) = tempfile::Builder::new()
            .prefix("sandbox-exec-")
            .tempfile()
            .context("create store file")?
            .keep()
            .context("keep store file")?;
        Ok((file, path))
    }
}

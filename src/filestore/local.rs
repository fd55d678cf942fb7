use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use super::{FileStore, new_id};
use crate::envexec::File;

/// Keeps files in a host directory, named by their ids
pub struct LocalFileStore {
    dir: PathBuf,
    names: Mutex<HashMap<String, String>>,
}

impl LocalFileStore {
    /// Uses `dir` as storage, files already in it are not picked up
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create file store {}", dir.display()))?;
        log::info!("File store at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            names: Mutex::new(HashMap::new()),
        })
    }
}

impl FileStore for LocalFileStore {
    fn add(&self, name: &str, path: &Path) -> Result<String> {
        let id = new_id();
        let target = self.dir.join(&id);
        if fs::rename(path, &target).is_err() {
            // source on another file system
            fs::copy(path, &target).with_context(|| format!("copy {}", path.display()))?;
            let _ = fs::remove_file(path);
        }
        self.names.lock().insert(id.clone(), name.to_string());
        Ok(id)
    }

    fn get(&self, id: &str) -> Option<(String, File)> {
        let name = self.names.lock().get(id)?.clone();
        Some((name, File::Input(self.dir.join(id))))
    }

    fn remove(&self, id: &str) -> bool {
        if self.names.lock().remove(id).is_none() {
            return false;
        }
        if let Err(e) = fs::remove_file(self.dir.join(id)) {
            log::warn!("Failed to remove stored file {id}: {e}");
        }
        true
    }

    fn list(&self) -> HashMap<String, String> {
        self.names.lock().clone()
    }

    fn new_file(&self) -> Result<(fs::File, PathBuf)> {
        let (file, path) = tempfile::Builder::new()
            .prefix(".new-")
            .tempfile_in(&self.dir)
            .context("create store file")?
            .keep()
            .context("keep store file")?;
        Ok((file, path))
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::FileStore;
use crate::envexec::File;

/// Removes files from the wrapped store once they are older than the TTL
pub struct TimeoutFileStore {
    inner: Arc<dyn FileStore>,
    ttl: Duration,
    added: Mutex<HashMap<String, Instant>>,
}

impl TimeoutFileStore {
    pub fn new(inner: Arc<dyn FileStore>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            ttl,
            added: Mutex::new(HashMap::new()),
        })
    }

    /// Starts the background sweep, which ends with `token` or the store
    pub fn spawn_cleanup(self: &Arc<Self>, token: CancellationToken) {
        let store = Arc::downgrade(self);
        let period = (self.ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !sweep(&store) {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Removes every expired file, returns how many were removed
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut added = self.added.lock();
            let expired = added
                .iter()
                .filter(|(_, at)| now.duration_since(**at) >= self.ttl)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            for id in &expired {
                added.remove(id);
            }
            expired
        };
        for id in &expired {
            self.inner.remove(id);
        }
        if !expired.is_empty() {
            log::debug!("Removed {} expired files", expired.len());
        }
        expired.len()
    }
}

fn sweep(store: &Weak<TimeoutFileStore>) -> bool {
    match store.upgrade() {
        Some(store) => {
            store.remove_expired();
            true
        }
        None => false,
    }
}

impl FileStore for TimeoutFileStore {
    fn add(&self, name: &str, path: &Path) -> Result<String> {
        let id = self.inner.add(name, path)?;
        self.added.lock().insert(id.clone(), Instant::now());
        Ok(id)
    }

    fn get(&self, id: &str) -> Option<(String, File)> {
        self.inner.get(id)
    }

    fn remove(&self, id: &str) -> bool {
        self.added.lock().remove(id);
        self.inner.remove(id)
    }

    fn list(&self) -> HashMap<String, String> {
        self.inner.list()
    }

    fn new_file(&self) -> Result<(fs::File, PathBuf)> {
        self.inner.new_file()
    }
}

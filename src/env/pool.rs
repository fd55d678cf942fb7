use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::envexec::Environment;

/// Creates new environments on demand
pub trait EnvironmentBuilder: Send + Sync {
    fn build(&self) -> Result<Arc<dyn Environment>>;
}

/// Idle environments waiting for the next run
///
/// `get` prefers the most recently returned environment and builds a new
/// one when none is idle. `put` resets the environment before keeping it.
pub struct EnvironmentPool {
    builder: Box<dyn EnvironmentBuilder>,
    idle: Mutex<Vec<Arc<dyn Environment>>>,
}

impl EnvironmentPool {
    pub fn new(builder: impl EnvironmentBuilder + 'static) -> Self {
        Self {
            builder: Box::new(builder),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Result<Arc<dyn Environment>> {
        if let Some(env) = self.idle.lock().pop() {
            return Ok(env);
        }
        self.builder.build()
    }

    pub fn put(&self, env: Arc<dyn Environment>) {
        if let Err(e) = env.reset() {
            log::warn!("Failed to reset environment, discarding it: {e:#}");
            if let Err(e) = env.destroy() {
                log::warn!("Failed to destroy environment: {e:#}");
            }
            return;
        }
        self.idle.lock().push(env);
    }

    /// Destroys every idle environment
    pub fn shutdown(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        log::debug!("Destroying {} idle environments", idle.len());
        for env in idle {
            if let Err(e) = env.destroy() {
                log::warn!("Failed to destroy environment: {e:#}");
            }
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

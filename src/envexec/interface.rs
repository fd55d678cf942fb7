use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::cmd::{ExecveParam, RunnerResult, Usage};

/// A running execve inside an environment
#[async_trait]
pub trait Process: Send + Sync {
    /// Token cancelled once the process has exited and its result is final
    fn done(&self) -> CancellationToken;

    /// Waits until the process is done and returns its result.
    /// Calling it again after done returns the same result.
    async fn result(&self) -> RunnerResult;

    /// Resource usage sampled while the process runs
    fn usage(&self) -> Usage;
}

/// Decides whether a running process exceeded its time budget
#[async_trait]
pub trait Waiter: Send + Sync {
    /// Returns `true` when the limit is exceeded, `false` when the process
    /// finished or `ctx` was cancelled first.
    async fn wait(&self, ctx: CancellationToken, process: Arc<dyn Process>) -> bool;
}

/// One isolated execution context with a private work directory
///
/// An environment runs at most one execve at a time; pools hand out
/// exclusive instances.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn execve(
        &self,
        ctx: CancellationToken,
        param: ExecveParam,
    ) -> anyhow::Result<Arc<dyn Process>>;

    fn work_dir(&self) -> &Path;

    /// Opens a file at a work-dir relative path
    fn open(&self, path: &str, options: &OpenOptions) -> io::Result<fs::File> {
        options.open(resolve_in(self.work_dir(), path)?)
    }

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        fs::create_dir_all(resolve_in(self.work_dir(), path)?)
    }

    /// Creates `link` inside the work dir pointing at `target`
    fn symlink(&self, target: &str, link: &str) -> io::Result<()> {
        let link = resolve_in(self.work_dir(), link)?;
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, link)
    }

    /// Prepares the environment for reuse by the next run
    fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Joins a relative path onto `base`, refusing anything that would leave it
pub fn resolve_in(base: &Path, path: &str) -> io::Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir if depth > 0 => {
                resolved.pop();
                depth -= 1;
            }
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("path {path:?} escapes the work directory"),
                ));
            }
        }
    }
    if depth == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {path:?} does not name a file"),
        ));
    }
    Ok(resolved)
}

/// Completion state shared between a process handle and whoever reaps it
#[derive(Default)]
pub struct ProcessState {
    done: CancellationToken,
    result: Mutex<Option<RunnerResult>>,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the final result and wakes everyone waiting on `done`.
    /// Only the first call has an effect.
    pub fn finish(&self, result: RunnerResult) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            drop(slot);
            self.done.cancel();
        }
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub async fn result(&self) -> RunnerResult {
        self.done.cancelled().await;
        self.result.lock().clone().unwrap_or_default()
    }

    pub fn finished(&self) -> Option<RunnerResult> {
        self.result.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_in_rejects_escape() {
        let base = Path::new("/w");
        assert_eq!(resolve_in(base, "a/b.txt").unwrap(), PathBuf::from("/w/a/b.txt"));
        assert_eq!(resolve_in(base, "a/../c").unwrap(), PathBuf::from("/w/c"));
        assert!(resolve_in(base, "../etc/passwd").is_err());
        assert!(resolve_in(base, "/etc/passwd").is_err());
        assert!(resolve_in(base, ".").is_err());
    }

    #[tokio::test]
    async fn test_process_state_finishes_once() {
        let state = ProcessState::new();
        assert!(!state.done().is_cancelled());

        state.finish(RunnerResult {
            exit_status: 3,
            ..Default::default()
        });
        state.finish(RunnerResult {
            exit_status: 4,
            ..Default::default()
        });

        assert!(state.done().is_cancelled());
        assert_eq!(state.result().await.exit_status, 3);
        assert_eq!(state.result().await.exit_status, 3);
    }
}

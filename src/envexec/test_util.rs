use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::cmd::{ExecveParam, RunnerResult, Usage};
use super::interface::{Environment, Process, ProcessState};

/// Environment with a scratch work dir. It refuses to execute anything
/// unless built with a canned runner result.
pub(crate) struct TestEnvironment {
    dir: TempDir,
    finish_with: Option<RunnerResult>,
}

impl TestEnvironment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dir: tempfile::tempdir().unwrap(),
            finish_with: None,
        })
    }

    /// Every execve returns a process that already exited with `result`
    pub fn finishing(result: RunnerResult) -> Arc<Self> {
        Arc::new(Self {
            dir: tempfile::tempdir().unwrap(),
            finish_with: Some(result),
        })
    }
}

struct FinishedProcess(ProcessState);

#[async_trait]
impl Process for FinishedProcess {
    fn done(&self) -> CancellationToken {
        self.0.done()
    }

    async fn result(&self) -> RunnerResult {
        self.0.result().await
    }

    fn usage(&self) -> Usage {
        Usage::default()
    }
}

#[async_trait]
impl Environment for TestEnvironment {
    async fn execve(
        &self,
        _ctx: CancellationToken,
        _param: ExecveParam,
    ) -> anyhow::Result<Arc<dyn Process>> {
        let Some(result) = self.finish_with.clone() else {
            anyhow::bail!("test environment cannot execute")
        };
        let state = ProcessState::new();
        state.finish(result);
        Ok(Arc::new(FinishedProcess(state)))
    }

    fn work_dir(&self) -> &Path {
        self.dir.path()
    }
}

use tokio_util::sync::CancellationToken;

use super::cmd::{Cmd, ExecResult};
use super::prepare::prepare_cmd_fd;
use super::run::run_single;

/// Runs one command in its environment
pub struct Single {
    pub cmd: Cmd,
}

impl Single {
    pub fn new(cmd: Cmd) -> Self {
        Self { cmd }
    }

    /// Starts the command and returns its result
    ///
    /// An `Err` means the engine itself failed (fd preparation, execve
    /// plumbing); the caller reports it as `Internal Error`.
    pub async fn run(self, ctx: &CancellationToken) -> anyhow::Result<ExecResult> {
        let mut cmd = self.cmd;
        let count = cmd.files.len();
        let prepared = prepare_cmd_fd(&mut cmd, count)?;
        run_single(ctx, cmd, prepared).await
    }
}

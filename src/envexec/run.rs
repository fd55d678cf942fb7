use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::cmd::{ByteSize, Cmd, ExecResult, ExecveParam, Limit, RunnerResult};
use super::copy::{CopyOutRequest, copy_in, copy_out_and_collect, symlink};
use super::interface::{Environment, Process, Waiter};
use super::prepare::PreparedCmd;
use super::status::{RunnerStatus, Status};

/// Headroom added on top of the memory limit when none is given
pub const DEFAULT_EXTRA_MEMORY_LIMIT: ByteSize = ByteSize::kib(16);

/// Runs one prepared command inside its environment
///
/// Copy-in failures end the run early with `File Error`. Execution
/// statuses are always reported through the result, errors are reserved
/// for engine failures.
pub(crate) async fn run_single(
    ctx: &CancellationToken,
    mut cmd: Cmd,
    prepared: PreparedCmd,
) -> anyhow::Result<ExecResult> {
    let env = cmd.environment.clone();
    let PreparedCmd {
        fds,
        pipe_collectors,
        file_collectors,
    } = prepared;

    // copy in
    let copy_in_files = std::mem::take(&mut cmd.copy_in);
    if !copy_in_files.is_empty() {
        let file_error = copy_in(&env, copy_in_files).await;
        if let Some(first) = file_error.first() {
            return Ok(ExecResult {
                status: Status::FileError,
                error: first.to_string(),
                file_error,
                ..Default::default()
            });
        }
    }
    if let Err(e) = symlink(env.as_ref(), &cmd.symlinks) {
        return Ok(ExecResult {
            status: Status::FileError,
            error: e.to_string(),
            file_error: vec![e],
            ..Default::default()
        });
    }

    // run cmd and wait for result
    let param = execve_param(&mut cmd, fds);
    let rt = run_single_wait(ctx, &env, cmd.waiter.clone(), param).await;

    // collect result
    let collected = copy_out_and_collect(
        &env,
        CopyOutRequest {
            copy_out: std::mem::take(&mut cmd.copy_out),
            max: cmd.copy_out_max,
            truncate: cmd.copy_out_truncate,
            dir: cmd.copy_out_dir.take(),
            pipe_collectors,
            file_collectors,
        },
    )
    .await;

    let mut result = ExecResult {
        status: rt.status.into(),
        exit_status: rt.exit_status,
        error: rt.error,
        time: rt.time,
        run_time: rt.run_time,
        memory: rt.memory,
        files: collected.files,
        file_error: collected.file_error,
    };
    // collect errors only matter when the process exits normally
    if rt.status == RunnerStatus::Normal && result.error.is_empty() {
        if let Some(error) = collected.error {
            result.status = if collected.output_exceeded {
                Status::OutputLimitExceeded
            } else {
                Status::FileError
            };
            result.error = error;
        }
    }
    if !cmd.time_limit.is_zero() && result.time > cmd.time_limit {
        result.status = Status::TimeLimitExceeded;
    }
    if cmd.memory_limit.bytes() > 0 && result.memory > cmd.memory_limit {
        result.status = Status::MemoryLimitExceeded;
    }
    Ok(result)
}

fn execve_param(cmd: &mut Cmd, fds: Vec<Option<std::os::fd::OwnedFd>>) -> ExecveParam {
    let extra = if cmd.extra_memory_limit.bytes() == 0 {
        DEFAULT_EXTRA_MEMORY_LIMIT
    } else {
        cmd.extra_memory_limit
    };
    let memory = cmd.memory_limit + extra;
    let stack = cmd.stack_limit.min(memory);

    ExecveParam {
        args: std::mem::take(&mut cmd.args),
        env: std::mem::take(&mut cmd.env),
        files: fds,
        tty: cmd.tty,
        limit: Limit {
            time: cmd.time_limit,
            memory,
            proc: cmd.proc_limit,
            stack,
            output: cmd.output_limit,
            rate: cmd.cpu_rate_limit,
            open_file: cmd.open_file_limit,
            cpu_set: cmd.cpu_set_limit.clone(),
            strict_memory: cmd.strict_memory_limit,
        },
    }
}

/// Starts the process, races the waiter against its exit and returns the
/// runner result. The run is cancelled once the waiter returns.
async fn run_single_wait(
    ctx: &CancellationToken,
    env: &Arc<dyn Environment>,
    waiter: Option<Arc<dyn Waiter>>,
    param: ExecveParam,
) -> RunnerResult {
    let run_ctx = ctx.child_token();
    let _guard = run_ctx.clone().drop_guard();

    let program = param.args.first().cloned().unwrap_or_default();
    let process: Arc<dyn Process> = match env.execve(run_ctx.clone(), param).await {
        Ok(p) => p,
        Err(e) => {
            log::error!("execve {program:?} failed: {e:#}");
            return RunnerResult::runner_error(format!("{e:#}"));
        }
    };

    match waiter {
        Some(waiter) => {
            let waiter_ctx = run_ctx.clone();
            let waited = process.clone();
            tokio::spawn(async move {
                if waiter.wait(waiter_ctx.clone(), waited).await {
                    log::debug!("waiter reported time limit exceeded");
                }
                waiter_ctx.cancel();
            });
            run_ctx.cancelled().await;
        }
        None => {
            let done = process.done();
            tokio::select! {
                _ = done.cancelled() => {}
                _ = run_ctx.cancelled() => {}
            }
        }
    }
    process.result().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envexec::test_util::TestEnvironment;
    use std::time::Duration;

    #[test]
    fn test_execve_param_limits() {
        let env = TestEnvironment::new();
        let mut cmd = Cmd::new(env, vec!["prog".to_string()]);
        cmd.memory_limit = ByteSize::mib(1);
        cmd.stack_limit = ByteSize::mib(8);

        let param = execve_param(&mut cmd, Vec::new());
        assert_eq!(param.args, vec!["prog".to_string()]);
        assert_eq!(param.limit.memory, ByteSize::mib(1) + DEFAULT_EXTRA_MEMORY_LIMIT);
        assert_eq!(param.limit.stack, param.limit.memory);

        cmd.extra_memory_limit = ByteSize::kib(1);
        let param = execve_param(&mut cmd, Vec::new());
        assert_eq!(param.limit.memory, ByteSize::mib(1) + ByteSize::kib(1));
    }

    async fn run_finished(
        result: RunnerResult,
        time_limit: Duration,
        memory_limit: ByteSize,
    ) -> ExecResult {
        let env = TestEnvironment::finishing(result);
        let mut cmd = Cmd::new(env, vec!["prog".to_string()]);
        cmd.time_limit = time_limit;
        cmd.memory_limit = memory_limit;
        run_single(&CancellationToken::new(), cmd, PreparedCmd::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_normal_exit_within_limits_accepted() {
        let result = run_finished(
            RunnerResult {
                status: RunnerStatus::Normal,
                time: Duration::from_millis(50),
                memory: ByteSize::mib(1),
                ..Default::default()
            },
            Duration::from_secs(1),
            ByteSize::mib(64),
        )
        .await;
        assert_eq!(result.status, Status::Accepted);
        assert_eq!(result.time, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_normal_exit_over_time_limit() {
        let result = run_finished(
            RunnerResult {
                status: RunnerStatus::Normal,
                time: Duration::from_millis(1200),
                memory: ByteSize::mib(1),
                ..Default::default()
            },
            Duration::from_secs(1),
            ByteSize::mib(64),
        )
        .await;
        assert_eq!(result.status, Status::TimeLimitExceeded);
    }

    #[tokio::test]
    async fn test_signalled_over_memory_limit() {
        let result = run_finished(
            RunnerResult {
                status: RunnerStatus::Signalled,
                exit_status: 9,
                memory: ByteSize::mib(80),
                ..Default::default()
            },
            Duration::from_secs(1),
            ByteSize::mib(64),
        )
        .await;
        assert_eq!(result.status, Status::MemoryLimitExceeded);
    }

    #[tokio::test]
    async fn test_zero_limits_never_correct() {
        let result = run_finished(
            RunnerResult {
                status: RunnerStatus::Normal,
                time: Duration::from_secs(10),
                memory: ByteSize::mib(1024),
                ..Default::default()
            },
            Duration::ZERO,
            ByteSize(0),
        )
        .await;
        assert_eq!(result.status, Status::Accepted);
    }
}

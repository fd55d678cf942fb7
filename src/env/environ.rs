use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::cgroup::Cgroup;
use super::cgroup_pool::CgroupPool;
use super::container::{Container, ContainerParam, SyncFunc, rlimits_for};
use crate::envexec::{
    ByteSize, Environment, ExecveParam, Limit, Process, ProcessState, RunnerResult, RunnerStatus,
    Usage,
};

/// Cgroup settings shared by every environment
#[derive(Debug, Clone, Default)]
pub struct EnvironConfig {
    /// Default cpuset when the request does not name one
    pub cpuset: String,
    pub enable_cpu_rate: bool,
    pub cpu_cfs_period: Duration,
}

/// [`Environment`] running programs in a [`Container`], accounted through
/// a cgroup when a cgroup pool is configured
pub struct Environ {
    id: usize,
    container: Arc<dyn Container>,
    cgroups: Option<Arc<dyn CgroupPool>>,
    config: EnvironConfig,
}

impl Environ {
    pub fn new(
        id: usize,
        container: Arc<dyn Container>,
        cgroups: Option<Arc<dyn CgroupPool>>,
        config: EnvironConfig,
    ) -> Self {
        Self {
            id,
            container,
            cgroups,
            config,
        }
    }

    fn apply_limits(&self, cgroup: &dyn Cgroup, limit: &Limit) -> Result<()> {
        let cpuset = if limit.cpu_set.is_empty() {
            &self.config.cpuset
        } else {
            &limit.cpu_set
        };
        if !cpuset.is_empty() {
            ignore_missing(cgroup.set_cpuset(cpuset)).context("set cpuset")?;
        }
        if self.config.enable_cpu_rate && limit.rate > 0 {
            ignore_missing(cgroup.set_cpu_rate(limit.rate, self.config.cpu_cfs_period))
                .context("set cpu rate")?;
        }
        if limit.memory.bytes() > 0 {
            ignore_missing(cgroup.set_memory_limit(limit.memory)).context("set memory limit")?;
        }
        if limit.proc > 0 {
            ignore_missing(cgroup.set_proc_limit(limit.proc)).context("set proc limit")?;
        }
        Ok(())
    }
}

/// Controllers not enabled on the host leave their files missing
fn ignore_missing(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

/// Replaces rusage figures with cgroup accounting, which covers every
/// process of the run
fn apply_cgroup_usage(cgroup: &dyn Cgroup, result: &mut RunnerResult) {
    if result.status == RunnerStatus::RunnerError {
        return;
    }
    if let Ok(time) = cgroup.cpu_usage() {
        result.time = time;
    }
    if let Ok(memory) = cgroup.memory_peak() {
        result.memory = memory;
    }
    if cgroup.oom_killed().unwrap_or(false) {
        result.status = RunnerStatus::MemoryLimitExceeded;
    }
}

#[async_trait]
impl Environment for Environ {
    async fn execve(&self, ctx: CancellationToken, param: ExecveParam) -> Result<Arc<dyn Process>> {
        let cgroup = match &self.cgroups {
            Some(pool) => {
                let getter = pool.clone();
                let cgroup = tokio::task::spawn_blocking(move || getter.get())
                    .await
                    .context("get cgroup")??;
                if let Err(e) = self.apply_limits(cgroup.as_ref(), &param.limit) {
                    pool.put(cgroup);
                    return Err(e);
                }
                Some(cgroup)
            }
            None => None,
        };

        let state = Arc::new(ProcessState::new());
        let pid = Arc::new(AtomicU32::new(0));
        let (started_tx, started_rx) = oneshot::channel();
        let sync: SyncFunc = {
            let (cgroup, pid, id) = (cgroup.clone(), pid.clone(), self.id);
            Box::new(move |new_pid| {
                if let Some(cgroup) = &cgroup {
                    cgroup.add_proc(new_pid)?;
                    log::debug!("Environ {id} attached pid {new_pid} to cgroup");
                }
                pid.store(new_pid, Ordering::SeqCst);
                let _ = started_tx.send(());
                Ok(())
            })
        };

        let container_param = ContainerParam {
            rlimits: rlimits_for(&param.limit, cgroup.is_some()),
            args: param.args,
            env: param.env,
            files: param.files,
            tty: param.tty,
            sync: Some(sync),
        };

        let runner = {
            let (container, state) = (self.container.clone(), state.clone());
            let (cgroup, pool) = (cgroup.clone(), self.cgroups.clone());
            tokio::task::spawn_blocking(move || {
                let mut result = container.execve(ctx, container_param);
                if let (Some(cgroup), Some(pool)) = (cgroup, pool) {
                    apply_cgroup_usage(cgroup.as_ref(), &mut result);
                    pool.put(cgroup);
                }
                state.finish(result);
            })
        };
        let watched = state.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.await {
                log::error!("Container task failed: {e}");
                watched.finish(RunnerResult::runner_error(format!("container task failed: {e}")));
            }
        });

        // the process either started or never will
        let done = state.done();
        tokio::select! {
            _ = started_rx => {}
            _ = done.cancelled() => {}
        }

        Ok(Arc::new(EnvironProcess { state, pid, cgroup }))
    }

    fn work_dir(&self) -> &Path {
        self.container.work_dir()
    }

    fn reset(&self) -> Result<()> {
        self.container.reset()
    }

    fn destroy(&self) -> Result<()> {
        self.container.destroy()
    }
}

struct EnvironProcess {
    state: Arc<ProcessState>,
    pid: Arc<AtomicU32>,
    cgroup: Option<Arc<dyn Cgroup>>,
}

#[async_trait]
impl Process for EnvironProcess {
    fn done(&self) -> CancellationToken {
        self.state.done()
    }

    async fn result(&self) -> RunnerResult {
        self.state.result().await
    }

    fn usage(&self) -> Usage {
        if let Some(result) = self.state.finished() {
            return Usage {
                time: result.time,
                memory: result.memory,
            };
        }
        match &self.cgroup {
            Some(cgroup) => Usage {
                time: cgroup.cpu_usage().unwrap_or_default(),
                memory: cgroup.memory_current().unwrap_or_default(),
            },
            None => match self.pid.load(Ordering::SeqCst) {
                0 => Usage::default(),
                pid => proc_stat_usage(pid).unwrap_or_default(),
            },
        }
    }
}

/// Reads cpu time and resident memory from `/proc/<pid>/stat`
fn proc_stat_usage(pid: u32) -> io::Result<Usage> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    parse_proc_stat(&stat).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat"))
}

fn parse_proc_stat(stat: &str) -> Option<Usage> {
    // the command name may contain spaces, fields start after its ')'
    let fields: Vec<&str> = stat.get(stat.rfind(')')? + 1..)?.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss: u64 = fields.get(21)?.parse().ok()?;

    // SAFETY: sysconf has no memory safety preconditions
    let (ticks, page) = unsafe { (libc::sysconf(libc::_SC_CLK_TCK), libc::sysconf(libc::_SC_PAGESIZE)) };
    let ticks = u64::try_from(ticks).ok().filter(|t| *t > 0)?;
    let page = u64::try_from(page).ok()?;
    Some(Usage {
        time: Duration::from_nanos((utime + stime) * 1_000_000_000 / ticks),
        memory: ByteSize(rss * page),
    })
}

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::envexec::{ByteSize, Limit, RunnerResult};

/// Called with the pid of the new process after it is created and
/// before it executes the program
pub type SyncFunc = Box<dyn FnOnce(u32) -> io::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitKind {
    Cpu,
    Data,
    FileSize,
    Stack,
    OpenFiles,
    Core,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub kind: RlimitKind,
    pub cur: u64,
    pub max: u64,
}

impl Rlimit {
    fn new(kind: RlimitKind, value: u64) -> Self {
        Self {
            kind,
            cur: value,
            max: value,
        }
    }
}

/// Builds the rlimit set for one execve
///
/// The cpu limit is the time limit rounded up plus one second, letting the
/// waiter report the precise overrun. The data segment is only limited
/// when strict memory is requested or no cgroup enforces memory.
pub fn rlimits_for(limit: &Limit, has_cgroup: bool) -> Vec<Rlimit> {
    let mut rlimits = Vec::new();
    if !limit.time.is_zero() {
        let secs = limit.time.as_secs() + u64::from(limit.time.subsec_nanos() > 0);
        rlimits.push(Rlimit {
            kind: RlimitKind::Cpu,
            cur: secs + 1,
            max: secs + 2,
        });
    }
    if limit.memory.bytes() > 0 && (limit.strict_memory || !has_cgroup) {
        rlimits.push(Rlimit::new(RlimitKind::Data, limit.memory.bytes()));
    }
    if limit.output.bytes() > 0 {
        rlimits.push(Rlimit::new(RlimitKind::FileSize, limit.output.bytes()));
    }
    if limit.stack.bytes() > 0 {
        rlimits.push(Rlimit::new(RlimitKind::Stack, limit.stack.bytes()));
    }
    if limit.open_file > 0 {
        rlimits.push(Rlimit::new(RlimitKind::OpenFiles, limit.open_file));
    }
    rlimits.push(Rlimit::new(RlimitKind::Core, 0));
    rlimits
}

/// Parameters of one blocking container execve
pub struct ContainerParam {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub files: Vec<Option<OwnedFd>>,
    pub tty: bool,
    pub rlimits: Vec<Rlimit>,
    pub sync: Option<SyncFunc>,
}

impl fmt::Debug for ContainerParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerParam")
            .field("args", &self.args)
            .field("files", &self.files)
            .field("tty", &self.tty)
            .field("rlimits", &self.rlimits)
            .finish_non_exhaustive()
    }
}

/// Primitive that runs a program in isolation and reports how it ended
///
/// `execve` blocks until the program and its session are gone. Cancelling
/// `ctx` kills the program.
pub trait Container: Send + Sync {
    fn execve(&self, ctx: CancellationToken, param: ContainerParam) -> RunnerResult;

    fn work_dir(&self) -> &Path;

    /// Clears the work dir for the next run
    fn reset(&self) -> anyhow::Result<()>;

    fn destroy(&self) -> anyhow::Result<()>;
}

/// Usage read from the rusage of a reaped child
pub(crate) fn rusage_usage(ru: &libc::rusage) -> (Duration, ByteSize) {
    let tv = |t: libc::timeval| Duration::new(t.tv_sec as u64, (t.tv_usec as u32) * 1000);
    let time = tv(ru.ru_utime) + tv(ru.ru_stime);
    let memory = ByteSize((ru.ru_maxrss as u64) << 10);
    (time, memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlimits_for() {
        let limit = Limit {
            time: Duration::from_millis(1500),
            memory: ByteSize::mib(64),
            output: ByteSize::mib(1),
            open_file: 32,
            ..Default::default()
        };
        let rlimits = rlimits_for(&limit, true);
        assert_eq!(
            rlimits[0],
            Rlimit {
                kind: RlimitKind::Cpu,
                cur: 3,
                max: 4
            }
        );
        assert!(!rlimits.iter().any(|r| r.kind == RlimitKind::Data));
        assert!(rlimits.contains(&Rlimit::new(RlimitKind::OpenFiles, 32)));

        let rlimits = rlimits_for(&limit, false);
        assert!(rlimits.contains(&Rlimit::new(RlimitKind::Data, 64 << 20)));
    }
}

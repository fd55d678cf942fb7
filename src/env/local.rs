use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::envexec::{RunnerResult, RunnerStatus, os_pipe};

use super::container::{Container, ContainerParam, Rlimit, RlimitKind, rusage_usage};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// A container that runs programs as plain host processes
///
/// Each instance owns a private work directory. Programs get their own
/// session, fd table and rlimits, but share the host file system and
/// namespaces. Use only with trusted programs.
pub struct LocalContainer {
    /// Unique identifier for this instance
    id: usize,
    /// Path of the private work directory
    work_dir: PathBuf,
    dir: Mutex<Option<TempDir>>,
}

impl LocalContainer {
    pub fn build(id: usize, base: &Path) -> Result<Self> {
        fs::create_dir_all(base)
            .with_context(|| format!("create work dir base {}", base.display()))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("env-{id}-"))
            .tempdir_in(base)
            .context("create work dir")?;
        let work_dir = dir.path().to_path_buf();

        log::debug!("LocalContainer {id} initialized at {}", work_dir.display());
        Ok(Self {
            id,
            work_dir,
            dir: Mutex::new(Some(dir)),
        })
    }

    fn spawn(&self, ctx: CancellationToken, param: ContainerParam) -> Result<RunnerResult> {
        let ContainerParam {
            args,
            env,
            files,
            tty,
            rlimits,
            sync,
        } = param;

        let exec = ExecImage::new(&self.work_dir, &args, &env, files, tty, rlimits)?;
        let (sync_r, sync_w) = os_pipe().context("create sync pipe")?;
        let (err_r, err_w) = os_pipe().context("create error pipe")?;
        let mut moved = vec![-1 as RawFd; exec.fds.len()];

        let start = Instant::now();
        // SAFETY: the child only runs async-signal-safe code on memory
        // prepared before the fork, then either execs or exits
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error()).context("fork");
        }
        if pid == 0 {
            // SAFETY: see above, this never returns
            unsafe { exec.child(sync_r.as_raw_fd(), err_w.as_raw_fd(), &mut moved) }
        }

        // the program holds its own copies now
        drop(exec);
        drop((sync_r, err_w));

        if let Some(sync) = sync {
            if let Err(e) = sync(pid as u32) {
                kill_session(pid);
                drop(sync_w);
                reap(pid);
                return Err(e).context("sync new process");
            }
        }
        (&sync_w).write_all(&[0]).context("start new process")?;
        drop(sync_w);

        let mut errno = Vec::new();
        (&err_r).read_to_end(&mut errno).context("read exec status")?;
        if let Ok(bytes) = <[u8; 4]>::try_from(errno.as_slice()) {
            reap(pid);
            let err = io::Error::from_raw_os_error(i32::from_ne_bytes(bytes));
            return Err(anyhow!("execve {:?}: {err}", args.first()));
        }

        let exited = CancellationToken::new();
        let killed = Arc::new(AtomicBool::new(false));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (exited, killed) = (exited.clone(), killed.clone());
                handle.spawn(async move {
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            killed.store(true, Ordering::SeqCst);
                            kill_session(pid);
                        }
                        _ = exited.cancelled() => {}
                    }
                });
            }
            Err(_) => log::warn!("LocalContainer {}: no runtime, run cannot be cancelled", self.id),
        }

        // the pid stays a zombie until reaped, so the session id cannot be
        // reused before the leftover background processes are killed
        let waited = wait_exited(pid);
        exited.cancel();
        let run_time = start.elapsed();
        kill_session(pid);
        waited.context("waitid")?;

        let (status, ru) = wait4(pid).context("wait4")?;
        let (time, memory) = rusage_usage(&ru);
        let mut result = RunnerResult {
            time,
            run_time,
            memory,
            ..Default::default()
        };
        if libc::WIFEXITED(status) {
            result.exit_status = libc::WEXITSTATUS(status);
            result.status = if result.exit_status == 0 {
                RunnerStatus::Normal
            } else {
                RunnerStatus::NonzeroExitStatus
            };
        } else if libc::WIFSIGNALED(status) {
            let signal = libc::WTERMSIG(status);
            result.exit_status = signal;
            result.status = match signal {
                libc::SIGXCPU => RunnerStatus::TimeLimitExceeded,
                libc::SIGXFSZ => RunnerStatus::OutputLimitExceeded,
                libc::SIGKILL if killed.load(Ordering::SeqCst) => RunnerStatus::TimeLimitExceeded,
                _ => RunnerStatus::Signalled,
            };
            result.error = format!("signal: {signal}");
        }
        Ok(result)
    }
}

impl Container for LocalContainer {
    fn execve(&self, ctx: CancellationToken, param: ContainerParam) -> RunnerResult {
        match self.spawn(ctx, param) {
            Ok(result) => result,
            Err(e) => {
                log::error!("LocalContainer {} execve failed: {e:#}", self.id);
                RunnerResult::runner_error(format!("{e:#}"))
            }
        }
    }

    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn reset(&self) -> Result<()> {
        for entry in fs::read_dir(&self.work_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        if let Some(dir) = self.dir.lock().take() {
            dir.close()
                .with_context(|| format!("remove work dir {}", self.work_dir.display()))?;
        }
        Ok(())
    }
}

/// Everything the forked child needs, prepared before the fork
struct ExecImage {
    path: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: CString,
    fds: Vec<RawFd>,
    _owned: Vec<OwnedFd>,
    rlimits: Vec<Rlimit>,
    tty: bool,
}

fn cstring(s: impl AsRef<[u8]>) -> Result<CString> {
    CString::new(s.as_ref()).map_err(|e| anyhow!("invalid argument: {e}"))
}

impl ExecImage {
    fn new(
        work_dir: &Path,
        args: &[String],
        env: &[String],
        files: Vec<Option<OwnedFd>>,
        tty: bool,
        rlimits: Vec<Rlimit>,
    ) -> Result<Self> {
        let program = args.first().ok_or_else(|| anyhow!("empty args"))?;
        let path = find_program(work_dir, program, env)
            .ok_or_else(|| anyhow!("executable file not found: {program}"))?;

        let argv = args.iter().map(cstring).collect::<Result<Vec<_>>>()?;
        let envp = env.iter().map(cstring).collect::<Result<Vec<_>>>()?;
        let argv_ptrs = argv.iter().map(|s| s.as_ptr()).chain([std::ptr::null()]).collect();
        let envp_ptrs = envp.iter().map(|s| s.as_ptr()).chain([std::ptr::null()]).collect();

        // stdio slots left empty read from / write to /dev/null
        let mut owned: Vec<OwnedFd> = Vec::new();
        let mut fds = Vec::with_capacity(files.len().max(3));
        let count = files.len().max(3);
        let mut files = files.into_iter();
        for fd in 0..count {
            match files.next().flatten() {
                Some(f) => {
                    fds.push(f.as_raw_fd());
                    owned.push(f);
                }
                None if fd < 3 => {
                    let null = fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open("/dev/null")
                        .context("open /dev/null")?;
                    let null = OwnedFd::from(null);
                    fds.push(null.as_raw_fd());
                    owned.push(null);
                }
                None => fds.push(-1),
            }
        }

        Ok(Self {
            path: cstring(path.as_os_str().as_bytes())?,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            cwd: cstring(work_dir.as_os_str().as_bytes())?,
            fds,
            _owned: owned,
            rlimits,
            tty,
        })
    }

    /// Child side of the fork: wait for the parent, set up the process
    /// and exec. Any failure is reported as errno through `err_fd`.
    unsafe fn child(&self, sync_fd: RawFd, err_fd: RawFd, moved: &mut [RawFd]) -> ! {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);

            let mut byte = 0u8;
            loop {
                let n = libc::read(sync_fd, (&mut byte as *mut u8).cast(), 1);
                if n == 1 {
                    break;
                }
                if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                libc::_exit(126);
            }

            let count = self.fds.len() as libc::c_int;
            let err_fd = libc::fcntl(err_fd, libc::F_DUPFD_CLOEXEC, count);
            if err_fd < 0 || libc::setsid() < 0 {
                fail(err_fd);
            }

            // move every source above the table so dup2 cannot clobber one
            for (i, &fd) in self.fds.iter().enumerate() {
                if fd >= 0 {
                    moved[i] = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, count);
                    if moved[i] < 0 {
                        fail(err_fd);
                    }
                }
            }
            for (i, &fd) in moved.iter().enumerate() {
                let target = i as libc::c_int;
                if fd >= 0 {
                    if libc::dup2(fd, target) < 0 {
                        fail(err_fd);
                    }
                } else {
                    libc::close(target);
                }
            }

            if self.tty {
                for i in 0..count {
                    if libc::isatty(i) == 1 {
                        if libc::ioctl(i, libc::TIOCSCTTY, 0) < 0 {
                            fail(err_fd);
                        }
                        break;
                    }
                }
            }

            if libc::chdir(self.cwd.as_ptr()) < 0 {
                fail(err_fd);
            }
            for r in &self.rlimits {
                let rl = libc::rlimit {
                    rlim_cur: r.cur as libc::rlim_t,
                    rlim_max: r.max as libc::rlim_t,
                };
                if set_rlimit(r.kind, &rl) < 0 {
                    fail(err_fd);
                }
            }

            libc::execve(self.path.as_ptr(), self.argv_ptrs.as_ptr(), self.envp_ptrs.as_ptr());
            fail(err_fd)
        }
    }
}

unsafe fn set_rlimit(kind: RlimitKind, rl: &libc::rlimit) -> libc::c_int {
    unsafe {
        match kind {
            RlimitKind::Cpu => libc::setrlimit(libc::RLIMIT_CPU, rl),
            RlimitKind::Data => libc::setrlimit(libc::RLIMIT_DATA, rl),
            RlimitKind::FileSize => libc::setrlimit(libc::RLIMIT_FSIZE, rl),
            RlimitKind::Stack => libc::setrlimit(libc::RLIMIT_STACK, rl),
            RlimitKind::OpenFiles => libc::setrlimit(libc::RLIMIT_NOFILE, rl),
            RlimitKind::Core => libc::setrlimit(libc::RLIMIT_CORE, rl),
        }
    }
}

/// Reports errno to the parent and exits the child
unsafe fn fail(err_fd: RawFd) -> ! {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL);
    let bytes = errno.to_ne_bytes();
    unsafe {
        if err_fd >= 0 {
            libc::write(err_fd, bytes.as_ptr().cast(), bytes.len());
        }
        libc::_exit(127)
    }
}

/// Looks `program` up the way execvp does, using PATH from the program env
fn find_program(work_dir: &Path, program: &str, env: &[String]) -> Option<PathBuf> {
    if program.contains('/') {
        let path = work_dir.join(program);
        return path.exists().then_some(path);
    }
    let search = env
        .iter()
        .find_map(|e| e.strip_prefix("PATH="))
        .unwrap_or(DEFAULT_PATH);
    search
        .split(':')
        .map(|dir| work_dir.join(if dir.is_empty() { "." } else { dir }).join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

fn kill_session(pid: libc::pid_t) {
    // SAFETY: signalling a process group has no memory safety concerns
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

fn reap(pid: libc::pid_t) {
    let _ = wait4(pid);
}

/// Blocks until `pid` exits, leaving it waitable
fn wait_exited(pid: libc::pid_t) -> io::Result<()> {
    // SAFETY: siginfo is plain data, zero is a valid bit pattern
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: the out pointer is valid for the duration of the call
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn wait4(pid: libc::pid_t) -> io::Result<(libc::c_int, libc::rusage)> {
    let mut status = 0;
    // SAFETY: rusage is plain data, zero is a valid bit pattern
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: out pointers are valid for the duration of the call
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut ru) };
        if ret == pid {
            return Ok((status, ru));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_program_uses_env_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();
        let prog = bin.join("tool");
        fs::write(&prog, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&prog, fs::Permissions::from_mode(0o755)).unwrap();

        let env = vec![format!("PATH={}", bin.display())];
        assert_eq!(find_program(dir.path(), "tool", &env), Some(prog));
        assert_eq!(find_program(dir.path(), "missing", &env), None);
        assert_eq!(
            find_program(dir.path(), "/bin/sh", &[]),
            Some(PathBuf::from("/bin/sh"))
        );
    }

    #[test]
    fn test_reset_and_destroy_work_dir() {
        let base = tempfile::tempdir().unwrap();
        let container = LocalContainer::build(0, base.path()).unwrap();
        let work_dir = container.work_dir().to_path_buf();
        fs::create_dir(work_dir.join("sub")).unwrap();
        fs::write(work_dir.join("sub/a"), b"a").unwrap();
        fs::write(work_dir.join("b"), b"b").unwrap();

        container.reset().unwrap();
        assert_eq!(fs::read_dir(&work_dir).unwrap().count(), 0);

        container.destroy().unwrap();
        assert!(!work_dir.exists());
        container.destroy().unwrap();
    }
}

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::envexec::ByteSize;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CONTROLLERS: &str = "+cpu +cpuset +memory +pids";

/// Resource limiting and accounting for the processes of one run
pub trait Cgroup: Send + Sync {
    fn set_cpuset(&self, cpus: &str) -> io::Result<()>;

    /// Limits cpu usage to `rate` thousandths of a core over `period`
    fn set_cpu_rate(&self, rate: u64, period: Duration) -> io::Result<()>;

    fn set_memory_limit(&self, limit: ByteSize) -> io::Result<()>;

    fn set_proc_limit(&self, limit: u64) -> io::Result<()>;

    /// Cpu time used since the last reset
    fn cpu_usage(&self) -> io::Result<Duration>;

    /// Peak memory since the last reset
    fn memory_peak(&self) -> io::Result<ByteSize>;

    fn memory_current(&self) -> io::Result<ByteSize>;

    /// Whether the OOM killer fired since the last reset
    fn oom_killed(&self) -> io::Result<bool>;

    fn add_proc(&self, pid: u32) -> io::Result<()>;

    /// Prepares the cgroup for the next run
    fn reset(&self) -> io::Result<()>;

    /// Kills what is left and removes the cgroup, only the first call acts
    fn destroy(&self) -> io::Result<()>;
}

/// Whether the unified cgroup hierarchy is mounted
pub fn cgroup_v2_available() -> bool {
    Path::new(CGROUP_ROOT).join("cgroup.controllers").exists()
}

/// Creates `/sys/fs/cgroup/<prefix>` and enables the controllers for its
/// children. Failing to enable a controller is only logged.
pub fn ensure_prefix(prefix: &str) -> Result<PathBuf> {
    let root = Path::new(CGROUP_ROOT);
    let dir = root.join(prefix);
    fs::create_dir_all(&dir).with_context(|| format!("create cgroup {}", dir.display()))?;
    for parent in [root, dir.as_path()] {
        if let Err(e) = fs::write(parent.join("cgroup.subtree_control"), CONTROLLERS) {
            log::warn!("Failed to enable controllers in {}: {e}", parent.display());
        }
    }
    Ok(dir)
}

/// Cgroup v2 directory owned by one pooled slot
#[derive(Debug)]
pub struct CgroupV2 {
    path: PathBuf,
    cpu_base: AtomicU64,
    oom_base: AtomicU64,
    destroyed: AtomicBool,
}

impl CgroupV2 {
    /// Creates a fresh cgroup with a random name under `parent`
    pub fn new(parent: &Path) -> Result<Self> {
        let path = parent.join(uuid::Uuid::new_v4().simple().to_string());
        fs::create_dir(&path).with_context(|| format!("create cgroup {}", path.display()))?;
        log::debug!("Created cgroup {}", path.display());
        Ok(Self {
            path,
            cpu_base: AtomicU64::new(0),
            oom_base: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &str, content: &str) -> io::Result<()> {
        fs::write(self.path.join(file), content)
    }

    fn read(&self, file: &str) -> io::Result<String> {
        fs::read_to_string(self.path.join(file))
    }

    fn read_u64(&self, file: &str) -> io::Result<u64> {
        parse_u64(self.read(file)?.trim())
    }

    /// Reads one `key value` line of a flat keyed file such as `cpu.stat`
    fn read_key(&self, file: &str, key: &str) -> io::Result<u64> {
        let content = self.read(file)?;
        let value = content
            .lines()
            .find_map(|line| line.strip_prefix(key)?.strip_prefix(' '))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{file}: no {key}")))?;
        parse_u64(value.trim())
    }

    fn raw_cpu_usec(&self) -> io::Result<u64> {
        self.read_key("cpu.stat", "usage_usec")
    }

    fn raw_oom_kills(&self) -> io::Result<u64> {
        self.read_key("memory.events", "oom_kill")
    }
}

fn parse_u64(s: &str) -> io::Result<u64> {
    s.parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("parse {s:?}: {e}")))
}

/// `cpu.max` content for a rate in thousandths of a core
pub(crate) fn cpu_max(rate: u64, period: Duration) -> String {
    let period_us = period.as_micros() as u64;
    let quota = period_us * rate / 1000;
    format!("{quota} {period_us}")
}

impl Cgroup for CgroupV2 {
    fn set_cpuset(&self, cpus: &str) -> io::Result<()> {
        self.write("cpuset.cpus", cpus)
    }

    fn set_cpu_rate(&self, rate: u64, period: Duration) -> io::Result<()> {
        self.write("cpu.max", &cpu_max(rate, period))
    }

    fn set_memory_limit(&self, limit: ByteSize) -> io::Result<()> {
        self.write("memory.max", &limit.bytes().to_string())
    }

    fn set_proc_limit(&self, limit: u64) -> io::Result<()> {
        self.write("pids.max", &limit.to_string())
    }

    fn cpu_usage(&self) -> io::Result<Duration> {
        let usec = self.raw_cpu_usec()?;
        let base = self.cpu_base.load(Ordering::Relaxed);
        Ok(Duration::from_micros(usec.saturating_sub(base)))
    }

    fn memory_peak(&self) -> io::Result<ByteSize> {
        // memory.peak is missing before Linux 5.19
        match self.read_u64("memory.peak") {
            Ok(peak) => Ok(ByteSize(peak)),
            Err(_) => self.memory_current(),
        }
    }

    fn memory_current(&self) -> io::Result<ByteSize> {
        self.read_u64("memory.current").map(ByteSize)
    }

    fn oom_killed(&self) -> io::Result<bool> {
        let kills = self.raw_oom_kills()?;
        Ok(kills > self.oom_base.load(Ordering::Relaxed))
    }

    fn add_proc(&self, pid: u32) -> io::Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    fn reset(&self) -> io::Result<()> {
        self.cpu_base.store(self.raw_cpu_usec()?, Ordering::Relaxed);
        self.oom_base.store(self.raw_oom_kills().unwrap_or(0), Ordering::Relaxed);
        // missing before Linux 5.19, read only before 6.12; a peak that
        // cannot be reset would leak into the next run
        match fs::OpenOptions::new().write(true).open(self.path.join("memory.peak")) {
            Ok(mut f) => f.write_all(b"reset"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn destroy(&self) -> io::Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.write("cgroup.kill", "1");
        let mut last = Ok(());
        for _ in 0..10 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                // killed processes may take a moment to leave
                Err(e) => last = Err(e),
            }
            thread::sleep(Duration::from_millis(10));
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_max() {
        assert_eq!(cpu_max(1000, Duration::from_millis(100)), "100000 100000");
        assert_eq!(cpu_max(500, Duration::from_millis(100)), "50000 100000");
    }

    /// A directory mimicking the cgroup interface files
    fn fake_cgroup() -> (tempfile::TempDir, CgroupV2) {
        let dir = tempfile::tempdir().unwrap();
        let cg = CgroupV2::new(dir.path()).unwrap();
        fs::write(cg.path().join("cpu.stat"), "usage_usec 1500\nuser_usec 1000\n").unwrap();
        fs::write(cg.path().join("memory.current"), "4096\n").unwrap();
        fs::write(cg.path().join("memory.events"), "low 0\noom 1\noom_kill 1\n").unwrap();
        (dir, cg)
    }

    #[test]
    fn test_usage_rebased_on_reset() {
        let (_dir, cg) = fake_cgroup();
        assert_eq!(cg.cpu_usage().unwrap(), Duration::from_micros(1500));
        assert_eq!(cg.memory_peak().unwrap(), ByteSize(4096));
        assert!(cg.oom_killed().unwrap());

        cg.reset().unwrap();
        assert_eq!(cg.cpu_usage().unwrap(), Duration::ZERO);
        assert!(!cg.oom_killed().unwrap());

        fs::write(cg.path().join("cpu.stat"), "usage_usec 2500\n").unwrap();
        assert_eq!(cg.cpu_usage().unwrap(), Duration::from_millis(1));
    }

    #[test]
    fn test_limits_written() {
        let (_dir, cg) = fake_cgroup();
        cg.set_memory_limit(ByteSize::mib(1)).unwrap();
        cg.set_proc_limit(4).unwrap();
        assert_eq!(fs::read_to_string(cg.path().join("memory.max")).unwrap(), "1048576");
        assert_eq!(fs::read_to_string(cg.path().join("pids.max")).unwrap(), "4");
    }

    #[test]
    fn test_reset_clears_memory_peak() {
        let (_dir, cg) = fake_cgroup();
        fs::write(cg.path().join("memory.peak"), "").unwrap();
        cg.reset().unwrap();
        assert_eq!(fs::read_to_string(cg.path().join("memory.peak")).unwrap(), "reset");
    }

    #[test]
    fn test_reset_fails_when_peak_not_resettable() {
        let (_dir, cg) = fake_cgroup();
        // a directory refuses the write the way a read only peak file does
        fs::create_dir(cg.path().join("memory.peak")).unwrap();
        assert!(cg.reset().is_err());
    }
}

use std::collections::HashMap;
use std::fmt;
use std::ops::Add;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use super::file::File;
use super::interface::{Environment, Waiter};
use super::status::{FileError, RunnerStatus, Status};

/// Data size in bytes
///
/// Deserializes from a plain integer or from a suffixed string such as
/// `"16k"`, `"256m"` or `"1g"` (binary multiples).
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn kib(n: u64) -> Self {
        Self(n << 10)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n << 20)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl Add for ByteSize {
    type Output = ByteSize;

    fn add(self, rhs: Self) -> Self::Output {
        ByteSize(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl std::str::FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_lowercase()) {
            Some('k') => (&s[..s.len() - 1], 10),
            Some('m') => (&s[..s.len() - 1], 20),
            Some('g') => (&s[..s.len() - 1], 30),
            Some('b') => (&s[..s.len() - 1], 0),
            _ => (s, 0),
        };
        let n: u64 = digits
            .trim()
            .parse()
            .map_err(|e| format!("invalid size {s:?}: {e}"))?;
        n.checked_shl(shift)
            .filter(|v| v >> shift == n)
            .map(ByteSize)
            .ok_or_else(|| format!("size {s:?} overflows"))
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(ByteSize(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Resource limits passed to the environment for one execve
#[derive(Debug, Clone, Default)]
pub struct Limit {
    pub time: Duration,
    pub memory: ByteSize,
    pub proc: u64,
    pub stack: ByteSize,
    pub output: ByteSize,
    /// CPU rate, 1000 as one full core
    pub rate: u64,
    pub open_file: u64,
    pub cpu_set: String,
    /// Use rlimit as a stricter memory limit on top of cgroup
    pub strict_memory: bool,
}

/// Point-in-time resource usage of a running process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub time: Duration,
    pub memory: ByteSize,
}

/// Parameters to run a process inside an environment
///
/// `files[i]` becomes fd `i` of the new process, `None` leaves it closed.
#[derive(Debug, Default)]
pub struct ExecveParam {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub files: Vec<Option<OwnedFd>>,
    pub tty: bool,
    pub limit: Limit,
}

/// Raw finish result reported by the container runner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerResult {
    pub status: RunnerStatus,
    pub exit_status: i32,
    pub error: String,
    pub time: Duration,
    pub run_time: Duration,
    pub memory: ByteSize,
}

impl RunnerResult {
    pub fn runner_error(error: impl fmt::Display) -> Self {
        Self {
            status: RunnerStatus::RunnerError,
            error: error.to_string(),
            ..Default::default()
        }
    }
}

/// A file to copy out of the work directory after the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutFile {
    pub name: String,
    /// Ignore the file silently if it does not exist
    pub optional: bool,
}

impl CopyOutFile {
    /// Parses `name` or `name?`, the trailing `?` marks the file as optional
    pub fn parse(s: &str) -> Self {
        match s.strip_suffix('?') {
            Some(name) => Self {
                name: name.to_string(),
                optional: true,
            },
            None => Self {
                name: s.to_string(),
                optional: false,
            },
        }
    }
}

/// One program invocation with its limits and file bindings
pub struct Cmd {
    pub environment: Arc<dyn Environment>,

    /// File contents to copy in before exec, keyed by work-dir relative name
    pub copy_in: HashMap<String, File>,
    /// Symbolic links to create before exec (link path -> target)
    pub symlinks: HashMap<String, String>,

    pub args: Vec<String>,
    pub env: Vec<String>,

    pub files: Vec<Option<File>>,
    pub tty: bool,

    pub time_limit: Duration,
    pub memory_limit: ByteSize,
    pub stack_limit: ByteSize,
    pub extra_memory_limit: ByteSize,
    pub output_limit: ByteSize,
    pub proc_limit: u64,
    pub open_file_limit: u64,
    pub cpu_rate_limit: u64,
    pub strict_memory_limit: bool,
    pub cpu_set_limit: String,

    /// Decides when the running process exceeded its time budget.
    /// Without a waiter the run only ends when the process exits.
    pub waiter: Option<Arc<dyn Waiter>>,

    pub copy_out: Vec<CopyOutFile>,
    pub copy_out_max: ByteSize,
    /// Keep the first `copy_out_max` bytes instead of failing oversized files
    pub copy_out_truncate: bool,
    /// Host directory receiving a copy of the whole work directory
    pub copy_out_dir: Option<PathBuf>,
}

impl Cmd {
    pub fn new(environment: Arc<dyn Environment>, args: Vec<String>) -> Self {
        Self {
            environment,
            copy_in: HashMap::new(),
            symlinks: HashMap::new(),
            args,
            env: Vec::new(),
            files: Vec::new(),
            tty: false,
            time_limit: Duration::ZERO,
            memory_limit: ByteSize::default(),
            stack_limit: ByteSize::default(),
            extra_memory_limit: ByteSize::default(),
            output_limit: ByteSize::default(),
            proc_limit: 0,
            open_file_limit: 0,
            cpu_rate_limit: 0,
            strict_memory_limit: false,
            cpu_set_limit: String::new(),
            waiter: None,
            copy_out: Vec::new(),
            copy_out_max: ByteSize::default(),
            copy_out_truncate: false,
            copy_out_dir: None,
        }
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("args", &self.args)
            .field("files", &self.files)
            .field("tty", &self.tty)
            .field("time_limit", &self.time_limit)
            .field("memory_limit", &self.memory_limit)
            .field("copy_in", &self.copy_in.keys().collect::<Vec<_>>())
            .field("copy_out", &self.copy_out)
            .finish_non_exhaustive()
    }
}

/// Outcome of one Cmd
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub status: Status,
    pub exit_status: i32,
    pub error: String,

    /// CPU time
    pub time: Duration,
    /// Wall clock time
    pub run_time: Duration,
    pub memory: ByteSize,

    /// Copied out files and collected pipes by name
    pub files: HashMap<String, Vec<u8>>,
    pub file_error: Vec<FileError>,
}

impl ExecResult {
    pub fn internal_error(error: impl fmt::Display) -> Self {
        Self {
            status: Status::InternalError,
            error: error.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_parse() {
        assert_eq!("16k".parse::<ByteSize>(), Ok(ByteSize(16 << 10)));
        assert_eq!("256m".parse::<ByteSize>(), Ok(ByteSize(256 << 20)));
        assert_eq!("1G".parse::<ByteSize>(), Ok(ByteSize(1 << 30)));
        assert_eq!("1024".parse::<ByteSize>(), Ok(ByteSize(1024)));
        assert!("12q".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_byte_size_deserialize() {
        let sizes: Vec<ByteSize> = serde_json::from_str(r#"[1024, "4k"]"#).unwrap();
        assert_eq!(sizes, vec![ByteSize(1024), ByteSize(4096)]);
    }

    #[test]
    fn test_copy_out_file_parse() {
        assert_eq!(
            CopyOutFile::parse("stdout"),
            CopyOutFile {
                name: "stdout".to_string(),
                optional: false
            }
        );
        assert_eq!(
            CopyOutFile::parse("answer.txt?"),
            CopyOutFile {
                name: "answer.txt".to_string(),
                optional: true
            }
        );
    }
}

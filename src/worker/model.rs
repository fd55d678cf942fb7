use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::envexec::{ByteSize, FileError, PipeIndex, Status};

/// One request: a single command, or several connected by pipes
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Request {
    pub request_id: String,
    pub cmd: Vec<CmdSpec>,
    pub pipe_mapping: Vec<PipeMap>,
}

/// Command description as received from the caller
///
/// Limits in nanoseconds and bytes; zero means unlimited, or the worker
/// default where one exists.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct CmdSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub files: Vec<Option<CmdFile>>,
    pub tty: bool,

    pub cpu_limit: u64,
    pub clock_limit: u64,
    pub memory_limit: ByteSize,
    pub stack_limit: ByteSize,
    pub output_limit: ByteSize,
    pub proc_limit: u64,
    pub open_file_limit: u64,
    pub cpu_rate_limit: u64,
    pub cpuset_limit: String,
    pub strict_memory_limit: bool,

    pub copy_in: HashMap<String, CmdFile>,
    pub symlinks: HashMap<String, String>,

    /// Names returned inline, `name?` for optional files
    pub copy_out: Vec<String>,
    /// Names saved to the file store and returned as ids
    pub copy_out_cached: Vec<String>,
    pub copy_out_max: ByteSize,
    pub copy_out_truncate: bool,
    pub copy_out_dir: Option<String>,
}

impl CmdSpec {
    pub fn cpu_limit(&self) -> Duration {
        Duration::from_nanos(self.cpu_limit)
    }

    pub fn clock_limit(&self) -> Duration {
        Duration::from_nanos(self.clock_limit)
    }
}

/// Source or sink of one fd, distinguished by its fields
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum CmdFile {
    /// Host file opened read-only
    Local { src: PathBuf },
    Memory { content: String },
    /// File from the file store
    Cached { file_id: String },
    /// Output captured under `name`, through a pipe when `pipe` is set
    Collector {
        name: String,
        #[serde(default)]
        max: ByteSize,
        #[serde(default)]
        pipe: bool,
    },
    StreamIn { stream_in: String },
    StreamOut { stream_out: String },
}

/// Pipe from fd `input.fd` of cmd `input.index` to `output`
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct PipeMap {
    #[serde(rename = "in")]
    pub input: PipeIndex,
    #[serde(rename = "out")]
    pub output: PipeIndex,
    pub proxy: bool,
    pub name: String,
    pub max: ByteSize,
}

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: String,
    pub results: Vec<CmdResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn error(request_id: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            request_id: request_id.into(),
            results: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Result of one command, times in nanoseconds and memory in bytes
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct CmdResult {
    pub status: Status,
    pub exit_status: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub time: u64,
    pub run_time: u64,
    pub memory: u64,
    #[serde(serialize_with = "serialize_text")]
    pub files: HashMap<String, Vec<u8>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub file_ids: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_error: Vec<FileError>,
}

fn serialize_text<S: Serializer>(files: &HashMap<String, Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_map(
        files
            .iter()
            .map(|(name, content)| (name, String::from_utf8_lossy(content))),
    )
}

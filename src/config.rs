use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

pub use crate::envexec::ByteSize;

#[derive(Parser, Debug)]
#[command(name = "sandbox-exec", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file, defaults apply when omitted
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Path to the request file, read from stdin when omitted
    #[arg(long = "request", short = 'r')]
    pub request_path: Option<String>,

    /// Number of worker loops, overrides the configuration file
    #[arg(long = "parallelism", short = 'p')]
    pub parallelism: Option<usize>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config: Config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl MilliSecond {
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CgroupPoolKind {
    /// New cgroup for every run
    Fake,
    /// Reuse returned cgroups
    #[default]
    List,
    /// Prebuilt by background threads
    Cached,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub parallelism: usize,
    /// Base directory of the environments' work dirs
    pub work_dir: Option<PathBuf>,
    /// Directory of the file store, kept in memory when absent
    pub file_store_dir: Option<PathBuf>,
    /// Stored files older than this are removed
    pub file_timeout: Option<MilliSecond>,

    pub time_limit_tick_interval: MilliSecond,
    pub extra_memory_limit: ByteSize,
    pub output_limit: ByteSize,
    pub copy_out_limit: ByteSize,
    pub open_file_limit: u64,

    pub cpuset: String,
    pub enable_cpu_rate: bool,
    pub cpu_cfs_period: MilliSecond,
    pub cgroup_prefix: String,
    pub cgroup_pool: CgroupPoolKind,
    pub no_cgroup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism().map_or(4, |n| n.get()),
            work_dir: None,
            file_store_dir: None,
            file_timeout: None,
            time_limit_tick_interval: MilliSecond(100),
            extra_memory_limit: ByteSize::kib(16),
            output_limit: ByteSize::mib(256),
            copy_out_limit: ByteSize::mib(64),
            open_file_limit: 256,
            cpuset: String::new(),
            enable_cpu_rate: false,
            cpu_cfs_period: MilliSecond(100),
            cgroup_prefix: "sandbox-exec".to_string(),
            cgroup_pool: CgroupPoolKind::default(),
            no_cgroup: false,
        }
    }
}

impl Config {
    /// Base directory for work dirs, the user cache dir unless configured
    pub fn work_dir(&self) -> PathBuf {
        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("", "", "sandbox-exec")
            .map(|dirs| dirs.cache_dir().join("envs"))
            .unwrap_or_else(|| std::env::temp_dir().join("sandbox-exec"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let config: Config = serde_json::from_str(
            r#"{
                "parallelism": 2,
                "work_dir": "/tmp/envs",
                "extra_memory_limit": "32k",
                "output_limit": 1048576,
                "cpu_cfs_period": 50,
                "cgroup_pool": "cached"
            }"#,
        )
        .unwrap();
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.work_dir(), PathBuf::from("/tmp/envs"));
        assert_eq!(config.extra_memory_limit, ByteSize(32 << 10));
        assert_eq!(config.output_limit, ByteSize::mib(1));
        assert_eq!(config.cpu_cfs_period.as_duration(), Duration::from_millis(50));
        assert_eq!(config.cgroup_pool, CgroupPoolKind::Cached);
        // untouched fields keep their defaults
        assert_eq!(config.time_limit_tick_interval, MilliSecond(100));
        assert!(!config.no_cgroup);
    }

    #[test]
    fn test_cli_overrides_parallelism() {
        let cli = CliArgs::parse_from(["sandbox-exec", "--parallelism", "3"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.parallelism, 3);
        assert!(cli.request_path.is_none());
    }
}

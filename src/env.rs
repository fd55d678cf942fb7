//! Environments: containers, cgroups and the pools handing them out.

pub mod cgroup;
pub mod cgroup_pool;
pub mod container;
pub mod environ;
pub mod local;
pub mod pool;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;

use crate::config::{CgroupPoolKind, Config};
use crate::envexec::Environment;
use cgroup::{Cgroup, CgroupV2, cgroup_v2_available, ensure_prefix};
use cgroup_pool::{CachedCgroupPool, CgroupBuilder, CgroupPool, FakeCgroupPool, ListCgroupPool};
use environ::{Environ, EnvironConfig};
use local::LocalContainer;
pub use pool::{EnvironmentBuilder, EnvironmentPool};

/// Builds [`Environ`]s over local containers sharing one cgroup pool
pub struct LocalEnvironmentBuilder {
    base: PathBuf,
    cgroups: Option<Arc<dyn CgroupPool>>,
    config: EnvironConfig,
    next_id: AtomicUsize,
}

impl LocalEnvironmentBuilder {
    pub fn new(base: PathBuf, cgroups: Option<Arc<dyn CgroupPool>>, config: EnvironConfig) -> Self {
        Self {
            base,
            cgroups,
            config,
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EnvironmentBuilder for LocalEnvironmentBuilder {
    fn build(&self) -> Result<Arc<dyn Environment>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let container = LocalContainer::build(id, &self.base)?;
        log::info!("Environment {id} initialized");
        Ok(Arc::new(Environ::new(
            id,
            Arc::new(container),
            self.cgroups.clone(),
            self.config.clone(),
        )))
    }
}

/// Creates the cgroup pool described by the configuration
///
/// Returns `None` when cgroups are disabled or cgroup v2 is not mounted.
pub fn create_cgroup_pool(config: &Config) -> Result<Option<Arc<dyn CgroupPool>>> {
    if config.no_cgroup {
        log::info!("Cgroup disabled by configuration");
        return Ok(None);
    }
    if !cgroup_v2_available() {
        log::warn!("Cgroup v2 not available, falling back to rlimit accounting");
        return Ok(None);
    }

    let parent = ensure_prefix(&config.cgroup_prefix)?;
    let builder: CgroupBuilder =
        Arc::new(move || Ok(Arc::new(CgroupV2::new(&parent)?) as Arc<dyn Cgroup>));
    let pool: Arc<dyn CgroupPool> = match config.cgroup_pool {
        CgroupPoolKind::Fake => Arc::new(FakeCgroupPool::new(builder)),
        CgroupPoolKind::List => Arc::new(ListCgroupPool::new(builder)),
        CgroupPoolKind::Cached => Arc::new(CachedCgroupPool::new(builder, config.parallelism)),
    };
    log::info!("Using {:?} cgroup pool under {}", config.cgroup_pool, config.cgroup_prefix);
    Ok(Some(pool))
}

/// Creates the environment pool for the worker
pub fn create_environment_pool(
    config: &Config,
    cgroups: Option<Arc<dyn CgroupPool>>,
) -> EnvironmentPool {
    log::warn!("Local containers provide NO namespace isolation - use only with trusted programs");
    let environ_config = EnvironConfig {
        cpuset: config.cpuset.clone(),
        enable_cpu_rate: config.enable_cpu_rate,
        cpu_cfs_period: config.cpu_cfs_period.as_duration(),
    };
    EnvironmentPool::new(LocalEnvironmentBuilder::new(
        config.work_dir(),
        cgroups,
        environ_config,
    ))
}

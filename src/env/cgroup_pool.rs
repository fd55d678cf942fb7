use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;

use super::cgroup::Cgroup;

/// Creates one ready-to-use cgroup
pub type CgroupBuilder = Arc<dyn Fn() -> Result<Arc<dyn Cgroup>> + Send + Sync>;

/// Hands out cgroups for single runs
pub trait CgroupPool: Send + Sync {
    /// Blocks until a cgroup is available
    fn get(&self) -> Result<Arc<dyn Cgroup>>;

    fn put(&self, cgroup: Arc<dyn Cgroup>);

    fn shutdown(&self);
}

/// Builds a fresh cgroup for every run and destroys it afterwards
pub struct FakeCgroupPool {
    builder: CgroupBuilder,
}

impl FakeCgroupPool {
    pub fn new(builder: CgroupBuilder) -> Self {
        Self { builder }
    }
}

impl CgroupPool for FakeCgroupPool {
    fn get(&self) -> Result<Arc<dyn Cgroup>> {
        (self.builder)()
    }

    fn put(&self, cgroup: Arc<dyn Cgroup>) {
        if let Err(e) = cgroup.destroy() {
            log::warn!("Failed to destroy cgroup: {e}");
        }
    }

    fn shutdown(&self) {}
}

/// Keeps returned cgroups for reuse, most recently returned first
pub struct ListCgroupPool {
    builder: CgroupBuilder,
    idle: Mutex<Vec<Arc<dyn Cgroup>>>,
}

impl ListCgroupPool {
    pub fn new(builder: CgroupBuilder) -> Self {
        Self {
            builder,
            idle: Mutex::new(Vec::new()),
        }
    }
}

impl CgroupPool for ListCgroupPool {
    fn get(&self) -> Result<Arc<dyn Cgroup>> {
        if let Some(cgroup) = self.idle.lock().pop() {
            return Ok(cgroup);
        }
        (self.builder)()
    }

    fn put(&self, cgroup: Arc<dyn Cgroup>) {
        if let Err(e) = cgroup.reset() {
            log::warn!("Failed to reset cgroup, discarding it: {e}");
            if let Err(e) = cgroup.destroy() {
                log::warn!("Failed to destroy cgroup: {e}");
            }
            return;
        }
        self.idle.lock().push(cgroup);
    }

    fn shutdown(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for cgroup in idle {
            if let Err(e) = cgroup.destroy() {
                log::warn!("Failed to destroy cgroup: {e}");
            }
        }
    }
}

/// Builds cgroups ahead of time on background threads
///
/// Each builder thread keeps one cgroup ready and hands it over through a
/// rendezvous channel. Returned cgroups are destroyed on a separate thread.
/// A failing builder closes the pool.
pub struct CachedCgroupPool {
    ready: Mutex<Option<Receiver<Result<Arc<dyn Cgroup>>>>>,
    error: Mutex<Option<String>>,
    destroy: Mutex<Option<Sender<Arc<dyn Cgroup>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CachedCgroupPool {
    pub fn new(builder: CgroupBuilder, builders: usize) -> Self {
        let (ready_tx, ready_rx) = mpsc::sync_channel(0);
        let (destroy_tx, destroy_rx) = mpsc::channel::<Arc<dyn Cgroup>>();

        let mut threads = Vec::with_capacity(builders + 1);
        for id in 0..builders.max(1) {
            let builder = builder.clone();
            let ready_tx = ready_tx.clone();
            threads.push(thread::spawn(move || build_loop(id, builder, ready_tx)));
        }
        threads.push(thread::spawn(move || {
            for cgroup in destroy_rx {
                if let Err(e) = cgroup.destroy() {
                    log::warn!("Failed to destroy cgroup: {e}");
                }
            }
        }));

        Self {
            ready: Mutex::new(Some(ready_rx)),
            error: Mutex::new(None),
            destroy: Mutex::new(Some(destroy_tx)),
            threads: Mutex::new(threads),
        }
    }

    fn closed_error(&self) -> anyhow::Error {
        match &*self.error.lock() {
            Some(e) => anyhow!("cgroup pool closed: {e}"),
            None => anyhow!("cgroup pool closed"),
        }
    }
}

fn build_loop(id: usize, builder: CgroupBuilder, ready: SyncSender<Result<Arc<dyn Cgroup>>>) {
    loop {
        let built = builder();
        let failed = built.is_err();
        if let Err(mpsc::SendError(unsent)) = ready.send(built) {
            // pool shut down while this one was waiting
            if let Ok(cgroup) = unsent {
                if let Err(e) = cgroup.destroy() {
                    log::warn!("Failed to destroy cgroup: {e}");
                }
            }
            break;
        }
        if failed {
            log::error!("Cgroup builder {id} failed, closing pool");
            break;
        }
    }
}

impl CgroupPool for CachedCgroupPool {
    fn get(&self) -> Result<Arc<dyn Cgroup>> {
        let mut ready = self.ready.lock();
        let received = match ready.as_ref() {
            Some(rx) => rx.recv().map_err(|_| anyhow!("all cgroup builders exited")),
            None => return Err(self.closed_error()),
        };
        match received.and_then(|built| built) {
            Ok(cgroup) => Ok(cgroup),
            Err(e) => {
                *self.error.lock() = Some(format!("{e:#}"));
                // dropping the receiver stops the remaining builders
                ready.take();
                Err(e.context("build cgroup"))
            }
        }
    }

    fn put(&self, cgroup: Arc<dyn Cgroup>) {
        let unsent = match &*self.destroy.lock() {
            Some(tx) => tx.send(cgroup).err().map(|mpsc::SendError(c)| c),
            None => Some(cgroup),
        };
        if let Some(cgroup) = unsent {
            if let Err(e) = cgroup.destroy() {
                log::warn!("Failed to destroy cgroup: {e}");
            }
        }
    }

    fn shutdown(&self) {
        self.ready.lock().take();
        self.destroy.lock().take();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                log::error!("Cgroup pool thread panicked");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::envexec::ByteSize;

    /// Cgroup keeping counters of how the pools treat it
    #[derive(Default)]
    pub(crate) struct CountingCgroup {
        pub stats: Arc<Counters>,
        pub fail_reset: bool,
        pub oom: AtomicBool,
        pub pids: parking_lot::Mutex<Vec<u32>>,
    }

    #[derive(Default)]
    pub(crate) struct Counters {
        pub built: AtomicUsize,
        pub reset: AtomicUsize,
        pub destroyed: AtomicUsize,
    }

    impl Cgroup for CountingCgroup {
        fn set_cpuset(&self, _cpus: &str) -> io::Result<()> {
            Err(io::ErrorKind::NotFound.into())
        }
        fn set_cpu_rate(&self, _rate: u64, _period: Duration) -> io::Result<()> {
            Ok(())
        }
        fn set_memory_limit(&self, _limit: ByteSize) -> io::Result<()> {
            Ok(())
        }
        fn set_proc_limit(&self, _limit: u64) -> io::Result<()> {
            Ok(())
        }
        fn cpu_usage(&self) -> io::Result<Duration> {
            Ok(Duration::from_millis(7))
        }
        fn memory_peak(&self) -> io::Result<ByteSize> {
            Ok(ByteSize::kib(64))
        }
        fn memory_current(&self) -> io::Result<ByteSize> {
            Ok(ByteSize::kib(32))
        }
        fn oom_killed(&self) -> io::Result<bool> {
            Ok(self.oom.load(Ordering::SeqCst))
        }
        fn add_proc(&self, pid: u32) -> io::Result<()> {
            self.pids.lock().push(pid);
            Ok(())
        }
        fn reset(&self) -> io::Result<()> {
            self.stats.reset.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset {
                return Err(io::Error::other("reset failed"));
            }
            Ok(())
        }
        fn destroy(&self) -> io::Result<()> {
            self.stats.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn counting_builder(stats: Arc<Counters>, fail_reset: bool) -> CgroupBuilder {
        Arc::new(move || {
            stats.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingCgroup {
                stats: stats.clone(),
                fail_reset,
                ..Default::default()
            }) as Arc<dyn Cgroup>)
        })
    }

    #[test]
    fn test_fake_pool_destroys_on_put() {
        let stats = Arc::new(Counters::default());
        let pool = FakeCgroupPool::new(counting_builder(stats.clone(), false));
        let cg = pool.get().unwrap();
        pool.put(cg);
        let _ = pool.get().unwrap();
        assert_eq!(stats.built.load(Ordering::SeqCst), 2);
        assert_eq!(stats.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_list_pool_reuses_and_discards() {
        let stats = Arc::new(Counters::default());
        let pool = ListCgroupPool::new(counting_builder(stats.clone(), false));
        let cg = pool.get().unwrap();
        pool.put(cg);
        let cg = pool.get().unwrap();
        assert_eq!(stats.built.load(Ordering::SeqCst), 1);
        assert_eq!(stats.reset.load(Ordering::SeqCst), 1);
        pool.put(cg);
        pool.shutdown();
        assert_eq!(stats.destroyed.load(Ordering::SeqCst), 1);

        let stats = Arc::new(Counters::default());
        let pool = ListCgroupPool::new(counting_builder(stats.clone(), true));
        let cg = pool.get().unwrap();
        pool.put(cg);
        assert_eq!(stats.destroyed.load(Ordering::SeqCst), 1);
        let _ = pool.get().unwrap();
        assert_eq!(stats.built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cached_pool_destroys_everything_on_shutdown() {
        let stats = Arc::new(Counters::default());
        let pool = CachedCgroupPool::new(counting_builder(stats.clone(), false), 2);
        let first = pool.get().unwrap();
        let second = pool.get().unwrap();
        pool.put(first);
        pool.put(second);
        pool.shutdown();

        // the ones still waiting in builders are destroyed as well
        let built = stats.built.load(Ordering::SeqCst);
        assert!(built >= 2);
        assert_eq!(stats.destroyed.load(Ordering::SeqCst), built);
        assert!(pool.get().is_err());
    }

    #[test]
    fn test_cached_pool_closes_on_builder_failure() {
        let builder: CgroupBuilder = Arc::new(|| Err(anyhow!("no controller")));
        let pool = CachedCgroupPool::new(builder, 1);
        let err = pool.get().err().unwrap();
        assert!(format!("{err:#}").contains("no controller"));
        let err = pool.get().err().unwrap();
        assert!(err.to_string().contains("no controller"));
        pool.shutdown();
    }
}

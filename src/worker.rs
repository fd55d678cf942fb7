//! Turns requests into engine runs on a fixed set of worker loops.

mod model;
mod stream;
mod waiter;

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::env::EnvironmentPool;
use crate::envexec::{
    ByteSize, Cmd, CopyOutFile, Environment, ExecResult, File, Group, Pipe, Single, Status, Waiter,
};
use crate::filestore::{FileStore, store_bytes};
use crate::queue::{DEFAULT_CAPACITY, RequestQueue};

pub use model::{CmdFile, CmdResult, CmdSpec, PipeMap, Request, Response};
pub use stream::{StreamEvent, StreamSession};
pub use waiter::{CpuWaiter, DEFAULT_TICK_INTERVAL, RealTimeWaiter};

use stream::Streams;

/// Called with every response the worker produces
pub type ExecObserver = Arc<dyn Fn(&Response) + Send + Sync>;

pub struct WorkerConfig {
    pub file_store: Arc<dyn FileStore>,
    pub env_pool: Arc<EnvironmentPool>,
    pub parallelism: usize,
    /// Base of relative `copy_out_dir`s
    pub work_dir: PathBuf,
    pub time_limit_tick_interval: Duration,
    pub extra_memory_limit: ByteSize,
    pub output_limit: ByteSize,
    pub copy_out_limit: ByteSize,
    pub open_file_limit: u64,
    pub exec_observer: Option<ExecObserver>,
}

impl WorkerConfig {
    pub fn new(config: &Config, file_store: Arc<dyn FileStore>, env_pool: Arc<EnvironmentPool>) -> Self {
        Self {
            file_store,
            env_pool,
            parallelism: config.parallelism,
            work_dir: config.work_dir(),
            time_limit_tick_interval: config.time_limit_tick_interval.as_duration(),
            extra_memory_limit: config.extra_memory_limit,
            output_limit: config.output_limit,
            copy_out_limit: config.copy_out_limit,
            open_file_limit: config.open_file_limit,
            exec_observer: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

struct WorkRequest {
    request: Request,
    ctx: CancellationToken,
    respond: oneshot::Sender<Response>,
}

pub struct Worker {
    inner: Arc<Inner>,
    queue: Arc<RequestQueue<WorkRequest>>,
    state: Mutex<WorkerState>,
    loops: Mutex<JoinSet<()>>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(Inner { config }),
            queue: Arc::new(RequestQueue::new(DEFAULT_CAPACITY)),
            state: Mutex::new(WorkerState::Created),
            loops: Mutex::new(JoinSet::new()),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Starts the worker loops, only the first call has an effect
    pub fn start(&self) {
        let mut state = self.state.lock();
        if *state != WorkerState::Created {
            return;
        }
        let parallelism = self.inner.config.parallelism.max(1);
        let mut loops = self.loops.lock();
        for id in 1..=parallelism {
            loops.spawn(work_loop(id, self.inner.clone(), self.queue.clone()));
        }
        *state = WorkerState::Running;
        log::info!("Worker started with {parallelism} loops");
    }

    /// Queues the request and waits for its response
    ///
    /// Waits for room while the queue is full. A request cancelled before a
    /// loop picks it up is answered with an error without running.
    pub async fn submit(&self, ctx: CancellationToken, request: Request) -> Response {
        let request_id = request.request_id.clone();
        if self.state() != WorkerState::Running {
            return Response::error(request_id, "worker is not running");
        }

        let (respond, response) = oneshot::channel();
        let work = WorkRequest {
            request,
            ctx: ctx.clone(),
            respond,
        };
        tokio::select! {
            pushed = self.queue.push(work) => {
                if pushed.is_err() {
                    return Response::error(request_id, "worker is shutting down");
                }
            }
            _ = ctx.cancelled() => return Response::error(request_id, "cancelled before execute"),
        }
        response
            .await
            .unwrap_or_else(|_| Response::error(request_id, "request dropped by worker"))
    }

    /// Runs the request right away, outside of the worker loops
    pub async fn execute(&self, ctx: &CancellationToken, request: Request) -> Response {
        self.inner.do_request(ctx, request).await
    }

    /// Starts the request with `stream_in` / `stream_out` files bound to
    /// the returned session
    pub async fn stream(&self, ctx: &CancellationToken, request: Request) -> Result<StreamSession> {
        if matches!(self.state(), WorkerState::ShuttingDown | WorkerState::Stopped) {
            bail!("worker is shut down");
        }
        let mut streams = Streams::default();
        let prepared = self.inner.prepare(request, Some(&mut streams), true).await?;

        let (events, receiver) = mpsc::channel(64);
        let readers = streams.spawn_readers(&events);
        let inputs = streams.inputs.clone();
        let cancel = ctx.child_token();

        let (inner, run_ctx) = (self.inner.clone(), cancel.clone());
        tokio::spawn(async move {
            let response = inner.run(&run_ctx, prepared).await;
            streams.abandon();
            for reader in readers {
                if let Err(e) = reader.await {
                    log::warn!("Stream reader failed: {e}");
                }
            }
            let response = inner.observe(response);
            let _ = events.send(StreamEvent::Finished(response)).await;
        });

        Ok(StreamSession::new(inputs, receiver, cancel))
    }

    /// Stops accepting requests and waits for the loops to finish the
    /// queued ones, then destroys idle environments
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                WorkerState::Created => *state = WorkerState::Stopped,
                WorkerState::Running => *state = WorkerState::ShuttingDown,
                WorkerState::ShuttingDown | WorkerState::Stopped => {}
            }
            previous
        };
        match previous {
            WorkerState::Running => {}
            WorkerState::Created => {
                self.inner.config.env_pool.shutdown();
                return;
            }
            WorkerState::ShuttingDown | WorkerState::Stopped => return,
        }

        self.queue.close();
        log::info!("Worker shutting down, waiting for queued requests...");
        let mut loops = std::mem::take(&mut *self.loops.lock());
        while let Some(res) = loops.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    log::error!("Worker loop panicked: {e:?}");
                } else {
                    log::error!("Worker loop finished with error: {e:?}");
                }
            }
        }

        self.inner.config.env_pool.shutdown();
        *self.state.lock() = WorkerState::Stopped;
        log::info!("Worker shut down");
    }
}

async fn work_loop(id: usize, inner: Arc<Inner>, queue: Arc<RequestQueue<WorkRequest>>) {
    log::info!("Worker loop {id} started");
    while let Some(work) = queue.pop().await {
        let WorkRequest {
            request,
            ctx,
            respond,
        } = work;
        let response = if ctx.is_cancelled() {
            inner.observe(Response::error(request.request_id, "cancelled before execute"))
        } else {
            log::debug!("Worker loop {id} got request {:?}", request.request_id);
            inner.do_request(&ctx, request).await
        };
        if respond.send(response).is_err() {
            log::warn!("Worker loop {id}: submitter gone, response discarded");
        }
    }
    log::info!("Worker loop {id} has shut down gracefully");
}

/// What the response conversion needs to know about each command
struct CmdMeta {
    cpu_limit: Duration,
    clock_limit: Duration,
    cached: HashSet<String>,
}

struct PreparedRequest {
    request_id: String,
    cmds: Vec<Cmd>,
    meta: Vec<CmdMeta>,
    pipes: Vec<Pipe>,
    envs: Vec<Arc<dyn Environment>>,
}

struct Inner {
    config: WorkerConfig,
}

impl Inner {
    async fn do_request(&self, ctx: &CancellationToken, request: Request) -> Response {
        let request_id = request.request_id.clone();
        let response = match self.prepare(request, None, false).await {
            Ok(prepared) => self.run(ctx, prepared).await,
            Err(e) => Response::error(request_id, format!("{e:#}")),
        };
        self.observe(response)
    }

    fn observe(&self, response: Response) -> Response {
        if let Some(observer) = &self.config.exec_observer {
            observer(&response);
        }
        response
    }

    /// Acquires one environment per command and binds every file
    ///
    /// On failure everything acquired so far is released.
    async fn prepare(
        &self,
        request: Request,
        streams: Option<&mut Streams>,
        real_time: bool,
    ) -> Result<PreparedRequest> {
        let Request {
            request_id,
            cmd: specs,
            pipe_mapping,
        } = request;
        if specs.is_empty() {
            bail!("no cmd provided");
        }

        let envs = self.acquire(specs.len()).await?;
        let (cmds, meta) = match self.prepare_cmds(specs, &envs, streams, real_time) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release(envs).await;
                return Err(e);
            }
        };

        let pipes = pipe_mapping
            .into_iter()
            .map(|p| Pipe {
                input: p.input,
                output: p.output,
                proxy: p.proxy,
                name: p.name,
                limit: p.max,
                disable_zero_copy: false,
            })
            .collect();

        Ok(PreparedRequest {
            request_id,
            cmds,
            meta,
            pipes,
            envs,
        })
    }

    fn prepare_cmds(
        &self,
        specs: Vec<CmdSpec>,
        envs: &[Arc<dyn Environment>],
        mut streams: Option<&mut Streams>,
        real_time: bool,
    ) -> Result<(Vec<Cmd>, Vec<CmdMeta>)> {
        let mut cmds = Vec::with_capacity(specs.len());
        let mut meta = Vec::with_capacity(specs.len());
        for (spec, env) in specs.into_iter().zip(envs) {
            let (cmd, m) = self.prepare_cmd(spec, env.clone(), streams.as_deref_mut(), real_time)?;
            cmds.push(cmd);
            meta.push(m);
        }
        Ok((cmds, meta))
    }

    fn prepare_cmd(
        &self,
        spec: CmdSpec,
        env: Arc<dyn Environment>,
        mut streams: Option<&mut Streams>,
        real_time: bool,
    ) -> Result<(Cmd, CmdMeta)> {
        let (cpu_limit, clock_limit) = (spec.cpu_limit(), spec.clock_limit());

        let mut collectors = HashSet::new();
        let mut files = Vec::with_capacity(spec.files.len());
        for file in spec.files {
            let Some(file) = file else {
                files.push(None);
                continue;
            };
            if let CmdFile::Collector { name, .. } = &file {
                collectors.insert(name.clone());
            }
            files.push(Some(self.bind_file(file, streams.as_deref_mut())?));
        }

        let mut copy_in = HashMap::with_capacity(spec.copy_in.len());
        for (name, file) in spec.copy_in {
            if matches!(
                file,
                CmdFile::Collector { .. } | CmdFile::StreamIn { .. } | CmdFile::StreamOut { .. }
            ) {
                bail!("{name}: only local, memory and cached files can be copied in");
            }
            copy_in.insert(name, self.bind_file(file, None)?);
        }

        // collected names come back through their collectors
        let mut cached = HashSet::new();
        let mut copy_out = Vec::new();
        for name in &spec.copy_out {
            copy_out.push(CopyOutFile::parse(name));
        }
        for name in &spec.copy_out_cached {
            let file = CopyOutFile::parse(name);
            cached.insert(file.name.clone());
            copy_out.push(file);
        }
        copy_out.retain(|f| !collectors.contains(&f.name));

        let waiter: Option<Arc<dyn Waiter>> = if real_time && !clock_limit.is_zero() {
            Some(Arc::new(RealTimeWaiter { limit: clock_limit }))
        } else if cpu_limit.is_zero() && clock_limit.is_zero() {
            None
        } else {
            Some(Arc::new(CpuWaiter {
                tick_interval: self.config.time_limit_tick_interval,
                time_limit: cpu_limit,
                clock_limit,
            }))
        };

        let copy_out_dir = spec.copy_out_dir.filter(|d| !d.is_empty()).map(|d| {
            let dir = PathBuf::from(d);
            if dir.is_absolute() {
                dir
            } else {
                self.config.work_dir.join(dir)
            }
        });

        let mut cmd = Cmd::new(env, spec.args);
        cmd.env = spec.env;
        cmd.files = files;
        cmd.tty = spec.tty;
        cmd.copy_in = copy_in;
        cmd.symlinks = spec.symlinks;
        cmd.time_limit = cpu_limit;
        cmd.memory_limit = spec.memory_limit;
        cmd.stack_limit = spec.stack_limit;
        cmd.extra_memory_limit = self.config.extra_memory_limit;
        cmd.output_limit = or_default(spec.output_limit, self.config.output_limit);
        cmd.proc_limit = spec.proc_limit;
        cmd.open_file_limit = match spec.open_file_limit {
            0 => self.config.open_file_limit,
            n => n,
        };
        cmd.cpu_rate_limit = spec.cpu_rate_limit;
        cmd.cpu_set_limit = spec.cpuset_limit;
        cmd.strict_memory_limit = spec.strict_memory_limit;
        cmd.waiter = waiter;
        cmd.copy_out = copy_out;
        cmd.copy_out_max = or_default(spec.copy_out_max, self.config.copy_out_limit);
        cmd.copy_out_truncate = spec.copy_out_truncate;
        cmd.copy_out_dir = copy_out_dir;

        let meta = CmdMeta {
            cpu_limit,
            clock_limit: clock_limit.max(cpu_limit),
            cached,
        };
        Ok((cmd, meta))
    }

    fn bind_file(&self, file: CmdFile, streams: Option<&mut Streams>) -> Result<File> {
        let need_streams = || streams.ok_or_else(|| anyhow!("stream files need a streaming session"));
        Ok(match file {
            CmdFile::Local { src } => File::Input(src),
            CmdFile::Memory { content } => File::reader(Cursor::new(content.into_bytes())),
            CmdFile::Cached { file_id } => {
                let (_, file) = self
                    .config
                    .file_store
                    .get(&file_id)
                    .ok_or_else(|| anyhow!("file not exists with id {file_id}"))?;
                file
            }
            CmdFile::Collector { name, max, pipe } => File::Collector {
                name,
                limit: or_default(max, self.config.copy_out_limit),
                pipe,
            },
            CmdFile::StreamIn { stream_in } => need_streams()?.stream_in(stream_in)?,
            CmdFile::StreamOut { stream_out } => need_streams()?.stream_out(stream_out)?,
        })
    }

    /// Takes one environment per cmd, building new ones off the runtime
    async fn acquire(&self, count: usize) -> Result<Vec<Arc<dyn Environment>>> {
        let pool = self.config.env_pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut envs = Vec::with_capacity(count);
            for _ in 0..count {
                match pool.get() {
                    Ok(env) => envs.push(env),
                    Err(e) => {
                        for env in envs {
                            pool.put(env);
                        }
                        return Err(e.context("failed to get environment"));
                    }
                }
            }
            Ok(envs)
        })
        .await
        .context("environment pool task failed")?
    }

    /// Resets the environments and returns them to the pool
    async fn release(&self, envs: Vec<Arc<dyn Environment>>) {
        let pool = self.config.env_pool.clone();
        let released = tokio::task::spawn_blocking(move || {
            for env in envs {
                pool.put(env);
            }
        });
        if let Err(e) = released.await {
            log::error!("Failed to return environments: {e}");
        }
    }

    /// Runs the prepared commands and returns their environments
    async fn run(&self, ctx: &CancellationToken, prepared: PreparedRequest) -> Response {
        let PreparedRequest {
            request_id,
            mut cmds,
            meta,
            pipes,
            envs,
        } = prepared;

        let results = if cmds.len() == 1 {
            let single = Single::new(cmds.remove(0));
            single.run(ctx).await.map(|result| vec![result])
        } else {
            Group::new(cmds, pipes).run(ctx).await
        };

        self.release(envs).await;

        match results {
            Ok(results) => Response {
                results: results
                    .into_iter()
                    .zip(&meta)
                    .map(|(result, meta)| self.convert_result(result, meta))
                    .collect(),
                request_id,
                error: None,
            },
            Err(e) => {
                log::error!("Request {request_id:?} failed: {e:#}");
                Response::error(request_id, format!("{e:#}"))
            }
        }
    }

    fn convert_result(&self, result: ExecResult, meta: &CmdMeta) -> CmdResult {
        let mut res = CmdResult {
            status: result.status,
            exit_status: result.exit_status,
            error: result.error,
            time: nanos(result.time),
            run_time: nanos(result.run_time),
            memory: result.memory.bytes(),
            file_error: result.file_error,
            ..Default::default()
        };

        // killed by the caller's cancellation rather than a limit
        if res.status == Status::TimeLimitExceeded
            && res.exit_status != 0
            && result.time < meta.cpu_limit
            && result.run_time < meta.clock_limit
        {
            res.status = Status::Signalled;
        }

        for (name, content) in result.files {
            if !meta.cached.contains(&name) {
                res.files.insert(name, content);
                continue;
            }
            match store_bytes(self.config.file_store.as_ref(), &name, &content) {
                Ok(id) => {
                    res.file_ids.insert(name, id);
                }
                Err(e) => {
                    res.status = Status::FileError;
                    res.error = format!("{e:#}");
                    return res;
                }
            }
        }
        res
    }
}

fn or_default(size: ByteSize, default: ByteSize) -> ByteSize {
    if size.bytes() == 0 { default } else { size }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

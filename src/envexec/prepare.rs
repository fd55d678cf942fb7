use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tokio::sync::oneshot;

use super::cmd::{ByteSize, Cmd};
use super::file::{File, SharedFile};
use super::pipe::{NewStoreFile, Pipe, PipeCollector, new_pipe, new_pipe_buffer, os_pipe, pipe_proxy};
use super::util::{open_pty, reader_to_file, reader_to_pipe};

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("pipe index out of range {0}")]
    IndexOutOfRange(usize),
    #[error("pipe fd have been occupied {index} {fd}")]
    FdOccupied { index: usize, fd: usize },
    #[error("cmd {index} fd {fd} is not resolved")]
    Unresolved { index: usize, fd: usize },
    #[error("cannot have multiple input when tty enabled")]
    MultipleTtyInput,
    #[error("failed to {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: io::Error,
    },
}

fn io_err(action: impl Into<String>) -> impl FnOnce(io::Error) -> PrepareError {
    let action = action.into();
    move |source| PrepareError::Io { action, source }
}

/// Collector backed by a file in the work dir, read back after the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileCollector {
    pub name: String,
    pub limit: ByteSize,
}

/// Fd table and collectors of one command, ready for execve
#[derive(Default)]
pub(crate) struct PreparedCmd {
    pub fds: Vec<Option<OwnedFd>>,
    pub pipe_collectors: Vec<PipeCollector>,
    pub file_collectors: Vec<FileCollector>,
}

impl PreparedCmd {
    fn with_count(count: usize) -> Self {
        Self {
            fds: (0..count).map(|_| None).collect(),
            ..Default::default()
        }
    }

    fn set(&mut self, fd: usize, file: fs::File) {
        self.fds[fd] = Some(OwnedFd::from(file));
    }
}

/// Builds the fd table of `cmd`, consuming its files. `count` may exceed
/// the number of files when pipes are attached later.
pub(crate) fn prepare_cmd_fd(cmd: &mut Cmd, count: usize) -> Result<PreparedCmd, PrepareError> {
    let count = count.max(cmd.files.len());
    let files = std::mem::take(&mut cmd.files);
    if cmd.tty {
        return prepare_cmd_fd_tty(files, count);
    }

    let mut prepared = PreparedCmd::with_count(count);
    // same-name collectors of one command share a single sink
    let mut pipe_sinks: HashMap<String, fs::File> = HashMap::new();
    let mut file_sinks: HashMap<String, fs::File> = HashMap::new();

    for (fd, file) in files.into_iter().enumerate() {
        let Some(file) = file else { continue };
        match file {
            File::Opened(f) => prepared.set(fd, f),

            File::Reader { reader, stream } => {
                let f = if stream {
                    reader_to_pipe(reader)
                } else {
                    reader_to_file(reader)
                };
                prepared.set(fd, f.map_err(io_err("open reader"))?);
            }

            File::Input(path) => {
                let f = fs::File::open(&path)
                    .map_err(io_err(format!("open file {}", path.display())))?;
                prepared.set(fd, f);
            }

            File::Collector { name, limit, pipe: true } => {
                if let Some(w) = pipe_sinks.get(&name) {
                    prepared.set(fd, w.try_clone().map_err(io_err("dup pipe"))?);
                    continue;
                }
                let (w, collector) =
                    new_pipe_buffer(&name, limit).map_err(io_err("create pipe"))?;
                prepared.set(fd, w.try_clone().map_err(io_err("dup pipe"))?);
                pipe_sinks.insert(name, w);
                prepared.pipe_collectors.push(collector);
            }

            File::Collector { name, limit, pipe: false } => {
                if let Some(f) = file_sinks.get(&name) {
                    prepared.set(fd, f.try_clone().map_err(io_err("dup file"))?);
                    continue;
                }
                let f = cmd
                    .environment
                    .open(&name, OpenOptions::new().write(true).create(true).truncate(true))
                    .map_err(io_err(format!("create collector file {name}")))?;
                prepared.set(fd, f.try_clone().map_err(io_err("dup file"))?);
                file_sinks.insert(name.clone(), f);
                prepared.file_collectors.push(FileCollector { name, limit });
            }

            File::Writer { writer, limit } => {
                let (w, _done) = new_pipe(writer, limit).map_err(io_err("create pipe"))?;
                prepared.set(fd, w);
            }

            File::StreamIn(stream) => {
                let (r, w) = os_pipe().map_err(io_err("create pipe"))?;
                stream.start(SharedFile::new(w));
                prepared.set(fd, r);
            }

            File::StreamOut(stream) => {
                let (r, w) = os_pipe().map_err(io_err("create pipe"))?;
                stream.start(SharedFile::new(r));
                prepared.set(fd, w);
            }
        }
    }
    log::debug!(
        "prepared {} fds, {} pipe collectors",
        prepared.fds.iter().flatten().count(),
        prepared.pipe_collectors.len()
    );
    Ok(prepared)
}

/// Builds the fd table of a tty command: every input / output spec shares
/// one pty, the program gets the slave and copiers serve the master.
fn prepare_cmd_fd_tty(files: Vec<Option<File>>, count: usize) -> Result<PreparedCmd, PrepareError> {
    let (master, slave) = open_pty().map_err(io_err("open tty"))?;
    let master = SharedFile::new(master);
    // copiers finishing early must not close the master while later
    // specs still have to take their reference
    let _guard = MasterGuard::new(&master);
    let mut prepared = PreparedCmd::with_count(count);
    let mut has_input = false;
    let mut has_output = false;

    let slave_fd = |slave: &fs::File| slave.try_clone().map_err(io_err("dup tty"));

    for (fd, file) in files.into_iter().enumerate() {
        let Some(file) = file else { continue };
        match file {
            File::Opened(f) => prepared.set(fd, f),

            File::Input(path) => {
                let f = fs::File::open(&path)
                    .map_err(io_err(format!("open file {}", path.display())))?;
                prepared.set(fd, f);
            }

            File::Reader { mut reader, .. } => {
                if has_input {
                    return Err(PrepareError::MultipleTtyInput);
                }
                has_input = true;
                prepared.set(fd, slave_fd(&slave)?);
                spawn_master_copier(&master, move |m| {
                    let _ = io::copy(&mut reader, &mut &*m);
                });
            }

            File::StreamIn(stream) => {
                if has_input {
                    return Err(PrepareError::MultipleTtyInput);
                }
                has_input = true;
                prepared.set(fd, slave_fd(&slave)?);
                stream.start(master.clone());
            }

            File::Collector { name, limit, .. } => {
                prepared.set(fd, slave_fd(&slave)?);
                if has_output {
                    continue;
                }
                has_output = true;
                let (tx, rx) = oneshot::channel();
                spawn_master_copier(&master, move |m| {
                    let mut buf = Vec::new();
                    let _ = (&*m).take(limit.bytes() + 1).read_to_end(&mut buf);
                    let _ = tx.send(buf);
                    let _ = io::copy(&mut &*m, &mut io::sink());
                });
                prepared.pipe_collectors.push(PipeCollector { name, limit, done: rx });
            }

            File::Writer { mut writer, limit } => {
                prepared.set(fd, slave_fd(&slave)?);
                if has_output {
                    continue;
                }
                has_output = true;
                spawn_master_copier(&master, move |m| {
                    let _ = io::copy(&mut (&*m).take(limit.bytes()), &mut writer);
                    let _ = io::copy(&mut &*m, &mut io::sink());
                });
            }

            File::StreamOut(stream) => {
                prepared.set(fd, slave_fd(&slave)?);
                if has_output {
                    continue;
                }
                has_output = true;
                stream.start(master.clone());
            }
        }
    }
    Ok(prepared)
}

/// Holds one reference to the pty master until dropped
struct MasterGuard<'a>(&'a SharedFile);

impl<'a> MasterGuard<'a> {
    fn new(master: &'a SharedFile) -> Self {
        master.acquire();
        Self(master)
    }
}

impl Drop for MasterGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Runs `f` on a thread holding one reference to the pty master
fn spawn_master_copier<F>(master: &Arc<SharedFile>, f: F)
where
    F: FnOnce(&fs::File) + Send + 'static,
{
    master.acquire();
    let master = master.clone();
    thread::spawn(move || {
        if let Some(m) = master.handle() {
            f(&m);
        }
        master.release();
    });
}

/// Computes the fd count of every command, validating pipe endpoints
fn count_fds(cmds: &[Cmd], pipes: &[Pipe]) -> Result<Vec<usize>, PrepareError> {
    let mut counts: Vec<usize> = cmds.iter().map(|c| c.files.len()).collect();
    let mut taken = HashSet::new();
    for pipe in pipes {
        for end in [pipe.input, pipe.output] {
            if end.index >= cmds.len() {
                return Err(PrepareError::IndexOutOfRange(end.index));
            }
            let occupied_by_file = cmds[end.index]
                .files
                .get(end.fd)
                .is_some_and(|f| f.is_some());
            if occupied_by_file || !taken.insert((end.index, end.fd)) {
                return Err(PrepareError::FdOccupied {
                    index: end.index,
                    fd: end.fd,
                });
            }
            counts[end.index] = counts[end.index].max(end.fd + 1);
        }
    }
    Ok(counts)
}

/// Prepares the fd tables of every command of a group and wires the pipes.
/// On failure everything opened so far is closed before returning.
pub(crate) fn prepare_fds(
    cmds: &mut [Cmd],
    pipes: &[Pipe],
    new_store_file: &NewStoreFile,
) -> Result<Vec<PreparedCmd>, PrepareError> {
    let counts = count_fds(cmds, pipes)?;

    let mut prepared = Vec::with_capacity(cmds.len());
    for (cmd, count) in cmds.iter_mut().zip(counts) {
        prepared.push(prepare_cmd_fd(cmd, count)?);
    }

    for pipe in pipes {
        let (in_idx, out_idx) = (pipe.input, pipe.output);
        if pipe.proxy {
            let (src_r, src_w) = os_pipe().map_err(io_err("create pipe"))?;
            let (dst_r, dst_w) = os_pipe().map_err(io_err("create pipe"))?;
            let store = new_store_file().map_err(io_err("create store file"))?;
            let collector = pipe_proxy(pipe, src_r, dst_w, store);
            prepared[in_idx.index].set(in_idx.fd, src_w);
            prepared[out_idx.index].set(out_idx.fd, dst_r);
            if !pipe.name.is_empty() {
                prepared[in_idx.index].pipe_collectors.push(collector);
            }
        } else {
            let (r, w) = os_pipe().map_err(io_err("create pipe"))?;
            prepared[in_idx.index].set(in_idx.fd, w);
            prepared[out_idx.index].set(out_idx.fd, r);
        }
    }

    for (index, p) in prepared.iter().enumerate() {
        if let Some(fd) = p.fds.iter().position(Option::is_none) {
            return Err(PrepareError::Unresolved { index, fd });
        }
    }
    Ok(prepared)
}

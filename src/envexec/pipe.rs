use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::cmd::ByteSize;

/// Chunk size used by the copy loops, matches the default pipe capacity
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Creates the store file that receives the captured side of a proxy pipe
pub type NewStoreFile = Arc<dyn Fn() -> io::Result<fs::File> + Send + Sync>;

/// One end of a pipe: command index and the fd inside that command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeIndex {
    pub index: usize,
    pub fd: usize,
}

/// Pipe from the `input` command (writer) to the `output` command (reader)
///
/// With `proxy` set the data flows through an intermediate copier which
/// captures the first `limit` bytes under `name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipe {
    pub input: PipeIndex,
    pub output: PipeIndex,
    pub proxy: bool,
    pub name: String,
    pub limit: ByteSize,
    pub disable_zero_copy: bool,
}

/// Bytes captured from a pipe, delivered once the writer side is done
pub(crate) struct PipeCollector {
    pub name: String,
    pub limit: ByteSize,
    pub done: oneshot::Receiver<Vec<u8>>,
}

/// Creates a pipe with both ends close-on-exec, returns (read, write)
pub fn os_pipe() -> io::Result<(fs::File, fs::File)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe2 writes
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((fs::File::from(r), fs::File::from(w)))
}

/// Pipe whose read end copies at most `limit` bytes into `writer`,
/// then discards the rest so the writing program never blocks.
/// Returns the write end and a receiver fired after the limited copy.
pub(crate) fn new_pipe<W>(mut writer: W, limit: ByteSize) -> io::Result<(fs::File, oneshot::Receiver<W>)>
where
    W: Write + Send + 'static,
{
    let (r, w) = os_pipe()?;
    let (tx, rx) = oneshot::channel();
    thread::spawn(move || {
        let mut r = r;
        let _ = io::copy(&mut (&mut r).take(limit.bytes()), &mut writer);
        let _ = tx.send(writer);
        let _ = io::copy(&mut r, &mut io::sink());
    });
    Ok((w, rx))
}

/// Collector pipe buffering up to `limit + 1` bytes so overflow is detectable
pub(crate) fn new_pipe_buffer(
    name: &str,
    limit: ByteSize,
) -> io::Result<(fs::File, PipeCollector)> {
    let (w, done) = new_pipe(Vec::new(), limit + ByteSize(1))?;
    Ok((
        w,
        PipeCollector {
            name: name.to_string(),
            limit,
            done,
        },
    ))
}

/// Connects the producer read end to the consumer write end through a
/// copier, capturing the first `limit` bytes into a store file
pub(crate) fn pipe_proxy(
    pipe: &Pipe,
    src: fs::File,
    dst: fs::File,
    store: fs::File,
) -> PipeCollector {
    #[cfg(target_os = "linux")]
    if !pipe.disable_zero_copy {
        return super::pipe_linux::pipe_proxy_zero_copy(pipe, src, dst, store);
    }
    pipe_proxy_copy(pipe, src, dst, store)
}

/// Portable proxy built on read / write
pub(crate) fn pipe_proxy_copy(
    pipe: &Pipe,
    mut src: fs::File,
    mut dst: fs::File,
    mut store: fs::File,
) -> PipeCollector {
    let (tx, rx) = oneshot::channel();
    let name = pipe.name.clone();
    let limit = pipe.limit.bytes() as usize;

    thread::spawn(move || {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut captured = 0usize;
        let mut capture = !name.is_empty();
        let mut dst_broken = false;

        loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            if capture && captured < limit {
                let take = n.min(limit - captured);
                if store.write_all(&buf[..take]).is_err() {
                    capture = false;
                } else {
                    captured += take;
                }
            }
            if !dst_broken && dst.write_all(&buf[..n]).is_err() {
                dst_broken = true;
            }
        }
        drop(dst);
        drop(src);
        let _ = tx.send(read_store(&mut store, captured));
    });

    PipeCollector {
        name: pipe.name.clone(),
        limit: pipe.limit,
        done: rx,
    }
}

/// Reads back the captured prefix of a store file
pub(crate) fn read_store(store: &mut fs::File, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    if store.seek(SeekFrom::Start(0)).is_ok() {
        let _ = store.take(len as u64).read_to_end(&mut out);
    }
    out
}

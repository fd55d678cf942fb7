use std::fs;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::sync::OnceLock;
use std::thread;

use tokio::sync::oneshot;

use super::pipe::{CHUNK_SIZE, Pipe, PipeCollector, read_store};

/// Shared write handle to /dev/null used to drain a broken consumer
fn dev_null() -> Option<&'static fs::File> {
    static DEV_NULL: OnceLock<Option<fs::File>> = OnceLock::new();
    DEV_NULL
        .get_or_init(|| fs::OpenOptions::new().write(true).open("/dev/null").ok())
        .as_ref()
}

fn tee(src: RawFd, dst: RawFd, len: usize) -> io::Result<usize> {
    loop {
        // SAFETY: plain syscall on descriptors owned by the proxy thread
        let n = unsafe { libc::tee(src, dst, len, 0) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn splice(src: RawFd, dst: RawFd, len: usize) -> io::Result<usize> {
    loop {
        // SAFETY: null offsets use and advance the file positions
        let n = unsafe {
            libc::splice(
                src,
                ptr::null_mut(),
                dst,
                ptr::null_mut(),
                len,
                libc::SPLICE_F_MOVE,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Moves exactly `len` bytes, tee guarantees they are already in `src`
fn splice_exact(src: RawFd, dst: RawFd, mut len: usize) -> io::Result<()> {
    while len > 0 {
        match splice(src, dst, len)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => len -= n,
        }
    }
    Ok(())
}

/// Proxy built on tee(2) and splice(2), the data never enters user space
///
/// While under the capture limit each chunk is teed into the consumer
/// and then spliced into the store file. Past the limit, or once the
/// store fails, chunks are spliced straight to the consumer. A consumer
/// that went away is replaced by /dev/null so the producer keeps draining.
pub(crate) fn pipe_proxy_zero_copy(
    pipe: &Pipe,
    src: fs::File,
    dst: fs::File,
    mut store: fs::File,
) -> PipeCollector {
    let (tx, rx) = oneshot::channel();
    let mut capture = !pipe.name.is_empty();
    let limit = pipe.limit.bytes() as usize;
    let name = pipe.name.clone();

    thread::spawn(move || {
        let src_fd = src.as_raw_fd();
        let dst_fd = dst.as_raw_fd();
        let store_fd = store.as_raw_fd();
        let discard_fd = dev_null().map(|f| f.as_raw_fd());

        let mut captured = 0usize;
        let mut dst_broken = false;

        loop {
            let mut chunk = CHUNK_SIZE;
            if capture && captured < limit {
                chunk = chunk.min(limit - captured);
                if !dst_broken {
                    match tee(src_fd, dst_fd, chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            if splice_exact(src_fd, store_fd, n).is_err() {
                                log::warn!("proxy {name}: store failed, capture stopped");
                                capture = false;
                                // the teed bytes are still queued in src, drop them
                                if let Some(fd) = discard_fd {
                                    let _ = splice_exact(src_fd, fd, n);
                                }
                            }
                            captured += n;
                            continue;
                        }
                        // handle this chunk below via the store only
                        Err(_) => dst_broken = true,
                    }
                }
                match splice(src_fd, store_fd, chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        captured += n;
                        continue;
                    }
                    Err(_) => capture = false,
                }
            }

            let target = match (dst_broken, discard_fd) {
                (false, _) => dst_fd,
                (true, Some(fd)) => fd,
                (true, None) => break,
            };
            match splice(src_fd, target, chunk) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) if !dst_broken => dst_broken = true,
                Err(_) => break,
            }
        }

        drop(dst);
        drop(src);
        log::debug!("proxy {name} finished, captured {captured} bytes");
        let _ = tx.send(read_store(&mut store, captured.min(limit)));
    });

    PipeCollector {
        name: pipe.name.clone(),
        limit: pipe.limit,
        done: rx,
    }
}

#[cfg(test)]
mod tests {
    use crate::envexec::pipe::tests::{pattern, run_proxy};

    #[tokio::test]
    async fn test_proxy_zero_copy_data_integrity() {
        let data = pattern(10 << 20);
        let (seen, captured) = run_proxy(true, data.clone(), 5 << 20, None).await;
        assert_eq!(seen.len(), data.len());
        assert!(seen == data);
        assert!(captured == data[..5 << 20]);
    }

    #[tokio::test]
    async fn test_proxy_zero_copy_drains_on_consumer_exit() {
        let data = pattern(20 << 20);
        let (seen, captured) = run_proxy(true, data.clone(), 10 << 20, Some(2 << 20)).await;
        assert_eq!(seen.len(), 2 << 20);
        assert!(captured == data[..10 << 20]);
    }
}

use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use super::pipe::os_pipe;

static MEMFD_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

fn memfd(name: &str) -> io::Result<fs::File> {
    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is a valid NUL terminated string for the duration of the call
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the descriptor was just created and is not shared
    Ok(fs::File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Default store for captured proxy output: an anonymous in-memory file
pub fn new_memfd_store() -> io::Result<fs::File> {
    memfd("store").or_else(|_| tempfile::tempfile())
}

/// Materializes a reader as a file positioned at its start
///
/// Uses a memfd copy. Once memfd creation fails the process switches to a
/// pipe fed by a background thread for all later calls.
pub(crate) fn reader_to_file(mut reader: Box<dyn Read + Send>) -> io::Result<fs::File> {
    if !MEMFD_UNAVAILABLE.load(Ordering::Relaxed) {
        match memfd("input") {
            Ok(mut file) => {
                io::copy(&mut reader, &mut file)?;
                file.seek(SeekFrom::Start(0))?;
                return Ok(file);
            }
            Err(e) => {
                log::warn!("memfd unavailable, falling back to pipes: {e}");
                MEMFD_UNAVAILABLE.store(true, Ordering::Relaxed);
            }
        }
    }
    reader_to_pipe(reader)
}

/// Pipe whose write end is fed from `reader` by a background thread
pub(crate) fn reader_to_pipe(mut reader: Box<dyn Read + Send>) -> io::Result<fs::File> {
    let (r, mut w) = os_pipe()?;
    thread::spawn(move || {
        let _ = io::copy(&mut reader, &mut w);
    });
    Ok(r)
}

/// Opens a pty pair, returns (master, slave), both close-on-exec
pub(crate) fn open_pty() -> io::Result<(fs::File, fs::File)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    // SAFETY: out pointers are valid, name / termios / winsize are optional
    let ret = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null(),
            std::ptr::null(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created by openpty
    let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };
    for fd in [&master, &slave] {
        set_cloexec(fd)?;
    }
    Ok((fs::File::from(master), fs::File::from(slave)))
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    // SAFETY: fcntl on a valid descriptor
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Copies every regular file under `src` into `dst`, keeping the layout
pub(crate) fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::cmd::ByteSize;

/// Source or sink bound to one fd of a command
pub enum File {
    /// Already opened file, handed to the process as is
    Opened(fs::File),
    /// Content read before exec, or piped in while running when `stream` is set
    Reader {
        reader: Box<dyn Read + Send>,
        stream: bool,
    },
    /// Host file opened read-only
    Input(PathBuf),
    /// Output captured into memory (`pipe`) or through a work-dir file
    Collector {
        name: String,
        limit: ByteSize,
        pipe: bool,
    },
    /// Output piped into a writer, anything past `limit` is discarded
    Writer {
        writer: Box<dyn Write + Send>,
        limit: ByteSize,
    },
    StreamIn(FileStreamIn),
    StreamOut(FileStreamOut),
}

impl File {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        File::Reader {
            reader: Box::new(reader),
            stream: false,
        }
    }

    pub fn collector(name: impl Into<String>, limit: ByteSize) -> Self {
        File::Collector {
            name: name.into(),
            limit,
            pipe: true,
        }
    }

    /// Turns a readable variant into a reader for copy-in
    pub fn into_reader(self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            File::Opened(f) => Ok(Box::new(f)),
            File::Reader { reader, .. } => Ok(reader),
            File::Input(path) => Ok(Box::new(fs::File::open(path)?)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file cannot open as reader: {other:?}"),
            )),
        }
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            File::Opened(file) => write!(f, "Opened(fd {})", file.as_raw_fd()),
            File::Reader { stream, .. } => write!(f, "Reader {{ stream: {stream} }}"),
            File::Input(path) => write!(f, "Input({})", path.display()),
            File::Collector { name, limit, pipe } => {
                write!(f, "Collector {{ name: {name:?}, limit: {limit}, pipe: {pipe} }}")
            }
            File::Writer { limit, .. } => write!(f, "Writer {{ limit: {limit} }}"),
            File::StreamIn(_) => f.write_str("StreamIn"),
            File::StreamOut(_) => f.write_str("StreamOut"),
        }
    }
}

/// Reference counted file closed once the last holder releases it
///
/// Used for the pty master, which several copier threads and stream
/// handles read from or write to.
pub struct SharedFile {
    state: Mutex<SharedState>,
}

struct SharedState {
    file: Option<Arc<fs::File>>,
    count: usize,
}

impl SharedFile {
    pub fn new(file: fs::File) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SharedState {
                file: Some(Arc::new(file)),
                count: 0,
            }),
        })
    }

    pub fn acquire(&self) {
        self.state.lock().count += 1;
    }

    /// Returns a handle for IO, `None` once closed
    pub fn handle(&self) -> Option<Arc<fs::File>> {
        self.state.lock().file.clone()
    }

    /// Drops one reference, the file is closed when the count reaches zero
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            state.file.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().file.is_none()
    }
}

/// Terminal window size applied to the pty master
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
    pub x: u16,
    pub y: u16,
}

enum StreamState {
    Pending,
    Started(Arc<SharedFile>),
    Closed,
}

struct StreamShared {
    state: Mutex<StreamState>,
    started: Condvar,
}

impl StreamShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StreamState::Pending),
            started: Condvar::new(),
        })
    }

    fn start(&self, file: Arc<SharedFile>) {
        let mut state = self.state.lock();
        match *state {
            StreamState::Pending => {
                file.acquire();
                *state = StreamState::Started(file);
                self.started.notify_all();
            }
            // closed before the run started, nobody will use the pipe end
            StreamState::Closed | StreamState::Started(_) => {}
        }
    }

    /// Blocks until the stream is started or closed
    fn wait_file(&self) -> Option<Arc<fs::File>> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                StreamState::Pending => self.started.wait(&mut state),
                StreamState::Started(shared) => return shared.handle(),
                StreamState::Closed => return None,
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, StreamState::Closed) {
            StreamState::Started(shared) => {
                shared.release();
                self.started.notify_all();
                Ok(())
            }
            StreamState::Pending => {
                self.started.notify_all();
                Ok(())
            }
            StreamState::Closed => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn abandon(&self) {
        let mut state = self.state.lock();
        if matches!(*state, StreamState::Pending) {
            *state = StreamState::Closed;
            self.started.notify_all();
        }
    }
}

/// Write side of an input stream, connected once the command starts
///
/// Writes block until the command has started. Closing the handle closes
/// the pipe, which the program sees as end of input.
#[derive(Clone)]
pub struct FileStreamIn {
    shared: Arc<StreamShared>,
}

impl FileStreamIn {
    pub fn new() -> Self {
        Self {
            shared: StreamShared::new(),
        }
    }

    pub(crate) fn start(&self, file: Arc<SharedFile>) {
        self.shared.start(file)
    }

    pub fn close(&self) -> io::Result<()> {
        self.shared.close()
    }

    /// Marks a stream that never started as closed so blocked writers return
    pub fn abandon(&self) {
        self.shared.abandon()
    }

    pub fn set_size(&self, size: TerminalSize) -> io::Result<()> {
        let file = self
            .shared
            .wait_file()
            .ok_or(io::ErrorKind::BrokenPipe)?;
        let ws = libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.x,
            ws_ypixel: size.y,
        };
        // SAFETY: fd is valid while `file` is held and `ws` outlives the call
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Default for FileStreamIn {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for FileStreamIn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.shared.wait_file() {
            Some(file) => (&*file).write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read side of an output stream, connected once the command starts
#[derive(Clone)]
pub struct FileStreamOut {
    shared: Arc<StreamShared>,
}

impl FileStreamOut {
    pub fn new() -> Self {
        Self {
            shared: StreamShared::new(),
        }
    }

    pub(crate) fn start(&self, file: Arc<SharedFile>) {
        self.shared.start(file)
    }

    pub fn close(&self) -> io::Result<()> {
        self.shared.close()
    }

    /// Marks a stream that never started as closed so blocked readers see EOF
    pub fn abandon(&self) {
        self.shared.abandon()
    }
}

impl Default for FileStreamOut {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for FileStreamOut {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.shared.wait_file() {
            Some(file) => match (&*file).read(buf) {
                // pty master reports EIO once the slave side is gone
                Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
                other => other,
            },
            None => Ok(0),
        }
    }
}

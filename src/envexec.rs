//! Execution engine: file binding, fd preparation, pipes and the
//! single / group run orchestration on top of an [`Environment`].

mod cmd;
mod copy;
mod file;
mod group;
mod interface;
mod pipe;
#[cfg(target_os = "linux")]
mod pipe_linux;
mod prepare;
mod run;
mod single;
mod status;
mod util;

#[cfg(test)]
pub(crate) mod test_util;

pub use cmd::{ByteSize, Cmd, CopyOutFile, ExecResult, ExecveParam, Limit, RunnerResult, Usage};
pub use file::{File, FileStreamIn, FileStreamOut, SharedFile, TerminalSize};
pub use group::Group;
pub use interface::{Environment, Process, ProcessState, Waiter, resolve_in};
pub use pipe::{NewStoreFile, Pipe, PipeIndex, os_pipe};
pub use prepare::PrepareError;
pub use run::DEFAULT_EXTRA_MEMORY_LIMIT;
pub use single::Single;
pub use status::{FileError, FileErrorKind, RunnerStatus, Status, StatusParseError};
pub use util::new_memfd_store;

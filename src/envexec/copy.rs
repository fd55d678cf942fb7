use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;

use super::cmd::{ByteSize, CopyOutFile};
use super::file::File;
use super::interface::Environment;
use super::pipe::PipeCollector;
use super::prepare::FileCollector;
use super::status::{FileError, FileErrorKind};
use super::util::copy_dir;

/// Copies every file into the environment in parallel
///
/// Returns one error per file that could not be copied.
pub(crate) async fn copy_in(env: &Arc<dyn Environment>, files: HashMap<String, File>) -> Vec<FileError> {
    let mut tasks = JoinSet::new();
    for (name, file) in files {
        let env = env.clone();
        tasks.spawn_blocking(move || copy_in_file(env.as_ref(), &name, file).err());
    }

    let mut errors = Vec::new();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Some(e)) => errors.push(e),
            Ok(None) => {}
            Err(e) => errors.push(FileError::new("", FileErrorKind::CopyInCopyContent, e)),
        }
    }
    errors
}

fn copy_in_file(env: &dyn Environment, name: &str, file: File) -> Result<(), FileError> {
    let err = |kind, e: io::Error| FileError::new(name, kind, e);

    let mut reader = file
        .into_reader()
        .map_err(|e| err(FileErrorKind::CopyInOpenFile, e))?;

    let parent = Path::new(name).parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        env.mkdir_all(&parent.to_string_lossy())
            .map_err(|e| err(FileErrorKind::CopyInCreateDir, e))?;
    }
    let mut target = env
        .open(name, OpenOptions::new().write(true).create(true).truncate(true))
        .map_err(|e| err(FileErrorKind::CopyInCreateFile, e))?;
    io::copy(&mut reader, &mut target).map_err(|e| err(FileErrorKind::CopyInCopyContent, e))?;
    Ok(())
}

/// Creates the symbolic links, stopping at the first failure
pub(crate) fn symlink(env: &dyn Environment, links: &HashMap<String, String>) -> Result<(), FileError> {
    for (link, target) in links {
        env.symlink(target, link)
            .map_err(|e| FileError::new(link.as_str(), FileErrorKind::Symlink, e))?;
    }
    Ok(())
}

/// What to gather from the environment once the program exited
pub(crate) struct CopyOutRequest {
    pub copy_out: Vec<CopyOutFile>,
    pub max: ByteSize,
    pub truncate: bool,
    pub dir: Option<PathBuf>,
    pub pipe_collectors: Vec<PipeCollector>,
    pub file_collectors: Vec<FileCollector>,
}

/// Files gathered after a run and the failures found while gathering them
#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub files: HashMap<String, Vec<u8>>,
    pub file_error: Vec<FileError>,
    /// A collector went over its limit
    pub output_exceeded: bool,
    /// First failure message, used as the result error
    pub error: Option<String>,
}

impl Collected {
    fn fail(&mut self, e: FileError) {
        if e.kind == FileErrorKind::CollectSizeExceeded {
            self.output_exceeded = true;
        }
        self.error.get_or_insert_with(|| e.to_string());
        self.file_error.push(e);
    }
}

enum Gathered {
    File(String, Vec<u8>),
    Missing,
    Failed(Option<(String, Vec<u8>)>, FileError),
    Done,
}

/// Reads copy-out files, collectors and the copy-out dir in parallel
pub(crate) async fn copy_out_and_collect(env: &Arc<dyn Environment>, req: CopyOutRequest) -> Collected {
    let mut tasks = JoinSet::new();

    for file in req.copy_out {
        let env = env.clone();
        let (max, truncate) = (req.max, req.truncate);
        tasks.spawn_blocking(move || copy_out_file(env.as_ref(), file, max, truncate));
    }

    for collector in req.file_collectors {
        let env = env.clone();
        tasks.spawn_blocking(move || collect_file(env.as_ref(), collector));
    }

    for collector in req.pipe_collectors {
        tasks.spawn(async move {
            let Ok(mut buf) = collector.done.await else {
                let e = FileError::new(
                    collector.name.as_str(),
                    FileErrorKind::CopyOutCopyContent,
                    "collector closed without result",
                );
                return Gathered::Failed(None, e);
            };
            let limit = collector.limit.bytes() as usize;
            if buf.len() > limit {
                buf.truncate(limit);
                let e = FileError::new(
                    collector.name.as_str(),
                    FileErrorKind::CollectSizeExceeded,
                    format!("exceeded the limit ({limit})"),
                );
                return Gathered::Failed(Some((collector.name, buf)), e);
            }
            Gathered::File(collector.name, buf)
        });
    }

    if let Some(dir) = req.dir {
        let src = env.work_dir().to_path_buf();
        tasks.spawn_blocking(move || match copy_dir(&src, &dir) {
            Ok(()) => Gathered::Done,
            Err(e) => Gathered::Failed(
                None,
                FileError::new(
                    dir.to_string_lossy(),
                    FileErrorKind::CopyOutCopyContent,
                    format!("copy out dir: {e}"),
                ),
            ),
        });
    }

    let mut collected = Collected::default();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Gathered::File(name, content)) => {
                collected.files.insert(name, content);
            }
            Ok(Gathered::Failed(partial, e)) => {
                if let Some((name, content)) = partial {
                    collected.files.insert(name, content);
                }
                collected.fail(e);
            }
            Ok(Gathered::Missing | Gathered::Done) => {}
            Err(e) => collected.fail(FileError::new("", FileErrorKind::CopyOutCopyContent, e)),
        }
    }
    collected
}

fn failed(name: &str, kind: FileErrorKind, message: impl std::fmt::Display) -> Gathered {
    Gathered::Failed(None, FileError::new(name, kind, message))
}

fn copy_out_file(env: &dyn Environment, file: CopyOutFile, max: ByteSize, truncate: bool) -> Gathered {
    let name = file.name;
    let f = match env.open(&name, OpenOptions::new().read(true)) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound && file.optional => return Gathered::Missing,
        Err(e) => return failed(&name, FileErrorKind::CopyOutOpen, e),
    };
    let meta = match f.metadata() {
        Ok(m) => m,
        Err(e) => return failed(&name, FileErrorKind::CopyOutOpen, e),
    };
    if !meta.is_file() {
        return failed(&name, FileErrorKind::CopyOutNotRegularFile, format!("{name}: not a regular file"));
    }

    let mut size = meta.len();
    if max.bytes() > 0 && size > max.bytes() {
        if !truncate {
            let message = format!("{name}: size ({size}) exceeded the limit ({})", max.bytes());
            return failed(&name, FileErrorKind::CopyOutSizeExceeded, message);
        }
        size = max.bytes();
    }

    let mut content = Vec::with_capacity(size as usize);
    // never read past the size checked above
    if let Err(e) = f.take(size).read_to_end(&mut content) {
        return failed(&name, FileErrorKind::CopyOutCopyContent, e);
    }
    Gathered::File(name, content)
}

fn collect_file(env: &dyn Environment, collector: FileCollector) -> Gathered {
    let FileCollector { name, limit } = collector;
    let f = match env.open(&name, OpenOptions::new().read(true)) {
        Ok(f) => f,
        Err(e) => return failed(&name, FileErrorKind::CopyOutOpen, e),
    };

    let mut content = Vec::new();
    if let Err(e) = f.take(limit.bytes() + 1).read_to_end(&mut content) {
        return failed(&name, FileErrorKind::CopyOutCopyContent, e);
    }
    if content.len() as u64 > limit.bytes() {
        content.truncate(limit.bytes() as usize);
        let e = FileError::new(
            name.as_str(),
            FileErrorKind::CollectSizeExceeded,
            format!("exceeded the limit ({})", limit.bytes()),
        );
        return Gathered::Failed(Some((name, content)), e);
    }
    Gathered::File(name, content)
}

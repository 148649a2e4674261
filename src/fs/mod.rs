//! File-operation manager.
//!
//! Operations are queued at submission and dispatched to the blocking pool
//! on the next loop iteration - never inline with the caller. Each
//! operation returns a cancellable handle; the cancel flag is checked
//! before every externally observable step on the worker and once more
//! before the completion callback, so a cancelled op neither touches the
//! filesystem further nor reports back.

mod watch;

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::runtime::tick::run_guarded;

pub use watch::{FileChange, FileWatchId};

/// Opaque file-op identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileOpId(u64);

impl std::fmt::Display for FileOpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fileop-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpKind {
    Read,
    Write,
    Append,
    Delete,
    Exists,
    Stat,
    Mkdir,
    Rmdir,
    Copy,
    Rename,
}

/// Recognized knobs, enumerated. Fields that make no sense for an
/// operation are ignored by it.
#[derive(Debug, Clone, Default)]
pub struct FileOpOptions {
    /// Byte offset for reads and in-place writes.
    pub offset: Option<u64>,
    /// Cap on bytes read.
    pub length: Option<usize>,
    /// Create missing parent directories before writing.
    pub create_directories: bool,
    /// Unix permission bits applied to created files/directories.
    pub mode: Option<u32>,
    /// Recursive mkdir / rmdir / delete.
    pub recursive: bool,
    /// Fail a write if the file already exists.
    pub exclusive: bool,
}

/// One file operation.
#[derive(Debug, Clone)]
pub struct FileOp {
    pub kind: FileOpKind,
    pub path: PathBuf,
    /// Target path for copy / rename.
    pub dest: Option<PathBuf>,
    /// Payload for write / append.
    pub data: Option<Vec<u8>>,
    pub options: FileOpOptions,
}

impl FileOp {
    fn new(kind: FileOpKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            dest: None,
            data: None,
            options: FileOpOptions::default(),
        }
    }

    pub fn read(path: impl Into<PathBuf>) -> Self {
        Self::new(FileOpKind::Read, path)
    }

    pub fn write(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        let mut op = Self::new(FileOpKind::Write, path);
        op.data = Some(data);
        op
    }

    pub fn append(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        let mut op = Self::new(FileOpKind::Append, path);
        op.data = Some(data);
        op
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self::new(FileOpKind::Delete, path)
    }

    pub fn exists(path: impl Into<PathBuf>) -> Self {
        Self::new(FileOpKind::Exists, path)
    }

    pub fn stat(path: impl Into<PathBuf>) -> Self {
        Self::new(FileOpKind::Stat, path)
    }

    pub fn mkdir(path: impl Into<PathBuf>) -> Self {
        Self::new(FileOpKind::Mkdir, path)
    }

    pub fn rmdir(path: impl Into<PathBuf>) -> Self {
        Self::new(FileOpKind::Rmdir, path)
    }

    pub fn copy(path: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        let mut op = Self::new(FileOpKind::Copy, path);
        op.dest = Some(dest.into());
        op
    }

    pub fn rename(path: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        let mut op = Self::new(FileOpKind::Rename, path);
        op.dest = Some(dest.into());
        op
    }

    pub fn with_options(mut self, options: FileOpOptions) -> Self {
        self.options = options;
        self
    }
}

/// Result payload, tagged by shape.
#[derive(Debug, Clone)]
pub enum FileOpOutput {
    Bytes(Vec<u8>),
    Written(u64),
    Flag(bool),
    Stat(FileStat),
    Done,
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub len: u64,
    pub is_dir: bool,
    pub is_file: bool,
    pub readonly: bool,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
    pub mode: u32,
}

/// Cancellable handle to a queued or running file operation.
#[derive(Debug, Clone)]
pub struct FileOpHandle {
    id: FileOpId,
    cancelled: Arc<AtomicBool>,
}

impl FileOpHandle {
    pub fn id(&self) -> FileOpId {
        self.id
    }

    /// Flag the operation as cancelled. Returns `false` if it was flagged
    /// before. A cancelled operation never invokes its callback.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

type FsCallback = Box<dyn FnOnce(Result<FileOpOutput>)>;

struct QueuedOp {
    id: FileOpId,
    op: FileOp,
    cancelled: Arc<AtomicBool>,
    callback: FsCallback,
}

#[derive(Default)]
pub(crate) struct FsState {
    queued: VecDeque<QueuedOp>,
    pub(crate) watchers: watch::WatcherMap,
    next_op_id: u64,
}

impl FsState {
    pub(crate) fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.watchers.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.queued.clear();
        watch::deactivate_all(&mut self.watchers);
    }
}

impl Handle {
    /// Queue a file operation. It starts on the next loop iteration;
    /// `callback` fires with the outcome unless the op is cancelled first.
    pub fn file_op(
        &self,
        op: FileOp,
        callback: impl FnOnce(Result<FileOpOutput>) + 'static,
    ) -> FileOpHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.shared().fs.borrow_mut();
        let id = FileOpId(state.next_op_id);
        state.next_op_id += 1;
        state.queued.push_back(QueuedOp {
            id,
            op,
            cancelled: Arc::clone(&cancelled),
            callback: Box::new(callback),
        });
        tracing::trace!(%id, "file op queued");
        FileOpHandle { id, cancelled }
    }
}

/// Dispatch queued operations to the blocking pool. Called once per loop
/// iteration.
pub(crate) fn process(handle: &Handle) -> bool {
    let batch: Vec<QueuedOp> = {
        let mut state = handle.shared().fs.borrow_mut();
        state.queued.drain(..).collect()
    };
    let any = !batch.is_empty();
    for queued in batch {
        if queued.cancelled.load(Ordering::SeqCst) {
            tracing::trace!(op = %queued.id, "dropping cancelled file op");
            continue;
        }
        let worker_flag = Arc::clone(&queued.cancelled);
        let loop_flag = queued.cancelled;
        let op = queued.op;
        let callback = queued.callback;
        handle.unblock(
            move || execute(op, &worker_flag),
            move |result| {
                // Checked again on the loop side: a cancel that landed while
                // the op ran must still suppress the callback.
                if loop_flag.load(Ordering::SeqCst) {
                    return;
                }
                run_guarded(Box::new(move || callback(result)));
            },
        );
    }
    any
}

fn check(cancelled: &AtomicBool) -> Result<()> {
    if cancelled.load(Ordering::SeqCst) {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn apply_mode(path: &std::path::Path, mode: Option<u32>) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Runs on a blocking-pool worker.
fn execute(op: FileOp, cancelled: &AtomicBool) -> Result<FileOpOutput> {
    check(cancelled)?;
    match op.kind {
        FileOpKind::Read => {
            let mut file = std::fs::File::open(&op.path)?;
            if let Some(offset) = op.options.offset {
                file.seek(SeekFrom::Start(offset))?;
            }
            check(cancelled)?;
            let mut data = Vec::new();
            match op.options.length {
                Some(length) => {
                    data.resize(length, 0);
                    let mut filled = 0;
                    while filled < length {
                        let n = file.read(&mut data[filled..])?;
                        if n == 0 {
                            break;
                        }
                        filled += n;
                    }
                    data.truncate(filled);
                }
                None => {
                    file.read_to_end(&mut data)?;
                }
            }
            Ok(FileOpOutput::Bytes(data))
        }

        FileOpKind::Write => {
            if op.options.create_directories
                && let Some(parent) = op.path.parent()
            {
                std::fs::create_dir_all(parent)?;
                check(cancelled)?;
            }
            let data = op.data.unwrap_or_default();
            let mut open = std::fs::OpenOptions::new();
            open.write(true);
            if op.options.exclusive {
                open.create_new(true);
            } else {
                open.create(true);
            }
            match op.options.offset {
                Some(offset) => {
                    let mut file = open.open(&op.path)?;
                    check(cancelled)?;
                    file.seek(SeekFrom::Start(offset))?;
                    file.write_all(&data)?;
                }
                None => {
                    open.truncate(true);
                    let mut file = open.open(&op.path)?;
                    check(cancelled)?;
                    file.write_all(&data)?;
                }
            }
            apply_mode(&op.path, op.options.mode)?;
            Ok(FileOpOutput::Written(data.len() as u64))
        }

        FileOpKind::Append => {
            let data = op.data.unwrap_or_default();
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&op.path)?;
            check(cancelled)?;
            file.write_all(&data)?;
            Ok(FileOpOutput::Written(data.len() as u64))
        }

        FileOpKind::Delete => {
            std::fs::remove_file(&op.path)?;
            Ok(FileOpOutput::Done)
        }

        FileOpKind::Exists => Ok(FileOpOutput::Flag(op.path.exists())),

        FileOpKind::Stat => {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(&op.path)?;
            Ok(FileOpOutput::Stat(FileStat {
                len: meta.len(),
                is_dir: meta.is_dir(),
                is_file: meta.is_file(),
                readonly: meta.permissions().readonly(),
                modified: meta.modified().ok(),
                accessed: meta.accessed().ok(),
                created: meta.created().ok(),
                mode: meta.permissions().mode(),
            }))
        }

        FileOpKind::Mkdir => {
            if op.options.recursive || op.options.create_directories {
                std::fs::create_dir_all(&op.path)?;
            } else {
                std::fs::create_dir(&op.path)?;
            }
            apply_mode(&op.path, op.options.mode)?;
            Ok(FileOpOutput::Done)
        }

        FileOpKind::Rmdir => {
            if op.options.recursive {
                std::fs::remove_dir_all(&op.path)?;
            } else {
                std::fs::remove_dir(&op.path)?;
            }
            Ok(FileOpOutput::Done)
        }

        FileOpKind::Copy => {
            let dest = op
                .dest
                .ok_or_else(|| Error::BadConfig("copy needs a destination path".into()))?;
            let written = std::fs::copy(&op.path, &dest)?;
            Ok(FileOpOutput::Written(written))
        }

        FileOpKind::Rename => {
            let dest = op
                .dest
                .ok_or_else(|| Error::BadConfig("rename needs a destination path".into()))?;
            std::fs::rename(&op.path, &dest)?;
            Ok(FileOpOutput::Done)
        }
    }
}

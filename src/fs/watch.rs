//! File watchers: poll mtime and existence at a fixed interval on the
//! loop's timer wheel, with the stat itself offloaded to the blocking
//! pool.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use crate::runtime::Handle;
use crate::runtime::tick::run_guarded;

/// Opaque watcher identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileWatchId(u64);

impl std::fmt::Display for FileWatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "filewatch-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Snapshot {
    exists: bool,
    mtime: Option<SystemTime>,
}

impl Snapshot {
    fn take(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(meta) => Self {
                exists: true,
                mtime: meta.modified().ok(),
            },
            Err(_) => Self {
                exists: false,
                mtime: None,
            },
        }
    }

    fn diff(before: Snapshot, after: Snapshot) -> Option<FileChange> {
        match (before.exists, after.exists) {
            (false, true) => Some(FileChange::Created),
            (true, false) => Some(FileChange::Removed),
            (true, true) if before.mtime != after.mtime => Some(FileChange::Modified),
            _ => None,
        }
    }
}

type WatchCallback = Box<dyn FnMut(FileChange, &Path)>;

pub(crate) struct WatchState {
    id: FileWatchId,
    path: PathBuf,
    interval: Duration,
    callback: RefCell<WatchCallback>,
    active: Cell<bool>,
    last: Cell<Option<Snapshot>>,
}

pub(crate) type WatcherMap = HashMap<FileWatchId, Rc<WatchState>>;

pub(crate) fn deactivate_all(watchers: &mut WatcherMap) {
    for state in watchers.values() {
        state.active.set(false);
    }
    watchers.clear();
}

static NEXT_WATCH_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

impl Handle {
    /// Poll `path` every `interval`; `callback` fires with the change kind
    /// whenever the file appears, disappears, or its mtime moves. The
    /// first poll establishes the baseline without firing.
    pub fn watch_file(
        &self,
        path: impl Into<PathBuf>,
        interval: Duration,
        callback: impl FnMut(FileChange, &Path) + 'static,
    ) -> FileWatchId {
        let id = FileWatchId(NEXT_WATCH_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        let state = Rc::new(WatchState {
            id,
            path: path.into(),
            interval,
            callback: RefCell::new(Box::new(callback)),
            active: Cell::new(true),
            last: Cell::new(None),
        });
        self.shared()
            .fs
            .borrow_mut()
            .watchers
            .insert(id, Rc::clone(&state));
        tracing::debug!(%id, path = %state.path.display(), "file watcher armed");
        arm(self, state);
        id
    }

    /// Stop a watcher. Returns `false` for unknown ids.
    pub fn unwatch_file(&self, id: FileWatchId) -> bool {
        let removed = self.shared().fs.borrow_mut().watchers.remove(&id);
        match removed {
            Some(state) => {
                state.active.set(false);
                true
            }
            None => false,
        }
    }
}

fn arm(handle: &Handle, state: Rc<WatchState>) {
    let again = handle.clone();
    handle.set_timeout(state.interval, move || {
        if !state.active.get() {
            return;
        }
        let path = state.path.clone();
        let state2 = Rc::clone(&state);
        let rearm = again.clone();
        again.unblock(
            move || Snapshot::take(&path),
            move |snapshot| {
                if !state2.active.get() {
                    return;
                }
                let before = state2.last.replace(Some(snapshot));
                if let Some(before) = before
                    && let Some(change) = Snapshot::diff(before, snapshot)
                {
                    tracing::debug!(watch = %state2.id, ?change, "file changed");
                    let state3 = Rc::clone(&state2);
                    run_guarded(Box::new(move || {
                        let mut callback = state3.callback.borrow_mut();
                        (*callback)(change, &state3.path);
                    }));
                }
                arm(&rearm, state2);
            },
        );
    });
}

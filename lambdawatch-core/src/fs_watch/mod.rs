//! Filesystem event source.
//!
//! A thin wrapper around `notify` that maps raw notifications onto
//! [`WatchEvent`]s and forwards them into the session's channel. The
//! completion logic only ever sees the channel, so tests and the batch mode
//! feed it directly.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::error::{Result, WatchError};

pub mod rescan;

pub use rescan::{RescanReport, rescan};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
}

/// One filesystem observation, stamped when it was received (or, for
/// synthetic events, with the file's modification time).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    pub observed_at: DateTime<Utc>,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind, observed_at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at,
        }
    }

    /// Synthetic `Created` event for a file already on disk, stamped with
    /// its modification time.
    pub fn from_existing(path: &Path) -> std::io::Result<Self> {
        let modified = std::fs::metadata(path)?.modified()?;
        Ok(Self::new(
            path,
            WatchEventKind::Created,
            DateTime::<Utc>::from(modified),
        ))
    }
}

/// Message on the event channel consumed by a session.
pub enum WatchMessage {
    Event(WatchEvent),
    /// The event source broke; the session cannot trust its view any more.
    Failed(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path", &event.path)
                .finish(),
            WatchMessage::Failed(message) => f
                .debug_struct("WatchMessage::Failed")
                .field("message", message)
                .finish(),
        }
    }
}

/// A live `notify` watcher on one root. Dropping it stops the stream.
pub struct FsWatchService {
    root: PathBuf,
    recursive: bool,
    _watcher: RecommendedWatcher,
}

impl fmt::Debug for FsWatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsWatchService")
            .field("root", &self.root)
            .field("recursive", &self.recursive)
            .finish()
    }
}

impl FsWatchService {
    /// Start watching `root`, forwarding every mapped event into `tx`.
    pub async fn start(
        root: &Path,
        recursive: bool,
        tx: mpsc::Sender<WatchMessage>,
    ) -> Result<Self> {
        if !root.is_dir() {
            return Err(WatchError::MissingDirectory(root.to_path_buf()));
        }

        let watch_root = root.to_path_buf();
        let watcher = spawn_blocking(move || init_watcher(&watch_root, recursive, tx))
            .await
            .map_err(|err| {
                WatchError::Internal(format!("watcher initialization panicked: {err}"))
            })??;

        info!(root = %root.display(), recursive, "filesystem watcher started");

        Ok(Self {
            root: root.to_path_buf(),
            recursive,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn init_watcher(
    root: &Path,
    recursive: bool,
    tx: mpsc::Sender<WatchMessage>,
) -> Result<RecommendedWatcher> {
    let root_label = root.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                let observed_at = Utc::now();
                for mapped in convert_event(event, observed_at) {
                    if let Err(err) = tx.blocking_send(WatchMessage::Event(mapped)) {
                        warn!(
                            "fs_watch channel send failed for {}: {}",
                            root_label.display(),
                            err
                        );
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Failed(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )?;

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(root, mode)?;
    Ok(watcher)
}

/// Map one notify event onto zero or more watch events.
fn convert_event(event: Event, observed_at: DateTime<Utc>) -> Vec<WatchEvent> {
    let stamp = |path: PathBuf, kind| WatchEvent::new(path, kind, observed_at);
    let mut paths = event.paths.into_iter();

    match event.kind {
        EventKind::Create(_) => paths
            .map(|path| stamp(path, WatchEventKind::Created))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .take(1)
            .map(|path| stamp(path, WatchEventKind::Created))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .take(1)
            .map(|path| stamp(path, WatchEventKind::Deleted))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut mapped = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                mapped.push(stamp(from, WatchEventKind::Deleted));
            }
            if let Some(to) = paths.next() {
                mapped.push(stamp(to, WatchEventKind::Created));
            }
            mapped
        }
        EventKind::Modify(_) => paths
            .map(|path| stamp(path, WatchEventKind::Modified))
            .collect(),
        // A writer closing the file is the strongest "still changing" signal
        // inotify gives; every other access is noise.
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => paths
            .map(|path| stamp(path, WatchEventKind::Modified))
            .collect(),
        EventKind::Remove(_) => paths
            .map(|path| stamp(path, WatchEventKind::Deleted))
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

//! Filesystem notifications used to wake the scheduler between poll ticks.
//!
//! Events only shorten the time until changes are picked up. Every decision
//! about what to read is still made by the poll loop, so missed or coalesced
//! events never lose data.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;

use futures_util::ready;
use futures_util::stream::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// Watches the parent directories of tracked files and yields the tracked
/// paths that saw activity.
///
/// Directories are watched instead of the files themselves so that a file
/// being replaced at the same path keeps producing events.
pub struct FsEvents {
    inner: notify::RecommendedWatcher,
    /// Watched directories with the number of tracked files in each.
    watched_directories: HashMap<PathBuf, usize>,
    watched_files: HashSet<PathBuf>,
    event_stream: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl Debug for FsEvents {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("FsEvents")
            .field("watched_directories", &self.watched_directories)
            .field("watched_files", &self.watched_files)
            .finish()
    }
}

impl FsEvents {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The only way `send` can fail is if the receiver is dropped,
            // and `FsEvents` owns both.
            let _ = tx.send(res);
        })?;

        Ok(FsEvents {
            inner,
            watched_directories: HashMap::new(),
            watched_files: HashSet::new(),
            event_stream: rx,
        })
    }

    fn add_directory(&mut self, path: &Path) -> Result<()> {
        if !self.watched_directories.contains_key(path) {
            notify::Watcher::watch(&mut self.inner, path, notify::RecursiveMode::NonRecursive)?;
        }

        let count = self
            .watched_directories
            .entry(path.to_path_buf())
            .or_insert(0);
        *count += 1;

        Ok(())
    }

    fn remove_directory(&mut self, path: &Path) -> Result<()> {
        match self.watched_directories.get_mut(path) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                // Remove from map first in case `unwatch` fails.
                self.watched_directories.remove(path);
                notify::Watcher::unwatch(&mut self.inner, path)?;
            }
            None => {}
        }

        Ok(())
    }

    /// Starts reporting events for `path`.
    ///
    /// Returns the absolute form of the path, which is what events carry.
    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> Result<PathBuf> {
        let path = absolutify(path)?;

        if path.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path.display()),
            )));
        }

        if self.watched_files.contains(&path) {
            return Ok(path);
        }

        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file has no parent directory"))?
            .to_path_buf();

        self.add_directory(&parent)?;
        self.watched_files.insert(path.clone());

        Ok(path)
    }

    pub fn remove_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = absolutify(path)?;

        if self.watched_files.remove(&path) {
            if let Some(parent) = path.parent() {
                self.remove_directory(parent)?;
            }
        }

        Ok(())
    }

    fn relevant(&self, event: notify::Event) -> Vec<PathBuf> {
        match event.kind {
            notify::EventKind::Create(_)
            | notify::EventKind::Modify(_)
            | notify::EventKind::Remove(_)
            | notify::EventKind::Any => event
                .paths
                .into_iter()
                .filter(|path| self.watched_files.contains(path))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Stream for FsEvents {
    type Item = Vec<PathBuf>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match ready!(this.event_stream.poll_recv(cx)) {
                None => return task::Poll::Ready(None),
                Some(Err(e)) => debug!(error = %e, "filesystem watch error"),
                Some(Ok(event)) => {
                    let paths = this.relevant(event);
                    if !paths.is_empty() {
                        return task::Poll::Ready(Some(paths));
                    }
                }
            }
        }
    }
}

/// Makes `path` absolute with a canonical parent directory, leaving the file
/// name alone so that it need not exist.
fn absolutify(path: impl Into<PathBuf>) -> io::Result<PathBuf> {
    let path = path.into();

    let parent = match path.parent() {
        None => std::env::current_dir()?,
        Some(parent) if parent == Path::new("") => std::env::current_dir()?,
        Some(parent) => parent.to_path_buf(),
    };
    let filename = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?;

    let parent = parent.canonicalize().unwrap_or(parent);

    Ok(parent.join(filename))
}

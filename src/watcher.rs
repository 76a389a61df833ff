//! Everything related to following a single file across appends, truncation,
//! rotation and disappearance.

use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::buffer::LineBuffer;
use crate::emitter::RecordEmitter;
use crate::position::{Lookup, PositionStore};
use crate::rotation::{Change, FileId, RotationDetector, Snapshot};

/// Where to begin reading a file that has no checkpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StartPosition {
    /// Read the existing contents, like `tail -c +0`.
    Head,
    /// Only read what is appended from now on, like `tail -f`.
    #[default]
    Tail,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchState {
    /// Reading the file currently found at the path.
    Open,
    /// The path points at a new file; the old handle is drained until the
    /// grace window has passed.
    Rotating { since: Instant },
    /// The path cannot be found, or is no longer wanted.
    Missing { since: Instant },
    /// Terminal. The handle has been released.
    Closed,
}

/// Per-tick limits shared by all watchers.
#[derive(Clone, Copy, Debug)]
pub struct WatchOptions {
    /// How long a rotated or vanished file keeps being read.
    pub rotate_wait: Duration,
    /// Upper bound of bytes read from one file in a single tick.
    pub read_bytes_limit: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            rotate_wait: Duration::from_secs(5),
            read_bytes_limit: 1024 * 1024,
        }
    }
}

/// Follows one path, owning its file handle, offset and partial line.
///
/// Offsets written to the [`PositionStore`] never include buffered bytes of an
/// unterminated line, so a restart reads such a line again in full.
pub struct TailWatcher {
    path: PathBuf,
    tag: String,
    file: Option<File>,
    id: FileId,
    /// Last observed size of the file behind `file`.
    size: u64,
    /// Bytes of `file` consumed into `buffer` or emitted.
    offset: u64,
    buffer: LineBuffer,
    state: WatchState,
    /// The path resolver no longer reports this path.
    unmatched: bool,
}

impl std::fmt::Debug for TailWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailWatcher")
            .field("path", &self.path)
            .field("tag", &self.tag)
            .field("id", &self.id)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("pending", &self.buffer.pending_len())
            .field("state", &self.state)
            .field("unmatched", &self.unmatched)
            .finish()
    }
}

async fn open_with_metadata(path: &Path) -> io::Result<(File, Metadata)> {
    let file = File::open(path).await?;
    let metadata = file.metadata().await?;

    if metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is a directory", path.display()),
        ));
    }

    Ok((file, metadata))
}

async fn read_chunk(file: &mut File, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;

    let mut chunk = Vec::with_capacity(len as usize);
    (&mut *file).take(len).read_to_end(&mut chunk).await?;

    Ok(chunk)
}

impl TailWatcher {
    /// Opens `path` and decides where reading starts.
    ///
    /// A checkpoint for the same file is resumed; a checkpoint for a file that
    /// has since been replaced, or that lies beyond the current end of the
    /// file, restarts at 0. Without a checkpoint `start` applies.
    pub async fn open(
        path: impl Into<PathBuf>,
        tag: impl Into<String>,
        start: StartPosition,
        store: &PositionStore,
    ) -> io::Result<Self> {
        let path = path.into();
        let tag = tag.into();
        let (file, metadata) = open_with_metadata(&path).await?;
        let current = Snapshot::from_metadata(&metadata);

        let offset = match store.load(&path, current.id) {
            Lookup::Resume(offset) if offset <= current.size => offset,
            Lookup::Resume(offset) => {
                info!(
                    path = %path.display(),
                    checkpoint = offset,
                    size = current.size,
                    "file shrank since last run; reading from start"
                );
                0
            }
            Lookup::Replaced => {
                info!(path = %path.display(), "file replaced since last run; reading from start");
                0
            }
            Lookup::Unknown => match start {
                StartPosition::Head => 0,
                StartPosition::Tail => current.size,
            },
        };

        info!(path = %path.display(), tag = %tag, id = %current.id, offset, "watching file");

        Ok(TailWatcher {
            path,
            tag,
            file: Some(file),
            id: current.id,
            size: current.size,
            offset,
            buffer: LineBuffer::new(),
            state: WatchState::Open,
            unmatched: false,
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn file_id(&self) -> FileId {
        self.id
    }

    /// Bytes read from the current file, including a buffered partial line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset up to which every line has been handed to the emitter.
    pub fn committed_offset(&self) -> u64 {
        self.offset - self.buffer.pending_len() as u64
    }

    pub fn is_closed(&self) -> bool {
        self.state == WatchState::Closed
    }

    /// Marks the path as no longer reported by the resolver.
    ///
    /// The watcher drains what is left and closes once the grace window has
    /// passed, unless [`rematch`] is called first.
    ///
    /// [`rematch`]: TailWatcher::rematch
    pub fn unmatch(&mut self) {
        if self.unmatched {
            return;
        }
        self.unmatched = true;
        self.state = match self.state {
            WatchState::Open => WatchState::Missing {
                since: Instant::now(),
            },
            WatchState::Rotating { since } => WatchState::Missing { since },
            other => other,
        };
        debug!(path = %self.path.display(), "path no longer matched");
    }

    pub fn rematch(&mut self) {
        if self.unmatched {
            self.unmatched = false;
            debug!(path = %self.path.display(), "path matched again");
        }
    }

    /// Advances the watcher by one poll cycle.
    ///
    /// Errors are logged and retried on the next tick; nothing here is fatal.
    pub async fn tick(
        &mut self,
        emitter: &mut RecordEmitter,
        store: &mut PositionStore,
        opts: &WatchOptions,
    ) {
        match self.state {
            WatchState::Closed => {}
            WatchState::Open => self.tick_open(emitter, store, opts).await,
            WatchState::Rotating { since } => self.tick_rotating(since, emitter, store, opts).await,
            WatchState::Missing { since } => self.tick_missing(since, emitter, store, opts).await,
        }
    }

    /// Checkpoints the delivered offset and releases the file.
    ///
    /// Complete lines are always emitted as soon as they are read, so only an
    /// unterminated tail can still be buffered; it is dropped here and read
    /// again after a restart.
    pub fn shutdown(&mut self, store: &mut PositionStore) {
        if self.is_closed() {
            return;
        }
        self.checkpoint(store);
        self.file = None;
        self.buffer.clear();
        self.state = WatchState::Closed;
        debug!(path = %self.path.display(), offset = self.offset, "watcher shut down");
    }

    async fn tick_open(
        &mut self,
        emitter: &mut RecordEmitter,
        store: &mut PositionStore,
        opts: &WatchOptions,
    ) {
        let metadata = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "file disappeared");
                self.state = WatchState::Missing {
                    since: Instant::now(),
                };
                self.drain_handle(emitter, store, opts, false).await;
                return;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to stat file");
                return;
            }
        };

        let current = Snapshot::from_metadata(&metadata);
        let previous = Snapshot {
            id: self.id,
            size: self.size,
        };

        match RotationDetector::classify(previous, current) {
            Change::Rotated => {
                info!(
                    path = %self.path.display(),
                    old_id = %self.id,
                    new_id = %current.id,
                    "file rotated"
                );
                let since = Instant::now();
                self.begin_rotation(since, emitter, store, opts).await;
                self.tick_rotating(since, emitter, store, opts).await;
            }
            Change::Truncated => {
                info!(
                    path = %self.path.display(),
                    offset = self.offset,
                    size = current.size,
                    "file truncated; reading from start"
                );
                self.buffer.clear();
                self.offset = 0;
                self.size = current.size;
                self.read_until(current.size, emitter, store, opts, false)
                    .await;
            }
            Change::Grew | Change::Unchanged => {
                self.size = current.size;
                self.read_until(current.size, emitter, store, opts, false)
                    .await;
            }
        }
    }

    async fn tick_rotating(
        &mut self,
        since: Instant,
        emitter: &mut RecordEmitter,
        store: &mut PositionStore,
        opts: &WatchOptions,
    ) {
        let drained = self.drain_handle(emitter, store, opts, true).await;
        if !drained || since.elapsed() < opts.rotate_wait {
            return;
        }

        let (file, metadata) = match open_with_metadata(&self.path).await {
            Ok(opened) => opened,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "rotated file disappeared");
                self.state = WatchState::Missing {
                    since: Instant::now(),
                };
                return;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to open rotated file");
                return;
            }
        };

        let current = Snapshot::from_metadata(&metadata);
        debug!(
            path = %self.path.display(),
            old_id = %self.id,
            new_id = %current.id,
            "releasing rotated file"
        );

        self.file = Some(file);
        self.id = current.id;
        self.size = current.size;
        self.offset = 0;
        self.buffer.clear();
        self.state = WatchState::Open;

        self.read_until(current.size, emitter, store, opts, false)
            .await;
    }

    async fn tick_missing(
        &mut self,
        since: Instant,
        emitter: &mut RecordEmitter,
        store: &mut PositionStore,
        opts: &WatchOptions,
    ) {
        if !self.unmatched {
            match fs::metadata(&self.path).await {
                Ok(metadata) => {
                    let current = Snapshot::from_metadata(&metadata);
                    if current.id == self.id && self.file.is_some() {
                        info!(path = %self.path.display(), "file is back");
                        self.state = WatchState::Open;
                        self.tick_open(emitter, store, opts).await;
                    } else {
                        info!(
                            path = %self.path.display(),
                            old_id = %self.id,
                            new_id = %current.id,
                            "file replaced while missing"
                        );
                        self.begin_rotation(since, emitter, store, opts).await;
                        self.tick_rotating(since, emitter, store, opts).await;
                    }
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to stat file");
                    return;
                }
            }
        }

        let expired = since.elapsed() >= opts.rotate_wait;
        let drained = self.drain_handle(emitter, store, opts, expired).await;

        if expired && drained {
            self.file = None;
            self.buffer.clear();
            store.remove(&self.path);
            self.state = WatchState::Closed;
            info!(path = %self.path.display(), "stopped watching file");
        }
    }

    async fn begin_rotation(
        &mut self,
        since: Instant,
        emitter: &mut RecordEmitter,
        store: &mut PositionStore,
        opts: &WatchOptions,
    ) {
        self.drain_handle(emitter, store, opts, true).await;
        self.state = WatchState::Rotating { since };
    }

    /// Reads what was appended to the open handle, which may no longer be
    /// reachable through the path.
    ///
    /// With `flush`, an unterminated tail is emitted once the end of the handle
    /// is reached. Returns whether the handle has been read completely.
    async fn drain_handle(
        &mut self,
        emitter: &mut RecordEmitter,
        store: &mut PositionStore,
        opts: &WatchOptions,
        flush: bool,
    ) -> bool {
        let file = match self.file.as_ref() {
            Some(file) => file,
            None => return true,
        };

        let end = match file.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to stat open file");
                return false;
            }
        };

        // Shrinking after the path moved on: nothing sensible left to read.
        if end < self.offset {
            if flush && !self.deliver(emitter, true) {
                return false;
            }
            self.checkpoint(store);
            return true;
        }

        self.size = end;
        self.read_until(end, emitter, store, opts, flush).await
    }

    /// Reads at most one chunk towards `end`, emits the complete lines and
    /// checkpoints. Returns whether `end` was reached and everything read
    /// was delivered.
    async fn read_until(
        &mut self,
        end: u64,
        emitter: &mut RecordEmitter,
        store: &mut PositionStore,
        opts: &WatchOptions,
        flush_at_end: bool,
    ) -> bool {
        let want = end
            .saturating_sub(self.offset)
            .min(opts.read_bytes_limit as u64);

        if want > 0 {
            let file = match self.file.as_mut() {
                Some(file) => file,
                None => return true,
            };

            match read_chunk(file, self.offset, want).await {
                Ok(chunk) => {
                    self.offset += chunk.len() as u64;
                    self.buffer.append(&chunk);
                    debug!(
                        path = %self.path.display(),
                        bytes = chunk.len(),
                        offset = self.offset,
                        "read chunk"
                    );
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to read file");
                    return false;
                }
            }
        }

        let reached_end = self.offset >= end;
        let delivered = self.deliver(emitter, flush_at_end && reached_end);
        self.checkpoint(store);

        delivered && reached_end
    }

    /// Hands every complete line (and with `flush_partial` the unterminated
    /// tail) to the emitter.
    ///
    /// When the sink refuses a record, the offset is rewound to the start of
    /// that line and the buffer is dropped, so the line is read again next tick.
    fn deliver(&mut self, emitter: &mut RecordEmitter, flush_partial: bool) -> bool {
        let mut start = self.committed_offset();

        let mut lines: Vec<(Vec<u8>, u64)> = self
            .buffer
            .drain()
            .into_iter()
            .map(|line| {
                let consumed = line.len() as u64 + 1;
                (line, consumed)
            })
            .collect();

        if flush_partial {
            if let Some(partial) = self.buffer.take_partial() {
                let consumed = partial.len() as u64;
                lines.push((partial, consumed));
            }
        }

        for (line, consumed) in lines {
            if let Err(e) = emitter.emit(&self.tag, &line) {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    offset = start,
                    "record not accepted; will retry from this offset"
                );
                self.buffer.clear();
                self.offset = start;
                return false;
            }
            start += consumed;
        }

        true
    }

    fn checkpoint(&self, store: &mut PositionStore) {
        store.save(&self.path, self.id, self.committed_offset());
    }
}

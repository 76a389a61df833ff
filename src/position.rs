//! Durable per-path read offsets.
//!
//! The position file is plain text with one checkpoint per line:
//!
//! ```text
//! <offset>\t<dev>:<ino>:<path>
//! ```
//!
//! Backslashes and control characters in paths are escaped (`\\`, `\n`, `\t`,
//! `\r`, `\xNN`), as is every non-ASCII byte of a path that is not UTF-8.
//!
//! It may be edited by hand between runs. Blank lines and lines starting with
//! `#` are skipped, and lines that fail to parse are ignored with a warning, so
//! the affected path simply falls back to the configured start policy.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rotation::FileId;

/// Persisted position of one watched path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub id: FileId,
    pub offset: u64,
}

/// Outcome of looking up the checkpoint of a path for a given file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lookup {
    /// The same file was seen before; continue from this offset.
    Resume(u64),
    /// The path was checkpointed for a different file, which has since been
    /// replaced. Everything in the current file is new.
    Replaced,
    /// Nothing is known about the path.
    Unknown,
}

#[derive(Debug)]
pub struct PositionStore {
    file: Option<PathBuf>,
    entries: BTreeMap<PathBuf, Checkpoint>,
    dirty: bool,
    /// Cleared when an existing position file could not be read, so that its
    /// checkpoints are not overwritten.
    writable: bool,
    /// Background write started by [`persist`], at most one at a time.
    ///
    /// [`persist`]: PositionStore::persist
    pending: Option<JoinHandle<io::Result<()>>>,
}

impl PositionStore {
    /// A store that is never written to disk.
    pub fn memory() -> Self {
        PositionStore {
            file: None,
            entries: BTreeMap::new(),
            dirty: false,
            writable: true,
            pending: None,
        }
    }

    /// Loads the position file at `file`, if there is one.
    ///
    /// A missing file yields an empty store. A file that exists but cannot be
    /// read is logged and treated as empty, and is left untouched on disk:
    /// such a store is never persisted.
    pub async fn open(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let mut entries = BTreeMap::new();
        let mut writable = true;

        match fs::read(&file).await {
            Ok(contents) => {
                let contents = String::from_utf8_lossy(&contents);
                for (idx, line) in contents.lines().enumerate() {
                    let line = line.trim_end_matches('\r');
                    if line.trim().is_empty() || line.starts_with('#') {
                        continue;
                    }
                    match parse_entry(line) {
                        Some((path, checkpoint)) => {
                            entries.insert(path, checkpoint);
                        }
                        None => warn!(
                            pos_file = %file.display(),
                            line = idx + 1,
                            "ignoring corrupt position entry"
                        ),
                    }
                }
                debug!(pos_file = %file.display(), entries = entries.len(), "loaded position file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    pos_file = %file.display(),
                    error = %e,
                    "failed to read position file; starting without checkpoints and leaving it untouched"
                );
                writable = false;
            }
        }

        PositionStore {
            file: Some(file),
            entries,
            dirty: false,
            writable,
            pending: None,
        }
    }

    /// Location of the backing file, `None` for a memory store.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn get(&self, path: &Path) -> Option<Checkpoint> {
        self.entries.get(path).copied()
    }

    pub fn load(&self, path: &Path, id: FileId) -> Lookup {
        match self.entries.get(path) {
            Some(checkpoint) if checkpoint.id == id => Lookup::Resume(checkpoint.offset),
            Some(_) => Lookup::Replaced,
            None => Lookup::Unknown,
        }
    }

    pub fn save(&mut self, path: &Path, id: FileId, offset: u64) {
        let checkpoint = Checkpoint { id, offset };
        if self.entries.get(path) != Some(&checkpoint) {
            self.entries.insert(path.to_path_buf(), checkpoint);
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, path: &Path) -> Option<Checkpoint> {
        let removed = self.entries.remove(path);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether there are changes not yet written by [`persist`].
    ///
    /// [`persist`]: PositionStore::persist
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether checkpoints reach the disk at all.
    ///
    /// `false` for memory stores and for stores whose position file existed
    /// but could not be read.
    pub fn is_persistent(&self) -> bool {
        self.file.is_some() && self.writable
    }

    /// Starts rewriting the position file in the background if anything
    /// changed since the last write.
    ///
    /// Returns without waiting for the disk. While a previous write is still
    /// running nothing new is started and the changes wait for a later call.
    /// A failed write is reported by the next call and its changes are
    /// written again.
    pub async fn persist(&mut self) -> Result<()> {
        if let Some(pending) = &self.pending {
            if !pending.is_finished() {
                return Ok(());
            }
        }
        self.finish_pending().await?;

        let contents = match self.take_contents() {
            Some(contents) => contents,
            None => return Ok(()),
        };
        if let Some(file) = self.file.clone() {
            self.pending = Some(tokio::spawn(async move {
                atomic_write(&file, contents.as_bytes()).await
            }));
        }

        Ok(())
    }

    /// Waits for a background write, then writes any remaining changes
    /// before returning.
    ///
    /// The new contents go to a sibling temporary file which is then renamed
    /// over the old one, so a crash leaves either the old or the new file.
    pub async fn flush(&mut self) -> Result<()> {
        let previous = self.finish_pending().await;

        if let Some(contents) = self.take_contents() {
            if let Some(file) = self.file.as_ref() {
                if let Err(e) = atomic_write(file, contents.as_bytes()).await {
                    let err = write_error(file, e);
                    self.dirty = true;
                    return Err(err);
                }
            }
        }

        previous
    }

    /// Renders the entries if they need writing and marks the store clean.
    fn take_contents(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        if !self.is_persistent() {
            return None;
        }

        let mut contents = String::new();
        for (path, checkpoint) in &self.entries {
            contents.push_str(&render_entry(path, checkpoint));
        }

        Some(contents)
    }

    async fn finish_pending(&mut self) -> Result<()> {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let res = match pending.await {
            Ok(res) => res,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        };

        let err = match (res, self.file.as_ref()) {
            (Err(e), Some(file)) => write_error(file, e),
            _ => return Ok(()),
        };
        self.dirty = true;
        Err(err)
    }
}

fn write_error(file: &Path, e: io::Error) -> Error {
    Error::Persistence(format!("failed to write {}: {}", file.display(), e))
}

fn parse_entry(line: &str) -> Option<(PathBuf, Checkpoint)> {
    let (offset, key) = line.split_once('\t')?;
    let offset = offset.trim().parse::<u64>().ok()?;

    let mut parts = key.splitn(3, ':');
    let dev = parts.next()?.parse::<u64>().ok()?;
    let ino = parts.next()?.parse::<u64>().ok()?;
    let path = parts.next().filter(|p| !p.is_empty())?;

    Some((
        decode_path(path)?,
        Checkpoint {
            id: FileId::new(dev, ino),
            offset,
        },
    ))
}

fn render_entry(path: &Path, checkpoint: &Checkpoint) -> String {
    format!(
        "{}\t{}:{}:{}\n",
        checkpoint.offset,
        checkpoint.id.dev(),
        checkpoint.id.ino(),
        encode_path(path)
    )
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;

    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn path_from_bytes(bytes: Vec<u8>) -> Option<PathBuf> {
    use std::os::unix::ffi::OsStringExt;

    Some(PathBuf::from(OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: Vec<u8>) -> Option<PathBuf> {
    String::from_utf8(bytes).ok().map(PathBuf::from)
}

/// Escapes backslashes and control characters, and every non-ASCII byte of a
/// path that is not valid UTF-8, so that any path fits on one line and reads
/// back byte for byte.
fn encode_path(path: &Path) -> String {
    let bytes = path_bytes(path);
    let mut out = String::with_capacity(bytes.len());

    match std::str::from_utf8(&bytes) {
        Ok(text) => {
            for c in text.chars() {
                if c.is_ascii() {
                    push_ascii(&mut out, c as u8);
                } else {
                    out.push(c);
                }
            }
        }
        Err(_) => {
            for &b in &bytes {
                if b.is_ascii() {
                    push_ascii(&mut out, b);
                } else {
                    out.push_str(&format!("\\x{:02x}", b));
                }
            }
        }
    }

    out
}

fn push_ascii(out: &mut String, b: u8) {
    match b {
        b'\\' => out.push_str("\\\\"),
        b'\n' => out.push_str("\\n"),
        b'\t' => out.push_str("\\t"),
        b'\r' => out.push_str("\\r"),
        0x20..=0x7e => out.push(b as char),
        _ => out.push_str(&format!("\\x{:02x}", b)),
    }
}

fn decode_path(encoded: &str) -> Option<PathBuf> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut input = encoded.bytes();

    while let Some(b) = input.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        match input.next()? {
            b'\\' => bytes.push(b'\\'),
            b'n' => bytes.push(b'\n'),
            b't' => bytes.push(b'\t'),
            b'r' => bytes.push(b'\r'),
            b'x' => {
                let hex = [input.next()?, input.next()?];
                let hex = std::str::from_utf8(&hex).ok()?;
                bytes.push(u8::from_str_radix(hex, 16).ok()?);
            }
            _ => return None,
        }
    }

    path_from_bytes(bytes)
}

async fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await
}

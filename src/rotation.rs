//! File identity and the classification of changes between two observations
//! of the same path.

use std::fmt;
use std::fs::Metadata;

/// Identity of a file that survives renames: device and inode on unix.
///
/// Other platforms get a constant identity, which degrades rotation detection
/// to size-based truncation checks.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn new(dev: u64, ino: u64) -> Self {
        FileId { dev, ino }
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        FileId {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &Metadata) -> Self {
        FileId::default()
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// Identity and size of a file at one point in time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Snapshot {
    pub id: FileId,
    pub size: u64,
}

impl Snapshot {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Snapshot {
            id: FileId::from_metadata(metadata),
            size: metadata.len(),
        }
    }
}

/// What happened to a path between two snapshots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Change {
    Unchanged,
    Grew,
    /// Same file, but shorter than before: it was truncated in place.
    Truncated,
    /// The path now points at a different file.
    Rotated,
}

pub struct RotationDetector;

impl RotationDetector {
    /// Classifies `current` against `previous`.
    ///
    /// An identity change wins over a size change, so a file that was both
    /// replaced and is shorter than its predecessor counts as rotated.
    pub fn classify(previous: Snapshot, current: Snapshot) -> Change {
        if current.id != previous.id {
            Change::Rotated
        } else if current.size < previous.size {
            Change::Truncated
        } else if current.size > previous.size {
            Change::Grew
        } else {
            Change::Unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn snap(ino: u64, size: u64) -> Snapshot {
        Snapshot {
            id: FileId::new(1, ino),
            size,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(RotationDetector::classify(snap(1, 10), snap(1, 10)), Change::Unchanged);
        assert_eq!(RotationDetector::classify(snap(1, 10), snap(1, 12)), Change::Grew);
        assert_eq!(RotationDetector::classify(snap(1, 10), snap(1, 0)), Change::Truncated);
        assert_eq!(RotationDetector::classify(snap(1, 10), snap(2, 30)), Change::Rotated);
    }

    #[test]
    fn test_identity_beats_truncation() {
        assert_eq!(RotationDetector::classify(snap(1, 10), snap(2, 3)), Change::Rotated);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_id_stable_across_append() {
        let mut file = NamedTempFile::new().unwrap();
        let before = FileId::from_metadata(&file.path().metadata().unwrap());

        file.write_all(b"more content\n").unwrap();
        file.flush().unwrap();
        let after = FileId::from_metadata(&file.path().metadata().unwrap());

        assert_eq!(before, after);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_id_differs_between_files() {
        let a = NamedTempFile::new().unwrap();
        let b = NamedTempFile::new().unwrap();

        let id_a = FileId::from_metadata(&a.path().metadata().unwrap());
        let id_b = FileId::from_metadata(&b.path().metadata().unwrap());

        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_file_id_display() {
        assert_eq!(FileId::new(123, 456).to_string(), "123:456");
    }
}

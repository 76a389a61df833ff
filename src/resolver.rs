//! Turning configured path patterns into the concrete set of files to watch.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// A file to watch together with the tag its records carry.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WatchPath {
    pub path: PathBuf,
    pub tag: String,
}

impl WatchPath {
    pub fn new(path: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        WatchPath {
            path: path.into(),
            tag: tag.into(),
        }
    }
}

/// Supplies the current set of paths to watch.
///
/// Called again on every refresh, so implementations pick up files that
/// started or stopped matching in the meantime.
pub trait PathResolver: Send {
    fn resolve(&mut self) -> Result<Vec<WatchPath>>;
}

/// A fixed list of paths, whether they exist or not.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    paths: Vec<WatchPath>,
}

impl StaticResolver {
    pub fn new(paths: Vec<WatchPath>) -> Self {
        StaticResolver { paths }
    }
}

impl PathResolver for StaticResolver {
    fn resolve(&mut self) -> Result<Vec<WatchPath>> {
        Ok(self.paths.clone())
    }
}

/// Expands glob patterns into the regular files that currently match them.
#[derive(Clone, Debug)]
pub struct GlobResolver {
    include: Vec<String>,
    exclude: Vec<glob::Pattern>,
    tag: String,
}

impl GlobResolver {
    /// Validates every pattern up front.
    ///
    /// A `*` in `tag` is replaced, per file, by its path with separators turned
    /// into dots.
    pub fn new(include: Vec<String>, exclude: Vec<String>, tag: impl Into<String>) -> Result<Self> {
        for pattern in &include {
            glob::Pattern::new(pattern)?;
        }
        let exclude = exclude
            .iter()
            .map(|pattern| glob::Pattern::new(pattern))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(GlobResolver {
            include,
            exclude,
            tag: tag.into(),
        })
    }
}

impl PathResolver for GlobResolver {
    fn resolve(&mut self) -> Result<Vec<WatchPath>> {
        let mut found = BTreeSet::new();

        for pattern in &self.include {
            for entry in glob::glob(pattern)? {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        debug!(pattern = %pattern, error = %e, "skipping unreadable glob match");
                        continue;
                    }
                };

                if path.is_dir() || self.exclude.iter().any(|p| p.matches_path(&path)) {
                    continue;
                }

                found.insert(path);
            }
        }

        Ok(found
            .into_iter()
            .map(|path| {
                let tag = expand_tag(&self.tag, &path);
                WatchPath { path, tag }
            })
            .collect())
    }
}

/// Replaces `*` in `tag` with the dotted form of `path`, e.g. `app.*` and
/// `/var/log/syslog` give `app.var.log.syslog`.
pub fn expand_tag(tag: &str, path: &Path) -> String {
    if !tag.contains('*') {
        return tag.to_string();
    }

    let dotted = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(".");

    tag.replace('*', &dotted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_expand_tag() {
        let path = Path::new("/var/log/syslog");
        assert_eq!(expand_tag("t1", path), "t1");
        assert_eq!(expand_tag("app.*", path), "app.var.log.syslog");
        assert_eq!(expand_tag("*", Path::new("logs/a.log")), "logs.a.log");
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            GlobResolver::new(vec!["[".to_string()], vec![], "t"),
            Err(Error::Glob(_))
        ));
        assert!(matches!(
            GlobResolver::new(vec!["*.log".to_string()], vec!["[".to_string()], "t"),
            Err(Error::Glob(_))
        ));
    }

    #[test]
    fn test_glob_resolve() {
        let dir = tempdir().unwrap();
        for name in &["b.log", "a.log", "skip.log", "other.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("dir.log")).unwrap();

        let mut resolver = GlobResolver::new(
            vec![
                format!("{}/*.log", dir.path().display()),
                format!("{}/a.*", dir.path().display()),
            ],
            vec![format!("{}/skip.*", dir.path().display())],
            "t1",
        )
        .unwrap();

        let resolved = resolver.resolve().unwrap();
        assert_eq!(
            resolved,
            vec![
                WatchPath::new(dir.path().join("a.log"), "t1"),
                WatchPath::new(dir.path().join("b.log"), "t1"),
            ]
        );
    }

    #[test]
    fn test_static_resolve() {
        let mut resolver = StaticResolver::new(vec![WatchPath::new("/missing.log", "t")]);
        assert_eq!(resolver.resolve().unwrap().len(), 1);
    }
}

//! Options of a tailing engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::emitter::{LineParser, PassThrough, RegexParser};
use crate::error::{Error, Result};
use crate::resolver::GlobResolver;
use crate::watcher::{StartPosition, WatchOptions};

/// How the scheduler learns that files changed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WatchMode {
    /// Only the fixed poll interval.
    Poll,
    /// Poll, and additionally wake up on filesystem notifications.
    #[default]
    Notify,
}

#[derive(Clone, Debug)]
pub struct TailConfig {
    /// Glob patterns of files to tail.
    pub paths: Vec<String>,
    /// Glob patterns of files to leave alone even if `paths` matches them.
    pub exclude: Vec<String>,
    /// Tag of emitted records; `*` expands to the dotted file path.
    pub tag: String,
    pub poll_interval: Duration,
    /// How often `paths` is expanded again to find new files.
    pub refresh_interval: Duration,
    /// Grace window for rotated and vanished files.
    pub rotate_wait: Duration,
    /// Position file; offsets are kept in memory only when unset.
    pub pos_file: Option<PathBuf>,
    /// Read files without a checkpoint from the beginning instead of the end.
    pub start_reading_head: bool,
    /// Regular expression with named capture groups applied to every line.
    pub format: Option<String>,
    /// Field holding the whole line when no `format` is set.
    pub message_key: String,
    /// Capture group holding the record time.
    pub time_key: Option<String>,
    /// chrono format of `time_key`; RFC 3339 when unset.
    pub time_format: Option<String>,
    /// Bytes read from a single file per tick.
    pub read_bytes_limit: usize,
    pub watch_mode: WatchMode,
}

impl Default for TailConfig {
    fn default() -> Self {
        TailConfig {
            paths: Vec::new(),
            exclude: Vec::new(),
            tag: String::new(),
            poll_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(60),
            rotate_wait: Duration::from_secs(5),
            pos_file: None,
            start_reading_head: false,
            format: None,
            message_key: "message".to_string(),
            time_key: None,
            time_format: None,
            read_bytes_limit: 1024 * 1024,
            watch_mode: WatchMode::default(),
        }
    }
}

impl TailConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tag.is_empty() {
            return Err(Error::Config("tag must not be empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be greater than zero".to_string()));
        }
        if self.read_bytes_limit == 0 {
            return Err(Error::Config("read_bytes_limit must be greater than zero".to_string()));
        }
        if self.time_key.is_some() && self.format.is_none() {
            return Err(Error::Config("time_key requires a format".to_string()));
        }

        Ok(())
    }

    pub fn start_position(&self) -> StartPosition {
        if self.start_reading_head {
            StartPosition::Head
        } else {
            StartPosition::Tail
        }
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            rotate_wait: self.rotate_wait,
            read_bytes_limit: self.read_bytes_limit,
        }
    }

    pub fn build_parser(&self) -> Result<Box<dyn LineParser>> {
        match &self.format {
            None => Ok(Box::new(PassThrough::new(self.message_key.clone()))),
            Some(pattern) => {
                let mut parser = RegexParser::new(pattern)?;
                if let Some(key) = &self.time_key {
                    if !parser.group_names().iter().any(|name| name == key) {
                        return Err(Error::Config(format!(
                            "time_key {:?} is not a capture group of the format",
                            key
                        )));
                    }
                    parser = parser.with_time(key.clone(), self.time_format.clone());
                }
                Ok(Box::new(parser))
            }
        }
    }

    pub fn build_resolver(&self) -> Result<GlobResolver> {
        if self.paths.is_empty() {
            return Err(Error::Config("at least one path must be specified".to_string()));
        }
        GlobResolver::new(self.paths.clone(), self.exclude.clone(), self.tag.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TailConfig {
        TailConfig {
            paths: vec!["/tmp/tail/tail.txt".to_string()],
            tag: "t1".to_string(),
            rotate_wait: Duration::from_secs(2),
            pos_file: Some(PathBuf::from("/tmp/tail/tail.pos")),
            format: Some("(?<message>.*)".to_string()),
            ..TailConfig::default()
        }
    }

    #[test]
    fn test_configure() {
        let config = config();
        config.validate().unwrap();

        assert_eq!(config.paths, vec!["/tmp/tail/tail.txt".to_string()]);
        assert_eq!(config.tag, "t1");
        assert_eq!(config.watch_options().rotate_wait, Duration::from_secs(2));
        assert_eq!(config.pos_file, Some(PathBuf::from("/tmp/tail/tail.pos")));
        assert!(!config.start_reading_head);
        assert_eq!(config.start_position(), StartPosition::Tail);
    }

    #[test]
    fn test_configure_start_reading_head() {
        let config = TailConfig {
            start_reading_head: true,
            ..config()
        };
        config.validate().unwrap();

        assert_eq!(config.start_position(), StartPosition::Head);
    }

    #[test]
    fn test_defaults() {
        let config = TailConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.rotate_wait, Duration::from_secs(5));
        assert_eq!(config.message_key, "message");
        assert_eq!(config.watch_mode, WatchMode::Notify);
        assert!(config.pos_file.is_none());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(TailConfig::default().validate().is_err());
        assert!(TailConfig {
            tag: String::new(),
            ..config()
        }
        .validate()
        .is_err());
        assert!(TailConfig {
            poll_interval: Duration::ZERO,
            ..config()
        }
        .validate()
        .is_err());
        assert!(TailConfig {
            format: None,
            time_key: Some("time".to_string()),
            ..config()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_build_resolver_requires_paths() {
        assert!(config().build_resolver().is_ok());
        assert!(matches!(
            TailConfig {
                paths: Vec::new(),
                ..config()
            }
            .build_resolver(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_build_parser() {
        let parser = config().build_parser().unwrap();
        let parsed = parser.parse("test1").unwrap();
        assert_eq!(parsed.fields.get("message").unwrap(), "test1");

        let parser = TailConfig {
            format: None,
            message_key: "log".to_string(),
            ..config()
        }
        .build_parser()
        .unwrap();
        assert_eq!(parser.parse("x").unwrap().fields.get("log").unwrap(), "x");

        let missing_time_group = TailConfig {
            time_key: Some("time".to_string()),
            ..config()
        };
        assert!(matches!(
            missing_time_group.build_parser(),
            Err(Error::Config(_))
        ));
    }
}

//! Turning raw lines into records and handing them downstream.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

pub type Fields = BTreeMap<String, String>;

/// A structured record built from one line of a watched file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    tag: String,
    timestamp: DateTime<Utc>,
    fields: Fields,
}

impl Record {
    pub fn new(tag: impl Into<String>, timestamp: DateTime<Utc>, fields: Fields) -> Self {
        Record {
            tag: tag.into(),
            timestamp,
            fields,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Shorthand for looking up a single field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn into_inner(self) -> (String, DateTime<Utc>, Fields) {
        let Record {
            tag,
            timestamp,
            fields,
        } = self;

        (tag, timestamp, fields)
    }
}

/// Result of parsing one line.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Parsed {
    pub fields: Fields,
    /// Event time taken from the line itself, if the parser found one.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("pattern does not match line {0:?}")]
    NoMatch(String),
    #[error("failed to parse time field {key:?} from {value:?}")]
    Time { key: String, value: String },
}

/// Transforms the text of a line into structured fields.
pub trait LineParser: Send + Sync {
    fn parse(&self, line: &str) -> std::result::Result<Parsed, ParseError>;
}

/// Passes the whole line through under a single field.
#[derive(Clone, Debug)]
pub struct PassThrough {
    key: String,
}

impl PassThrough {
    pub fn new(key: impl Into<String>) -> Self {
        PassThrough { key: key.into() }
    }
}

impl Default for PassThrough {
    fn default() -> Self {
        PassThrough::new("message")
    }
}

impl LineParser for PassThrough {
    fn parse(&self, line: &str) -> std::result::Result<Parsed, ParseError> {
        let mut fields = Fields::new();
        fields.insert(self.key.clone(), line.to_string());

        Ok(Parsed {
            fields,
            timestamp: None,
        })
    }
}

/// Extracts fields from the named capture groups of a regular expression.
///
/// A line the pattern does not match is a parse failure. When a time key is
/// configured, that group is removed from the fields and parsed into the
/// record timestamp instead.
#[derive(Clone, Debug)]
pub struct RegexParser {
    regex: Regex,
    group_names: Vec<String>,
    time_key: Option<String>,
    time_format: Option<String>,
}

impl RegexParser {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)?;

        let group_names: Vec<String> = regex
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();

        if group_names.is_empty() {
            return Err(Error::Config(format!(
                "format {:?} has no named capture groups",
                pattern
            )));
        }

        Ok(RegexParser {
            regex,
            group_names,
            time_key: None,
            time_format: None,
        })
    }

    /// Takes the record time from the `key` group.
    ///
    /// `format` is a chrono format string; without one the value must be
    /// RFC 3339. Values without a UTC offset are read as UTC.
    pub fn with_time(mut self, key: impl Into<String>, format: Option<String>) -> Self {
        self.time_key = Some(key.into());
        self.time_format = format;
        self
    }

    pub fn group_names(&self) -> &[String] {
        &self.group_names
    }

    fn parse_time(&self, value: &str) -> Option<DateTime<Utc>> {
        match self.time_format.as_deref() {
            Some(format) => DateTime::parse_from_str(value, format)
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| NaiveDateTime::parse_from_str(value, format).map(|dt| dt.and_utc()))
                .ok(),
            None => DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
        }
    }
}

impl LineParser for RegexParser {
    fn parse(&self, line: &str) -> std::result::Result<Parsed, ParseError> {
        let captures = self
            .regex
            .captures(line)
            .ok_or_else(|| ParseError::NoMatch(line.chars().take(100).collect()))?;

        let mut parsed = Parsed::default();

        for name in &self.group_names {
            let value = match captures.name(name) {
                Some(m) => m.as_str(),
                None => continue,
            };

            if self.time_key.as_deref() == Some(name.as_str()) {
                let timestamp = self.parse_time(value).ok_or_else(|| ParseError::Time {
                    key: name.clone(),
                    value: value.to_string(),
                })?;
                parsed.timestamp = Some(timestamp);
            } else {
                parsed.fields.insert(name.clone(), value.to_string());
            }
        }

        Ok(parsed)
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum SinkError {
    #[error("sink is full")]
    Full,
    #[error("sink is closed")]
    Closed,
}

/// Downstream consumer of records.
///
/// An error means the record was not accepted; the caller keeps the line and
/// offers it again later.
pub trait RecordSink: Send {
    fn send(&mut self, record: Record) -> std::result::Result<(), SinkError>;
}

impl RecordSink for mpsc::UnboundedSender<Record> {
    fn send(&mut self, record: Record) -> std::result::Result<(), SinkError> {
        mpsc::UnboundedSender::send(self, record).map_err(|_| SinkError::Closed)
    }
}

impl RecordSink for mpsc::Sender<Record> {
    fn send(&mut self, record: Record) -> std::result::Result<(), SinkError> {
        self.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// What became of a line handed to [`RecordEmitter::emit`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Emitted {
    Record,
    /// The parser rejected the line. It is counted and dropped.
    ParseFailure,
}

pub struct RecordEmitter {
    parser: Box<dyn LineParser>,
    sink: Box<dyn RecordSink>,
    emitted: u64,
    parse_failures: u64,
}

impl RecordEmitter {
    pub fn new(parser: Box<dyn LineParser>, sink: Box<dyn RecordSink>) -> Self {
        RecordEmitter {
            parser,
            sink,
            emitted: 0,
            parse_failures: 0,
        }
    }

    /// Parses `raw` and forwards the record downstream.
    ///
    /// Invalid UTF-8 is replaced before parsing.
    pub fn emit(&mut self, tag: &str, raw: &[u8]) -> std::result::Result<Emitted, SinkError> {
        let text = String::from_utf8_lossy(raw);

        let parsed = match self.parser.parse(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.parse_failures += 1;
                debug!(tag, error = %e, "dropping unparseable line");
                return Ok(Emitted::ParseFailure);
            }
        };

        let timestamp = parsed.timestamp.unwrap_or_else(Utc::now);
        self.sink.send(Record::new(tag, timestamp, parsed.fields))?;
        self.emitted += 1;

        Ok(Emitted::Record)
    }

    /// Number of records accepted by the sink.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }
}

impl std::fmt::Debug for RecordEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordEmitter")
            .field("emitted", &self.emitted)
            .field("parse_failures", &self.parse_failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pass_through() {
        let parsed = PassThrough::default().parse("  hello\t").unwrap();
        assert_eq!(parsed.fields.get("message").unwrap(), "  hello\t");
        assert!(parsed.timestamp.is_none());
    }

    #[test]
    fn test_regex_requires_named_groups() {
        assert!(matches!(RegexParser::new("(.*)"), Err(Error::Config(_))));
        assert!(matches!(RegexParser::new("(?<message>"), Err(Error::Regex(_))));
    }

    #[test]
    fn test_regex_fields() {
        let parser = RegexParser::new(r"^(?<level>\w+) (?<message>.*)$").unwrap();
        assert_eq!(parser.group_names(), &["level", "message"]);

        let parsed = parser.parse("WARN disk almost full").unwrap();
        assert_eq!(parsed.fields.get("level").unwrap(), "WARN");
        assert_eq!(parsed.fields.get("message").unwrap(), "disk almost full");

        assert!(matches!(parser.parse(""), Err(ParseError::NoMatch(_))));
    }

    #[test]
    fn test_regex_time_key() {
        let parser = RegexParser::new(r"^(?<time>\S+ \S+) (?<message>.*)$")
            .unwrap()
            .with_time("time", Some("%Y-%m-%d %H:%M:%S".to_string()));

        let parsed = parser.parse("2019-02-13 20:58:22 started").unwrap();
        assert_eq!(
            parsed.timestamp,
            Some(Utc.with_ymd_and_hms(2019, 2, 13, 20, 58, 22).unwrap())
        );
        assert!(!parsed.fields.contains_key("time"));
        assert_eq!(parsed.fields.get("message").unwrap(), "started");

        assert!(matches!(
            parser.parse("yesterday noon started"),
            Err(ParseError::Time { .. })
        ));
    }

    #[test]
    fn test_emit_counts_parse_failures() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let parser = RegexParser::new(r"^(?<n>\d+)$").unwrap();
        let mut emitter = RecordEmitter::new(Box::new(parser), Box::new(tx));

        assert_eq!(emitter.emit("t1", b"12"), Ok(Emitted::Record));
        assert_eq!(emitter.emit("t1", b"abc"), Ok(Emitted::ParseFailure));
        assert_eq!(emitter.emit("t1", b"34"), Ok(Emitted::Record));
        assert_eq!(emitter.emitted(), 2);
        assert_eq!(emitter.parse_failures(), 1);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.tag(), "t1");
        assert_eq!(first.get("n"), Some("12"));
        assert_eq!(rx.try_recv().unwrap().get("n"), Some("34"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_reports_sink_errors() {
        let (tx, rx) = mpsc::channel(1);
        let mut emitter = RecordEmitter::new(Box::new(PassThrough::default()), Box::new(tx));

        assert_eq!(emitter.emit("t1", b"one"), Ok(Emitted::Record));
        assert_eq!(emitter.emit("t1", b"two"), Err(SinkError::Full));

        drop(rx);
        assert_eq!(emitter.emit("t1", b"three"), Err(SinkError::Closed));
        assert_eq!(emitter.emitted(), 1);
    }

    #[test]
    fn test_emit_lossy_utf8() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emitter = RecordEmitter::new(Box::new(PassThrough::default()), Box::new(tx));

        emitter.emit("t1", b"bad \xff byte").unwrap();
        assert_eq!(rx.try_recv().unwrap().get("message"), Some("bad \u{fffd} byte"));
    }
}

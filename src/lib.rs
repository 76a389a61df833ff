//! A library providing checkpointed, rotation-aware tailing of (namely log) files.
//!
//! Files matched by glob patterns are polled on a fixed interval. Newly
//! appended bytes are split into lines, parsed into [`Record`]s and handed to
//! a [`RecordSink`], after which the read offset is written to a position file
//! so that a restart continues where the previous run stopped.
//!
//! ## Example
//!
//! ```no_run
//! use linetail::{Scheduler, TailConfig};
//!
//! #[tokio::main]
//! async fn main() -> linetail::Result<()> {
//!     let config = TailConfig {
//!         paths: vec!["/var/log/app/*.log".to_string()],
//!         tag: "app.*".to_string(),
//!         pos_file: Some("/var/lib/linetail/app.pos".into()),
//!         ..TailConfig::default()
//!     };
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<linetail::Record>();
//!     let scheduler = Scheduler::from_config(&config, tx).await?;
//!     tokio::spawn(async move {
//!         while let Some(record) = rx.recv().await {
//!             println!("{}: {:?}", record.tag(), record.fields());
//!         }
//!     });
//!
//!     scheduler.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! }
//! ```
//!
//! ## Guarantees
//!
//! Delivery is at-least-once: offsets are checkpointed only after the lines
//! they cover were accepted by the sink, so a crash in between re-emits those
//! lines on restart. A line is emitted once its terminating `\n` has been
//! written; an unterminated tail is only emitted when its file is rotated away
//! or disappears for good.
//!
//! ## Caveats
//!
//! Rotation is recognised by a change of device and inode, which only exists
//! on unix. Elsewhere only truncation is detected.

mod buffer;
mod config;
mod emitter;
mod error;
mod events;
mod position;
mod resolver;
mod rotation;
mod scheduler;
mod watcher;

pub use buffer::LineBuffer;
pub use config::{TailConfig, WatchMode};
pub use emitter::{
    Emitted, Fields, LineParser, ParseError, Parsed, PassThrough, Record, RecordEmitter,
    RecordSink, RegexParser, SinkError,
};
pub use error::{Error, Result};
pub use events::FsEvents;
pub use position::{Checkpoint, Lookup, PositionStore};
pub use resolver::{expand_tag, GlobResolver, PathResolver, StaticResolver, WatchPath};
pub use rotation::{Change, FileId, RotationDetector, Snapshot};
pub use scheduler::Scheduler;
pub use watcher::{StartPosition, TailWatcher, WatchOptions, WatchState};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");

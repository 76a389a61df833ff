#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use linetail::{GlobResolver, Record, Scheduler, TailConfig, WatchMode};
use tokio::sync::mpsc::{self, UnboundedReceiver};

pub const TAG: &str = "t1";

/// Mirrors a typical deployment: one file, a position file next to it and a
/// format capturing the whole line.
pub fn config(dir: &Path, start_reading_head: bool) -> TailConfig {
    TailConfig {
        paths: vec![dir.join("tail.txt").display().to_string()],
        tag: TAG.to_string(),
        rotate_wait: Duration::ZERO,
        pos_file: Some(dir.join("tail.pos")),
        start_reading_head,
        format: Some("(?<message>.*)".to_string()),
        watch_mode: WatchMode::Poll,
        ..TailConfig::default()
    }
}

pub async fn scheduler(config: &TailConfig) -> (Scheduler<GlobResolver>, UnboundedReceiver<Record>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::from_config(config, tx).await.unwrap();
    (scheduler, rx)
}

pub fn messages(rx: &mut UnboundedReceiver<Record>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(record) = rx.try_recv() {
        assert_eq!(record.tag(), TAG);
        out.push(record.get("message").unwrap().to_string());
    }
    out
}

pub fn append(path: &Path, data: &str) {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(data.as_bytes()).unwrap();
    f.flush().unwrap();
}

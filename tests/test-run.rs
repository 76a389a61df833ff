mod common;

use std::time::Duration;

use common::{append, config, scheduler};
use linetail::{TailConfig, WatchMode};
use tempfile::tempdir;
use tokio::sync::oneshot;
use tokio::time;

const TIMEOUT_2_SEC: Duration = Duration::from_millis(2000);

async fn run_until_two_lines(config: TailConfig) {
    let path = config.pos_file.as_ref().unwrap().with_file_name("tail.txt");
    append(&path, "before\n");

    let (lines, mut rx) = scheduler(&config).await;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(lines.run(async move {
        let _ = stop_rx.await;
    }));

    // Give the first tick a chance to pick the file up at its end.
    time::sleep(Duration::from_millis(200)).await;
    append(&path, "foo\nbar\n");

    let first = time::timeout(TIMEOUT_2_SEC, rx.recv()).await.unwrap().unwrap();
    let second = time::timeout(TIMEOUT_2_SEC, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.get("message"), Some("foo"));
    assert_eq!(second.get("message"), Some("bar"));

    stop_tx.send(()).unwrap();
    time::timeout(TIMEOUT_2_SEC, handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let pos = std::fs::read_to_string(config.pos_file.as_ref().unwrap()).unwrap();
    assert!(pos.starts_with("15\t"), "unexpected position file: {:?}", pos);
}

#[tokio::test]
pub async fn test_run_polling() {
    let dir = tempdir().unwrap();
    let config = TailConfig {
        poll_interval: Duration::from_millis(20),
        ..config(dir.path(), false)
    };

    run_until_two_lines(config).await;
}

#[tokio::test]
pub async fn test_run_woken_by_notifications() {
    let dir = tempdir().unwrap();
    let config = TailConfig {
        // Long enough that only a filesystem event can deliver in time.
        poll_interval: Duration::from_secs(30),
        watch_mode: WatchMode::Notify,
        ..config(dir.path(), false)
    };

    run_until_two_lines(config).await;
}

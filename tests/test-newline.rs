mod common;

use common::{append, config, messages, scheduler};
use tempfile::tempdir;

#[tokio::test]
pub async fn test_lf() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tail.txt");
    append(&path, "");

    let (mut lines, mut rx) = scheduler(&config(dir.path(), false)).await;
    lines.tick().await;

    append(&path, "test3");
    lines.tick().await;
    assert!(messages(&mut rx).is_empty());

    append(&path, "test4\n");
    lines.tick().await;
    assert_eq!(messages(&mut rx), vec!["test3test4"]);
}

#[tokio::test]
pub async fn test_whitespace() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tail.txt");
    append(&path, "");

    let (mut lines, mut rx) = scheduler(&config(dir.path(), false)).await;
    lines.tick().await;

    append(&path, "    \n    4 spaces\n4 spaces    \n\t\n\ttab\ntab\t\n\n");
    lines.tick().await;

    assert_eq!(
        messages(&mut rx),
        vec!["    ", "    4 spaces", "4 spaces    ", "\t", "\ttab", "tab\t", ""]
    );
}

#[tokio::test]
pub async fn test_carriage_return_is_kept() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tail.txt");
    append(&path, "");

    let (mut lines, mut rx) = scheduler(&config(dir.path(), false)).await;
    lines.tick().await;

    append(&path, "dos line\r\n");
    lines.tick().await;
    assert_eq!(messages(&mut rx), vec!["dos line\r"]);
}

#[tokio::test]
pub async fn test_large_backlog_is_read_in_chunks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tail.txt");
    append(&path, "aaaa\nbb\n");

    let config = linetail::TailConfig {
        read_bytes_limit: 4,
        ..config(dir.path(), true)
    };
    let (mut lines, mut rx) = scheduler(&config).await;

    lines.tick().await;
    assert!(messages(&mut rx).is_empty());
    assert_eq!(lines.watcher(&path).unwrap().offset(), 4);

    lines.tick().await;
    assert_eq!(messages(&mut rx), vec!["aaaa", "bb"]);
}

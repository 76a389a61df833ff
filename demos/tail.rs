//! Tails every file matching the given glob patterns and prints its records.
//!
//! Usage:
//!     tail /path/to/positions.pos '/var/log/app/*.log' ...
//!
//! Files may be created, rotated or truncated while the demo runs. Stop it
//! with ctrl-c; running it again continues from the recorded positions.

use linetail::{Scheduler, TailConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let pos_file = args.next().ok_or("missing position file argument")?;
    let paths: Vec<String> = args.collect();

    let config = TailConfig {
        paths,
        tag: "demo.*".to_string(),
        pos_file: Some(pos_file.into()),
        ..TailConfig::default()
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<linetail::Record>();
    let scheduler = Scheduler::from_config(&config, tx).await?;

    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let message = record.get("message").unwrap_or_default();
            println!("({}) {} {}", record.tag(), record.timestamp(), message);
        }
    });

    scheduler
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

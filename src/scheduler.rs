//! The poll loop driving every watched file.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::stream::StreamExt;
use tokio::fs;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{TailConfig, WatchMode};
use crate::emitter::{RecordEmitter, RecordSink};
use crate::error::Result;
use crate::events::FsEvents;
use crate::position::PositionStore;
use crate::resolver::{GlobResolver, PathResolver, WatchPath};
use crate::watcher::{StartPosition, TailWatcher, WatchOptions};

/// Owns the set of [`TailWatcher`]s and advances them in serialized ticks.
///
/// A tick optionally refreshes the watch set from the [`PathResolver`], then
/// lets each watcher read, emit and checkpoint in path order, and finally starts
/// one background write of the position file. Watchers never run concurrently, so a checkpoint
/// can only be observed after the lines it covers were emitted.
pub struct Scheduler<R> {
    resolver: R,
    watchers: BTreeMap<PathBuf, TailWatcher>,
    store: PositionStore,
    emitter: RecordEmitter,
    start: StartPosition,
    options: WatchOptions,
    poll_interval: Duration,
    refresh_interval: Duration,
    last_refresh: Option<Instant>,
    events: Option<FsEvents>,
}

impl<R> std::fmt::Debug for Scheduler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("watchers", &self.watchers)
            .field("store", &self.store)
            .field("emitter", &self.emitter)
            .field("events", &self.events)
            .finish()
    }
}

impl Scheduler<GlobResolver> {
    /// Builds a scheduler tailing the glob patterns of `config`.
    pub async fn from_config(
        config: &TailConfig,
        sink: impl RecordSink + 'static,
    ) -> Result<Self> {
        let resolver = config.build_resolver()?;
        Scheduler::new(config, resolver, sink).await
    }
}

impl<R: PathResolver> Scheduler<R> {
    pub async fn new(
        config: &TailConfig,
        resolver: R,
        sink: impl RecordSink + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let emitter = RecordEmitter::new(config.build_parser()?, Box::new(sink));
        let store = match &config.pos_file {
            Some(pos_file) => PositionStore::open(pos_file).await,
            None => PositionStore::memory(),
        };

        let events = match config.watch_mode {
            WatchMode::Poll => None,
            WatchMode::Notify => match FsEvents::new() {
                Ok(events) => Some(events),
                Err(e) => {
                    warn!(error = %e, "filesystem notifications unavailable; polling only");
                    None
                }
            },
        };

        Ok(Scheduler {
            resolver,
            watchers: BTreeMap::new(),
            store,
            emitter,
            start: config.start_position(),
            options: config.watch_options(),
            poll_interval: config.poll_interval,
            refresh_interval: config.refresh_interval,
            last_refresh: None,
            events,
        })
    }

    /// Paths currently being watched.
    pub fn watched(&self) -> Vec<&Path> {
        self.watchers.keys().map(PathBuf::as_path).collect()
    }

    pub fn watcher(&self, path: impl AsRef<Path>) -> Option<&TailWatcher> {
        self.watchers.get(path.as_ref())
    }

    pub fn emitter(&self) -> &RecordEmitter {
        &self.emitter
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    /// Runs one poll cycle over all watchers.
    pub async fn tick(&mut self) {
        let refresh_due = self
            .last_refresh
            .map_or(true, |at| at.elapsed() >= self.refresh_interval);
        if refresh_due {
            self.refresh().await;
        }

        for watcher in self.watchers.values_mut() {
            watcher
                .tick(&mut self.emitter, &mut self.store, &self.options)
                .await;
        }

        let closed: Vec<PathBuf> = self
            .watchers
            .iter()
            .filter(|(_, watcher)| watcher.is_closed())
            .map(|(path, _)| path.clone())
            .collect();
        for path in closed {
            self.watchers.remove(&path);
            if let Some(events) = self.events.as_mut() {
                if let Err(e) = events.remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "failed to remove notification watch");
                }
            }
        }

        if let Err(e) = self.store.persist().await {
            warn!(error = %e, "failed to persist positions; retrying next tick");
        }
    }

    /// Re-resolves the watch set: new paths get a watcher, existing files no
    /// longer resolved are marked as unmatched.
    pub async fn refresh(&mut self) {
        self.last_refresh = Some(Instant::now());

        let resolved = match self.resolver.resolve() {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "failed to resolve watched paths");
                return;
            }
        };

        let wanted: HashSet<&Path> = resolved.iter().map(|w| w.path.as_path()).collect();
        for (path, watcher) in self.watchers.iter_mut() {
            // A path that vanished is left to the watcher, which keeps checking
            // it every tick and follows a rotation within the grace window.
            if wanted.contains(path.as_path()) || fs::symlink_metadata(path).await.is_err() {
                watcher.rematch();
            } else {
                watcher.unmatch();
            }
        }

        for WatchPath { path, tag } in resolved {
            if self.watchers.contains_key(&path) {
                continue;
            }

            match TailWatcher::open(&path, tag, self.start, &self.store).await {
                Ok(watcher) => {
                    if let Some(events) = self.events.as_mut() {
                        if let Err(e) = events.add_file(&path) {
                            debug!(path = %path.display(), error = %e, "failed to add notification watch");
                        }
                    }
                    self.watchers.insert(path, watcher);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "path does not exist yet");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to open file"),
            }
        }
    }

    /// Ticks every `poll_interval`, and on filesystem events when enabled,
    /// until `shutdown` completes.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(poll_interval = ?self.poll_interval, "tailing started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
                Some(paths) = next_event(&mut self.events) => {
                    debug!(?paths, "woken by filesystem event");
                }
            }

            self.tick().await;
        }

        self.shutdown().await
    }

    /// Checkpoints and releases every watcher, then writes the position file
    /// and waits for the write to complete.
    pub async fn shutdown(&mut self) -> Result<()> {
        for watcher in self.watchers.values_mut() {
            watcher.shutdown(&mut self.store);
        }
        self.watchers.clear();

        info!(
            emitted = self.emitter.emitted(),
            parse_failures = self.emitter.parse_failures(),
            "tailing stopped"
        );

        self.store.flush().await
    }
}

async fn next_event(events: &mut Option<FsEvents>) -> Option<Vec<PathBuf>> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}

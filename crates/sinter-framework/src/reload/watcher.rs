//! Plugin source watchers.
//!
//! A [`SourceWatcher`] reports created, modified and removed sources on an
//! mpsc channel until its cancellation token fires. [`PollingWatcher`] scans
//! the plugin directories on an interval and compares file metadata, which
//! works the same on every platform and filesystem.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::loader::{ManifestLoader, PluginLoader, scan_sources};
use crate::error::ReloadError;

/// Default interval between directory scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What happened to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A change to one plugin source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl SourceChange {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Reports plugin source changes.
#[async_trait]
pub trait SourceWatcher: Send {
    /// Sends changes to `tx` until `cancel` fires.
    ///
    /// Returns [`ReloadError::ChannelClosed`] if the receiver goes away first.
    async fn watch(
        &mut self,
        tx: mpsc::Sender<SourceChange>,
        cancel: CancellationToken,
    ) -> Result<(), ReloadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

/// Metadata-polling [`SourceWatcher`].
pub struct PollingWatcher {
    dirs: Vec<PathBuf>,
    interval: Duration,
    loader: Arc<dyn PluginLoader>,
    seen: HashMap<PathBuf, Fingerprint>,
}

impl PollingWatcher {
    /// Watches `dirs` for `*.plugin.toml` manifests.
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
            interval: DEFAULT_POLL_INTERVAL,
            loader: Arc::new(ManifestLoader),
            seen: HashMap::new(),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Uses `loader` to decide which files are sources.
    pub fn loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Records the current state without reporting anything.
    ///
    /// Call after the initial load so existing sources are not reported as
    /// created.
    pub async fn prime(&mut self) {
        self.seen = self.scan().await;
    }

    /// Scans once and returns every change since the previous scan.
    pub async fn poll(&mut self) -> Vec<SourceChange> {
        let current = self.scan().await;
        let mut changes = Vec::new();

        for (path, fingerprint) in &current {
            match self.seen.get(path) {
                None => changes.push(SourceChange::new(ChangeKind::Created, path)),
                Some(previous) if previous != fingerprint => {
                    changes.push(SourceChange::new(ChangeKind::Modified, path));
                }
                Some(_) => {}
            }
        }
        for path in self.seen.keys() {
            if !current.contains_key(path) {
                changes.push(SourceChange::new(ChangeKind::Removed, path));
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        self.seen = current;
        changes
    }

    async fn scan(&self) -> HashMap<PathBuf, Fingerprint> {
        let mut current = HashMap::new();
        for dir in &self.dirs {
            let sources = match scan_sources(dir, self.loader.as_ref()).await {
                Ok(sources) => sources,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Plugin directory scan failed");
                    // Keep the last known state so a transient error is not
                    // reported as a removal.
                    current.extend(
                        self.seen
                            .iter()
                            .filter(|(path, _)| path.starts_with(dir))
                            .map(|(path, fp)| (path.clone(), *fp)),
                    );
                    continue;
                }
            };
            for path in sources {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => {
                        let fingerprint = Fingerprint {
                            modified: meta.modified().ok(),
                            len: meta.len(),
                        };
                        current.insert(path, fingerprint);
                    }
                    Err(e) => trace!(path = %path.display(), error = %e, "Source vanished during scan"),
                }
            }
        }
        current
    }
}

impl std::fmt::Debug for PollingWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWatcher")
            .field("dirs", &self.dirs)
            .field("interval", &self.interval)
            .field("seen", &self.seen.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceWatcher for PollingWatcher {
    async fn watch(
        &mut self,
        tx: mpsc::Sender<SourceChange>,
        cancel: CancellationToken,
    ) -> Result<(), ReloadError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(dirs = ?self.dirs, interval_ms = self.interval.as_millis(), "Polling watcher started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Polling watcher stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            for change in self.poll().await {
                trace!(path = %change.path.display(), kind = ?change.kind, "Source change detected");
                if tx.send(change).await.is_err() {
                    return Err(ReloadError::ChannelClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "[[plugin]]\nkind = \"a\"\n";

    #[tokio::test]
    async fn test_poll_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.plugin.toml");
        let mut watcher = PollingWatcher::new([dir.path()]);
        watcher.prime().await;
        assert!(watcher.poll().await.is_empty());

        std::fs::write(&path, MANIFEST).unwrap();
        assert_eq!(
            watcher.poll().await,
            vec![SourceChange::new(ChangeKind::Created, &path)]
        );
        assert!(watcher.poll().await.is_empty());

        std::fs::write(&path, format!("{MANIFEST}priority = 3\n")).unwrap();
        assert_eq!(
            watcher.poll().await,
            vec![SourceChange::new(ChangeKind::Modified, &path)]
        );

        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            watcher.poll().await,
            vec![SourceChange::new(ChangeKind::Removed, &path)]
        );
    }

    #[tokio::test]
    async fn test_prime_hides_existing_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.plugin.toml"), MANIFEST).unwrap();
        std::fs::write(dir.path().join("readme.md"), "no").unwrap();

        let mut primed = PollingWatcher::new([dir.path()]);
        primed.prime().await;
        assert!(primed.poll().await.is_empty());

        let mut fresh = PollingWatcher::new([dir.path()]);
        let changes = fresh.poll().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Created);
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.plugin.toml");
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let mut watcher = PollingWatcher::new([dir.path()]).interval(Duration::from_millis(10));
        watcher.prime().await;
        let token = cancel.clone();
        let handle = tokio::spawn(async move { watcher.watch(tx, token).await });

        std::fs::write(&path, MANIFEST).unwrap();
        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, SourceChange::new(ChangeKind::Created, &path));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_watch_reports_closed_channel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.plugin.toml"), MANIFEST).unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let mut watcher = PollingWatcher::new([dir.path()]).interval(Duration::from_millis(10));
        let result = watcher.watch(tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(ReloadError::ChannelClosed)));
    }
}

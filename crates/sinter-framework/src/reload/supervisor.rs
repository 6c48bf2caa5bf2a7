//! The hot reload supervisor.
//!
//! Per-source state machine:
//!
//! ```text
//! Loaded ─▶ Watching ─▶ ChangeDetected ─▶ Debounced ─▶ hash unchanged ─▶ Watching
//!                                                  └─▶ hash changed ─▶ Reloading ─┬─▶ Swapped ─▶ Watching
//!                                                                                └─▶ Failed  ─▶ Watching
//! ```
//!
//! The content hash of every source is kept in a [`WatchEntry`]. Editors
//! that rewrite a file without changing it, or save twice in a row, never
//! touch the registry. A failed reload keeps the previous registrations of
//! that source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::loader::{LoadReport, ManifestLoader, PluginLoader, scan_sources, source_key};
use super::watcher::{ChangeKind, SourceChange};
use crate::error::{LoadError, LoadResult};
use crate::plugin::catalog::PluginCatalog;
use crate::plugin::registration::{DEFAULT_INIT_TIMEOUT, PluginRegistration, build_registration};
use crate::registry::{PluginRegistry, SwapSummary};
use crate::rule::PatternCache;

/// Default window in which repeated changes to one source are coalesced.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Plugin directories; source keys are relative to these.
    pub dirs: Vec<PathBuf>,
    pub debounce: Duration,
    /// Bound on each plugin's `init`.
    pub init_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
            debounce: DEFAULT_DEBOUNCE,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }
}

/// Last known state of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub path: PathBuf,
    /// Registration key of the source.
    pub key: String,
    /// SHA-256 of the content, hex encoded.
    pub hash: String,
}

/// What handling one change did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Content hash matched; nothing was touched.
    Unchanged,
    /// The source's registrations were swapped.
    Swapped(SwapSummary),
    /// The source was deleted and this many registrations dropped.
    Removed(usize),
    /// Reload failed; previous registrations are kept.
    Failed(String),
}

/// Registrations built from one source.
struct BuiltSource {
    registrations: Vec<PluginRegistration>,
    missing: Vec<String>,
    failed: Vec<String>,
}

impl BuiltSource {
    fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }
}

/// Loads plugin sources and keeps the registry in sync with them.
pub struct HotReloadSupervisor {
    registry: Arc<PluginRegistry>,
    catalog: Arc<PluginCatalog>,
    loader: Arc<dyn PluginLoader>,
    patterns: PatternCache,
    config: SupervisorConfig,
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
}

impl HotReloadSupervisor {
    pub fn new(registry: Arc<PluginRegistry>, catalog: Arc<PluginCatalog>, config: SupervisorConfig) -> Self {
        Self {
            registry,
            catalog,
            loader: Arc::new(ManifestLoader),
            patterns: PatternCache::new(),
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the default manifest loader.
    pub fn with_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> Arc<dyn PluginLoader> {
        Arc::clone(&self.loader)
    }

    /// Watch entries, sorted by path.
    pub fn entries(&self) -> Vec<WatchEntry> {
        let mut entries: Vec<WatchEntry> = self.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// Loads every source in the configured directories.
    ///
    /// Errors are isolated per source and per plugin. Kinds missing from the
    /// catalog are collected and reported once at the end of the pass.
    pub async fn initial_load(&self) -> LoadReport {
        let mut report = LoadReport::default();

        for dir in &self.config.dirs {
            let sources = match scan_sources(dir, self.loader.as_ref()).await {
                Ok(sources) => sources,
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "Plugin directory scan failed");
                    report.failed.push((dir.clone(), e.to_string()));
                    continue;
                }
            };

            for path in sources {
                let key = source_key(dir, &path);
                let hash = match read_hash(&path).await {
                    Ok(hash) => hash,
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Plugin source unreadable");
                        report.failed.push((path, e.to_string()));
                        continue;
                    }
                };
                self.remember(&path, &key, hash);

                match self.build_source(&key, &path).await {
                    Ok(built) => {
                        report
                            .missing
                            .extend(built.missing.into_iter().map(|kind| (path.clone(), kind)));
                        report
                            .failed
                            .extend(built.failed.into_iter().map(|reason| (path.clone(), reason)));
                        if built.registrations.is_empty() {
                            continue;
                        }
                        let summary = self.registry.apply_source(&key, built.registrations);
                        report.loaded.push((key, summary.added + summary.replaced));
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Plugin source failed to load");
                        report.failed.push((path, e.to_string()));
                    }
                }
            }
        }

        let missing = report.missing_kinds();
        if !missing.is_empty() {
            warn!(kinds = ?missing, "Plugin kinds missing from the catalog, dependent plugins skipped");
        }
        info!(
            plugins = report.plugin_count(),
            sources = report.loaded.len(),
            failed = report.failed.len(),
            "Initial plugin load finished"
        );
        report
    }

    /// Applies one source change to the registry.
    ///
    /// A changed source is reloaded all-or-nothing: if any of its plugins
    /// cannot be built the previous registrations stay in place.
    pub async fn handle_change(&self, change: &SourceChange) -> ReloadOutcome {
        let path = change.path.as_path();
        let key = self.key_for(path);

        if change.kind == ChangeKind::Removed {
            self.entries.lock().remove(path);
            let removed = self.registry.remove_source(&key);
            info!(key = %key, removed, "Plugin source deleted");
            return ReloadOutcome::Removed(removed);
        }

        let hash = match read_hash(path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Changed plugin source unreadable");
                return ReloadOutcome::Failed(e.to_string());
            }
        };
        if self.entries.lock().get(path).is_some_and(|e| e.hash == hash) {
            debug!(key = %key, "Plugin source content unchanged");
            return ReloadOutcome::Unchanged;
        }
        self.remember(path, &key, hash);

        let built = match self.build_source(&key, path).await {
            Ok(built) => built,
            Err(e) => {
                error!(key = %key, error = %e, "Plugin reload failed, keeping previous registrations");
                return ReloadOutcome::Failed(e.to_string());
            }
        };
        if !built.is_complete() {
            let reason = built
                .missing
                .into_iter()
                .map(|kind| {
                    LoadError::MissingDependency {
                        path: path.to_path_buf(),
                        kind,
                    }
                    .to_string()
                })
                .chain(built.failed)
                .collect::<Vec<_>>()
                .join("; ");
            error!(key = %key, reason = %reason, "Plugin reload failed, keeping previous registrations");
            return ReloadOutcome::Failed(reason);
        }

        let summary = self.registry.apply_source(&key, built.registrations);
        info!(
            key = %key,
            kind = ?change.kind,
            replaced = summary.replaced,
            added = summary.added,
            removed = summary.removed,
            "Plugin source reloaded"
        );
        ReloadOutcome::Swapped(summary)
    }

    /// Consumes changes until `cancel` fires or the channel closes.
    ///
    /// Changes to the same path within the debounce window are coalesced;
    /// the last reported kind wins.
    pub async fn run(&self, mut rx: mpsc::Receiver<SourceChange>, cancel: CancellationToken) {
        let mut pending: HashMap<PathBuf, (ChangeKind, Instant)> = HashMap::new();
        debug!(debounce_ms = self.config.debounce.as_millis(), "Hot reload supervisor started");

        loop {
            let next_due = pending.values().map(|(_, due)| *due).min();
            tokio::select! {
                () = cancel.cancelled() => break,
                change = rx.recv() => match change {
                    Some(change) => {
                        pending.insert(change.path, (change.kind, Instant::now() + self.config.debounce));
                    }
                    None => break,
                },
                () = sleep_until_due(next_due) => {
                    let now = Instant::now();
                    let due: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, (_, at))| *at <= now)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in due {
                        if let Some((kind, _)) = pending.remove(&path) {
                            self.handle_change(&SourceChange::new(kind, path)).await;
                        }
                    }
                }
            }
        }
        debug!(dropped = pending.len(), "Hot reload supervisor stopped");
    }

    fn key_for(&self, path: &Path) -> String {
        if let Some(entry) = self.entries.lock().get(path) {
            return entry.key.clone();
        }
        let root = self
            .config
            .dirs
            .iter()
            .filter(|dir| path.starts_with(dir))
            .max_by_key(|dir| dir.components().count());
        match root {
            Some(root) => source_key(root, path),
            None => source_key(path.parent().unwrap_or(path), path),
        }
    }

    fn remember(&self, path: &Path, key: &str, hash: String) {
        self.entries.lock().insert(
            path.to_path_buf(),
            WatchEntry {
                path: path.to_path_buf(),
                key: key.to_string(),
                hash,
            },
        );
    }

    async fn build_source(&self, key: &str, path: &Path) -> LoadResult<BuiltSource> {
        let definitions = self.loader.load(path).await?;
        let mut built = BuiltSource {
            registrations: Vec::with_capacity(definitions.len()),
            missing: Vec::new(),
            failed: Vec::new(),
        };

        for definition in &definitions {
            let Some(factory) = self.catalog.get(&definition.kind) else {
                debug!(key, kind = %definition.kind, "Plugin kind not in catalog");
                built.missing.push(definition.kind.clone());
                continue;
            };
            match build_registration(
                key,
                Some(path.to_path_buf()),
                definition,
                factory,
                &self.patterns,
                self.config.init_timeout,
            )
            .await
            {
                Ok(registration) => built.registrations.push(registration),
                Err(e) => {
                    error!(key, kind = %definition.kind, error = %e, "Plugin skipped");
                    built.failed.push(e.to_string());
                }
            }
        }

        Ok(built)
    }
}

impl std::fmt::Debug for HotReloadSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadSupervisor")
            .field("config", &self.config)
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

async fn read_hash(path: &Path) -> LoadResult<String> {
    let bytes = tokio::fs::read(path).await.map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

//! Hot reload of plugin sources.
//!
//! Three pieces cooperate over a tokio channel:
//!
//! ```text
//! SourceWatcher ──SourceChange──▶ mpsc ──▶ HotReloadSupervisor
//!  (PollingWatcher)                             │
//!                                               ├─ sha256 compare (unchanged ⇒ stop)
//!                                               ├─ debounce
//!                                               ├─ PluginLoader::load
//!                                               ├─ catalog lookup + build_registration
//!                                               └─ PluginRegistry::apply_source / remove_source
//! ```
//!
//! Watchers only report paths; they never touch the registry. The
//! supervisor owns the per-file [`WatchEntry`] state and is the only writer
//! of plugin sources during hot reload.

pub mod loader;
pub mod supervisor;
pub mod watcher;

pub use loader::{LoadReport, ManifestLoader, PluginLoader, MANIFEST_SUFFIX, scan_sources, source_key};
pub use supervisor::{DEFAULT_DEBOUNCE, HotReloadSupervisor, ReloadOutcome, SupervisorConfig, WatchEntry};
pub use watcher::{ChangeKind, DEFAULT_POLL_INTERVAL, PollingWatcher, SourceChange, SourceWatcher};

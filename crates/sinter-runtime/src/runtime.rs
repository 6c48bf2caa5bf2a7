//! Runtime orchestration.
//!
//! [`SinterRuntime`] wires the pieces of the engine together from one
//! [`SinterConfig`]:
//!
//! ```text
//!            raw payload
//!                 │ handle_raw
//!                 ▼
//!   EventNormalizer ──▶ EventBus (record + publish)
//!                 │
//!                 ▼
//!            RuleRouter ◀── PluginRegistry ◀── HotReloadSupervisor ◀── PollingWatcher
//!                                                    (background tasks started by run)
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sinter_runtime::SinterRuntime;
//!
//! let runtime = SinterRuntime::builder()
//!     .config_file("config/sinter.toml")
//!     .build()?;
//!
//! // Adapters feed payloads in from their own tasks:
//! // runtime.handle_raw("10001", &payload, Some(transport)).await;
//!
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sinter_core::{BoxedTransport, EventBus, EventNormalizer};
use sinter_framework::reload::SupervisorConfig;
use sinter_framework::{
    ContextStore, DispatchPolicy, DispatchReport, HotReloadSupervisor, PluginCatalog,
    PluginRegistry, PollingWatcher, RuleRouter, Scheduler, SourceWatcher, StaticPolicy,
    StatsSnapshot, Throttle,
};

use crate::config::{ConfigLoader, SinterConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Reply sent on the device/stdin path when a handler failed and nothing
/// handled the event.
pub const FAILURE_ACK: &str = "Something went wrong while handling that.";

/// Capacity of the watcher to supervisor channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Tasks spawned by [`SinterRuntime::start`].
struct Background {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// The Sinter runtime.
pub struct SinterRuntime {
    config: SinterConfig,
    normalizer: EventNormalizer,
    bus: Arc<EventBus>,
    router: RuleRouter,
    supervisor: Arc<HotReloadSupervisor>,
    running: AtomicBool,
    background: Mutex<Option<Background>>,
}

impl SinterRuntime {
    /// Creates a runtime builder.
    ///
    /// ```rust,ignore
    /// let runtime = SinterRuntime::builder()
    ///     .config_file("config/sinter.toml")
    ///     .profile("production")
    ///     .build()?;
    /// ```
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from a loaded configuration with the linked plugin
    /// catalog and a [`StaticPolicy`] built from `config.dispatch`.
    pub fn from_config(config: SinterConfig) -> RuntimeResult<Self> {
        RuntimeBuilder::new().config(config).build()
    }

    fn assemble(
        config: SinterConfig,
        catalog: PluginCatalog,
        policy: Option<Arc<dyn DispatchPolicy>>,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Self {
        let registry = Arc::new(PluginRegistry::default());
        if let Some(scheduler) = scheduler {
            registry.set_scheduler(scheduler);
        }
        let policy = policy.unwrap_or_else(|| {
            Arc::new(StaticPolicy::new(config.dispatch.clone())) as Arc<dyn DispatchPolicy>
        });
        let throttle = Arc::new(Throttle::new(config.runtime.dedup_window()));
        let router = RuleRouter::new(Arc::clone(&registry), policy, throttle);

        let supervisor = HotReloadSupervisor::new(
            registry,
            Arc::new(catalog),
            SupervisorConfig::new(config.plugins.dirs.iter().cloned())
                .debounce(config.plugins.debounce())
                .init_timeout(config.plugins.init_timeout()),
        );

        info!(
            plugin_dirs = ?config.plugins.dirs,
            hot_reload = config.plugins.hot_reload,
            log_level = %config.logging.level,
            "Runtime initialized from configuration"
        );

        Self {
            normalizer: EventNormalizer::with_masters(config.dispatch.masters.iter().cloned()),
            bus: Arc::new(EventBus::new(config.history)),
            router,
            supervisor: Arc::new(supervisor),
            running: AtomicBool::new(false),
            background: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &SinterConfig {
        &self.config
    }

    /// Event history and subscriptions.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn router(&self) -> &RuleRouter {
        &self.router
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        self.router.registry()
    }

    pub fn supervisor(&self) -> &Arc<HotReloadSupervisor> {
        &self.supervisor
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.router.stats()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // =========================================================================
    // Event intake
    // =========================================================================

    /// Normalizes, records and dispatches one raw payload.
    ///
    /// `bot_id` stands in for a missing `self_id`. The transport is attached
    /// before the event is shared, so every handler can reply through it.
    pub async fn handle_raw(
        &self,
        bot_id: &str,
        raw: &Value,
        transport: Option<BoxedTransport>,
    ) -> DispatchReport {
        let mut event = match raw.as_object() {
            Some(obj) if !obj.contains_key("self_id") && !bot_id.is_empty() => {
                let mut raw = raw.clone();
                raw["self_id"] = Value::String(bot_id.to_string());
                self.normalizer.normalize(&raw)
            }
            _ => self.normalizer.normalize(raw),
        };
        if event.bot_id.is_empty() {
            event.bot_id = bot_id.to_string();
        }
        if let Some(transport) = transport {
            event = event.with_transport(transport);
        }
        let event = Arc::new(event);

        debug!(event = %event.log_label, bot = %event.bot_id, "Event received");
        let category = event.category.as_str().to_string();
        self.bus.emit(&category, Arc::clone(&event));

        let report = self.router.dispatch_report(Arc::clone(&event)).await;

        if event.is_special() && report.errors > 0 && !report.handled {
            match event.reply(FAILURE_ACK).await {
                Ok(_) => debug!(event_id = %event.id, "Failure acknowledged"),
                Err(e) => debug!(event_id = %event.id, error = %e, "Failure acknowledgment not sent"),
            }
        }
        report
    }

    /// Parses `raw` as JSON and handles it; unparseable text becomes an
    /// `unknown` event.
    pub async fn handle_raw_str(
        &self,
        bot_id: &str,
        raw: &str,
        transport: Option<BoxedTransport>,
    ) -> DispatchReport {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_raw(bot_id, &value, transport).await,
            Err(_) => {
                let mut event = self.normalizer.normalize_str(raw);
                event.bot_id = bot_id.to_string();
                if let Some(transport) = transport {
                    event = event.with_transport(transport);
                }
                let event = Arc::new(event);
                self.bus.emit("unknown", Arc::clone(&event));
                self.router.dispatch_report(event).await
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Loads every plugin source and starts the background tasks.
    pub async fn start(&self) -> RuntimeResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::AlreadyRunning);
        }
        info!("Starting Sinter runtime");

        let report = self.supervisor.initial_load().await;
        for (path, reason) in &report.failed {
            warn!(path = %path.display(), reason = %reason, "Plugin source failed to load");
        }
        let missing = report.missing_kinds();
        if !missing.is_empty() {
            warn!(kinds = ?missing, "Plugin kinds not linked into this build");
        }
        info!(
            plugins = report.plugin_count(),
            sources = report.loaded.len(),
            "Plugins loaded"
        );

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        if self.config.plugins.hot_reload {
            let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
            let mut watcher = PollingWatcher::new(self.config.plugins.dirs.iter().cloned())
                .interval(self.config.plugins.poll_interval())
                .loader(self.supervisor.loader());
            watcher.prime().await;

            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = watcher.watch(tx, token).await {
                    error!(error = %e, "Plugin watcher stopped");
                }
            }));

            let supervisor = Arc::clone(&self.supervisor);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move { supervisor.run(rx, token).await }));
        }

        handles.push(tokio::spawn(compaction_loop(
            Arc::clone(self.router.throttle()),
            Arc::clone(self.registry().contexts()),
            self.config.runtime.compaction_interval(),
            cancel.clone(),
        )));

        *self.background.lock() = Some(Background { cancel, handles });
        info!("Runtime started");
        Ok(())
    }

    /// Stops the background tasks and disposes plugin hooks.
    pub async fn stop(&self) -> RuntimeResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(RuntimeError::NotRunning);
        }
        info!("Stopping Sinter runtime");

        let background = self.background.lock().take();
        if let Some(Background { cancel, handles }) = background {
            cancel.cancel();
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Background task ended abnormally");
                }
            }
        }

        let disposed = self.registry().dispose_hooks();
        info!(hooks = disposed, "Runtime stopped");
        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Sinter runtime is now running. Press Ctrl+C to stop.");
        wait_for_shutdown().await;
        self.stop().await
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

impl std::fmt::Debug for SinterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinterRuntime")
            .field("running", &self.is_running())
            .field("router", &self.router)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

/// Sweeps expired throttle and continuation entries.
async fn compaction_loop(
    throttle: Arc<Throttle>,
    contexts: Arc<ContextStore>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let throttled = throttle.compact();
        let continuations = contexts.compact();
        if throttled + continuations > 0 {
            debug!(throttled, continuations, "Compacted expired entries");
        }
    }
}

/// Waits for Ctrl+C or, on unix, SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await;
                info!("Received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received Ctrl+C, shutting down");
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`SinterRuntime`].
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    config: Option<SinterConfig>,
    catalog: Option<PluginCatalog>,
    policy: Option<Arc<dyn DispatchPolicy>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    init_logging: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            config: None,
            catalog: None,
            policy: None,
            scheduler: None,
            init_logging: true,
        }
    }

    /// Loads exactly this configuration file.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g. "development", "production").
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges configuration under the file and environment layers.
    pub fn merge(mut self, config: SinterConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses `config` as is and skips loading.
    pub fn config(mut self, config: SinterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the linked plugin catalog.
    pub fn catalog(mut self, catalog: PluginCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replaces the [`StaticPolicy`] built from `dispatch`.
    pub fn policy(mut self, policy: Arc<dyn DispatchPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    /// Loads and validates the configuration, then builds the runtime.
    pub fn build(self) -> RuntimeResult<SinterRuntime> {
        let config = match self.config {
            Some(config) => config,
            None => self.config_loader.load()?,
        };
        validate_config(&config)?;

        if self.init_logging {
            logging::init_from_config(&config.logging);
        }

        Ok(SinterRuntime::assemble(
            config,
            self.catalog.unwrap_or_else(PluginCatalog::linked),
            self.policy,
            self.scheduler,
        ))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

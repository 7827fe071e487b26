//! Guest runtime lifecycle: setup, reload, hot-reload, shutdown.
//!
//! [`ScriptHost`] is the one object a host server keeps. It owns the
//! process-wide [`GuestEngine`], swaps in a fresh [`GuestRuntime`] on every
//! reload, binds the capability bridge and SDK into it, and loads the
//! script directory file by file.
//!
//! # Reload sequence
//!
//! ```text
//! lock ─► close current ─► detach registrations ─► locate transpiler
//!      ─► new context ─► bind bridge ─► eval SDK ─► install as current
//!      ─► load files (per-file isolation) ─► server.callSync("setup")
//!      ─► restart watcher (if hot reload is on)
//! ```
//!
//! The runtime is installed before files load so that host ticks arriving
//! mid-load see the new generation and do not prune fresh registrations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use crate::admin::AdminCommand;
use crate::bridge::marshal::Marshal;
use crate::bridge::CapabilityBridge;
use crate::config::{self, ScriptPaths, ScriptingConfig, SharedConfig};
use crate::diagnostics::{self, GuestFailure};
use crate::embedded::{ResourceBundle, SDK_BOOTSTRAP};
use crate::events::LifecycleEvent;
use crate::host::{ExtensionHost, HostCommand, PlayerDirectory, SystemRegistration};
use crate::proxy::command::DeferredExecutor;
use crate::proxy::component::CustomComponentType;
use crate::proxy::event::CANCELLED_FIELD;
use crate::proxy::packet::PacketFilter;
use crate::runtime::engine::{GuestEngine, GuestRuntime, RuntimeCell};
use crate::runtime::invoke::{BindScope, Invocation, Invoker};
use crate::runtime::timer::TimerQueue;
use crate::runtime::watcher::ScriptWatcher;
use crate::script::{self, ScriptKind, ScriptUnit};
use crate::transpile::{PathLocator, TranspileError, TranspilerBinding, TranspilerLocator};
use crate::value::{FieldAccess, FieldRecord, HostValue};

/// Origin label of SDK code in diagnostics.
const SDK_ORIGIN: &str = "sdk/bootstrap.js";

/// Console origin for callbacks that run after loading finished.
const LATE_ORIGIN: &str = "scripts";

/// What started a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    /// Initial load from [`ScriptHost::setup`].
    Setup,
    /// Direct call to [`ScriptHost::reload`].
    Manual,
    /// The script directory watcher.
    Watcher,
    /// The admin command.
    Command,
}

/// Per-file load failure.
#[derive(Debug, thiserror::Error)]
pub enum LoadFailure {
    /// The file could not be read.
    #[error("failed to read {file}: {message}")]
    Read {
        /// Script file name.
        file: String,
        /// IO error text.
        message: String,
    },
    /// The transpiler failed on the file.
    #[error(transparent)]
    Transpile(#[from] TranspileError),
    /// Evaluating the file threw.
    #[error("{0}")]
    Evaluate(GuestFailure),
}

impl LoadFailure {
    /// Name of the script the failure belongs to.
    pub fn file(&self) -> String {
        match self {
            Self::Read { file, .. } => file.clone(),
            Self::Transpile(
                TranspileError::Unavailable { file } | TranspileError::Spawn { file, .. } | TranspileError::Exit { file, .. },
            ) => script::display_name(file),
            Self::Evaluate(failure) => failure.origin.clone().unwrap_or_default(),
        }
    }
}

/// Outcome of one reload.
#[derive(Debug)]
pub struct ReloadReport {
    /// Generation created by this reload.
    pub generation: u64,
    /// What started it.
    pub trigger: ReloadTrigger,
    /// Transpiler located for this reload; `None` when TypeScript is disabled.
    pub transpiler: Option<TranspilerBinding>,
    /// Files evaluated successfully, in load order.
    pub loaded: Vec<String>,
    /// `.ts` files skipped because no transpiler was available.
    pub skipped: Vec<String>,
    /// Files that failed to read, transpile or evaluate.
    pub failures: Vec<LoadFailure>,
    /// Failure of the guest `setup` hook, if it threw.
    pub setup_failure: Option<GuestFailure>,
}

impl ReloadReport {
    fn new(generation: u64, trigger: ReloadTrigger, transpiler: Option<TranspilerBinding>) -> Self {
        Self {
            generation,
            trigger,
            transpiler,
            loaded: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            setup_failure: None,
        }
    }

    /// Whether every file loaded and `setup` ran cleanly.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty() && self.setup_failure.is_none()
    }

    /// Human-readable report lines, for echoing to a command sender.
    pub fn messages(&self) -> Vec<(log::Level, String)> {
        let mut lines = Vec::new();
        match &self.transpiler {
            Some(TranspilerBinding::None) => lines.push((
                log::Level::Warn,
                "No TypeScript transpiler found (bun/esbuild); .ts files are skipped".to_string(),
            )),
            Some(binding) => lines.push((log::Level::Info, format!("Using {binding} for TypeScript"))),
            None => {}
        }
        for name in &self.skipped {
            lines.push((log::Level::Warn, format!("Skipped {name}: no transpiler available")));
        }
        for failure in &self.failures {
            lines.push((log::Level::Error, failure.to_string()));
        }
        if let Some(failure) = &self.setup_failure {
            lines.push((log::Level::Error, format!("setup hook failed: {failure}")));
        }
        lines.push((
            log::Level::Info,
            format!(
                "Loaded {} script(s), {} failed (generation {})",
                self.loaded.len(),
                self.failures.len(),
                self.generation
            ),
        ));
        lines
    }
}

/// Work done by one [`ScriptHost::pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Timers fired.
    pub timers: usize,
    /// Promise jobs run.
    pub jobs: usize,
}

// ── Builder ──────────────────────────────────────────────────────────

/// Configures a [`ScriptHost`].
pub struct ScriptHostBuilder {
    paths: ScriptPaths,
    host: Arc<dyn ExtensionHost>,
    config: Option<ScriptingConfig>,
    locator: Box<dyn TranspilerLocator>,
    resources: ResourceBundle,
    tokio: Option<tokio::runtime::Handle>,
    admin_command: bool,
}

impl std::fmt::Debug for ScriptHostBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHostBuilder")
            .field("paths", &self.paths)
            .field("config", &self.config)
            .field("locator", &self.locator)
            .finish_non_exhaustive()
    }
}

impl ScriptHostBuilder {
    /// Use `config` instead of reading `config.json`.
    ///
    /// Without a config file there is no "newly created" signal; the run
    /// counts as a first run when the SDK directory does not exist yet.
    pub fn config(mut self, config: ScriptingConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the `PATH` transpiler lookup.
    pub fn transpiler(mut self, locator: impl TranspilerLocator + 'static) -> Self {
        self.locator = Box::new(locator);
        self
    }

    /// Replace the embedded resource bundle.
    pub fn resources(mut self, resources: ResourceBundle) -> Self {
        self.resources = resources;
        self
    }

    /// Run deferred command bodies on this tokio runtime.
    pub fn tokio_handle(mut self, handle: tokio::runtime::Handle) -> Self {
        self.tokio = Some(handle);
        self
    }

    /// Whether `setup()` registers the built-in `hyscript` command (default on).
    pub fn admin_command(mut self, enabled: bool) -> Self {
        self.admin_command = enabled;
        self
    }

    /// Create the engine and load configuration. Nothing is evaluated yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or created, or
    /// the guest engine cannot be initialized.
    pub fn build(self) -> Result<ScriptHost> {
        let (config, first_run) = match self.config {
            Some(config) => (config, !self.paths.sdk_dir().exists()),
            None => ScriptingConfig::load_or_create(&self.paths.config_file())?,
        };

        let engine = GuestEngine::new()?;
        let cell = Arc::new(RuntimeCell::default());
        let marshal = Arc::new(Marshal::default());
        let invoker = Arc::new(Invoker::new(Arc::clone(&cell), Arc::clone(&marshal)));
        let timers = Arc::new(TimerQueue::default());
        let bridge = Arc::new(CapabilityBridge::new(
            Arc::clone(&self.host),
            Arc::clone(&invoker),
            marshal,
            Arc::clone(&timers),
            DeferredExecutor::new(self.tokio),
        ));

        log::debug!(
            "Script host created (root={}, first_run={first_run}, hot_reload={}, typescript={})",
            self.paths.root.display(),
            config.is_hot_reload_enabled,
            config.enable_typescript
        );

        Ok(ScriptHost {
            inner: Arc::new(HostInner {
                paths: self.paths,
                host: self.host,
                config: config.shared(),
                first_run: AtomicBool::new(first_run),
                locator: self.locator,
                resources: self.resources,
                engine,
                cell,
                invoker,
                timers,
                bridge,
                generation: AtomicU64::new(0),
                reload_lock: Mutex::new(()),
                watcher: Mutex::new(None),
                transpiler: RwLock::new(TranspilerBinding::None),
                admin_command: self.admin_command,
                admin_registered: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

// ── Host ─────────────────────────────────────────────────────────────

struct HostInner {
    paths: ScriptPaths,
    host: Arc<dyn ExtensionHost>,
    config: SharedConfig,
    first_run: AtomicBool,
    locator: Box<dyn TranspilerLocator>,
    resources: ResourceBundle,
    engine: GuestEngine,
    cell: Arc<RuntimeCell>,
    invoker: Arc<Invoker>,
    timers: Arc<TimerQueue>,
    bridge: Arc<CapabilityBridge>,
    generation: AtomicU64,
    reload_lock: Mutex<()>,
    watcher: Mutex<Option<ScriptWatcher>>,
    transpiler: RwLock<TranspilerBinding>,
    admin_command: bool,
    admin_registered: AtomicBool,
    shut_down: AtomicBool,
}

/// The scripting runtime of one host server. Cheap to clone.
#[derive(Clone)]
pub struct ScriptHost {
    inner: Arc<HostInner>,
}

/// Non-owning handle to a [`ScriptHost`], held by the watcher thread and
/// the admin command.
#[derive(Clone)]
pub(crate) struct WeakScriptHost(Weak<HostInner>);

impl WeakScriptHost {
    pub(crate) fn upgrade(&self) -> Option<ScriptHost> {
        self.0.upgrade().map(|inner| ScriptHost { inner })
    }

    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self(Weak::new())
    }
}

impl std::fmt::Debug for WeakScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakScriptHost").field(&self.0.strong_count()).finish()
    }
}

impl std::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("root", &self.inner.paths.root)
            .field("generation", &self.generation())
            .field("watching", &self.is_watching())
            .field("bridge", &self.inner.bridge)
            .finish_non_exhaustive()
    }
}

impl ScriptHost {
    /// Start configuring a host rooted at `paths`.
    pub fn builder(paths: ScriptPaths, host: Arc<dyn ExtensionHost>) -> ScriptHostBuilder {
        ScriptHostBuilder {
            paths,
            host,
            config: None,
            locator: Box::new(PathLocator),
            resources: ResourceBundle::embedded(),
            tokio: None,
            admin_command: true,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakScriptHost {
        WeakScriptHost(Arc::downgrade(&self.inner))
    }

    /// Prepare the data directory and perform the initial load.
    ///
    /// Seeds declarations and example scripts on the first run only,
    /// registers the admin command once, reloads, and starts the watcher
    /// when hot reload is on.
    ///
    /// # Errors
    ///
    /// Returns an error if the script directory cannot be created or the
    /// initial reload is fatal (missing or broken SDK).
    pub fn setup(&self) -> Result<ReloadReport> {
        let scripts = self.inner.paths.scripts_dir();
        fs::create_dir_all(&scripts)
            .with_context(|| format!("Failed to create script directory {}", scripts.display()))?;

        if self.inner.first_run.swap(false, Ordering::SeqCst) {
            self.seed()?;
        }

        if self.inner.admin_command && !self.inner.admin_registered.swap(true, Ordering::SeqCst) {
            self.inner.host.register_command(Arc::new(AdminCommand::new(self.downgrade())));
        }

        self.reload_with(ReloadTrigger::Setup)
    }

    /// Copy bundled declarations and example scripts into the data
    /// directory, leaving existing files alone. Returns the number copied.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory or file cannot be written.
    pub fn seed(&self) -> Result<usize> {
        seed(&self.inner.resources, &self.inner.paths)
    }

    /// Replace the guest runtime and load every script again.
    ///
    /// # Errors
    ///
    /// Returns an error only for fatal conditions (shut down, guest context
    /// creation, missing or broken SDK). Per-file failures are in the report.
    pub fn reload(&self) -> Result<ReloadReport> {
        self.reload_with(ReloadTrigger::Manual)
    }

    /// Like [`reload`](Self::reload), tagging the report with `trigger`.
    pub fn reload_with(&self, trigger: ReloadTrigger) -> Result<ReloadReport> {
        let _guard = self.inner.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let report = self.reload_locked(trigger)?;
        if trigger != ReloadTrigger::Watcher {
            self.restart_watcher();
        }
        Ok(report)
    }

    fn reload_locked(&self, trigger: ReloadTrigger) -> Result<ReloadReport> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            bail!("script host is shut down");
        }
        let started = Instant::now();

        if let Some(previous) = inner.cell.close_current() {
            log::debug!("Closed guest generation {previous}");
        }
        inner.bridge.reload();

        let config = config::snapshot(&inner.config);
        let transpiler = config.enable_typescript.then(|| {
            let binding = inner.locator.locate();
            match &binding {
                TranspilerBinding::None => {
                    log::warn!("No TypeScript transpiler found (bun/esbuild); .ts files will be skipped")
                }
                found => log::info!("Using {found} for TypeScript"),
            }
            binding
        });
        *inner.transpiler.write().unwrap_or_else(PoisonError::into_inner) =
            transpiler.clone().unwrap_or(TranspilerBinding::None);

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let runtime = Arc::new(inner.engine.create_runtime(generation)?);
        let scope = Arc::new(BindScope::new(generation));

        let Some(sdk) = inner.resources.get(SDK_BOOTSTRAP) else {
            log::error!("fatal: bundled SDK '{SDK_BOOTSTRAP}' is missing; no scripts loaded");
            return Err(anyhow!("bundled SDK '{SDK_BOOTSTRAP}' is missing"));
        };
        bootstrap(&inner.bridge, &runtime, &scope, sdk).map_err(|failure| {
            log::error!("fatal: SDK bootstrap failed: {failure}");
            anyhow!("SDK bootstrap failed: {failure}")
        })?;
        inner.cell.install(Arc::clone(&runtime));

        let mut report = ReloadReport::new(generation, trigger, transpiler);
        let scripts_dir = inner.paths.scripts_dir();
        let files = script::discover(&scripts_dir).unwrap_or_else(|e| {
            log::error!("{e:#}");
            Vec::new()
        });
        for path in files {
            self.load_file(&runtime, &scope, &path, &mut report);
        }

        scope.set_origin(LATE_ORIGIN);
        if let Err(failure) = runtime.with(|ctx| {
            CapabilityBridge::bind_console(&ctx, LATE_ORIGIN)
                .map_err(|e| diagnostics::capture(&ctx, &e, Some(LATE_ORIGIN)))
        }) {
            log::warn!("Failed to rebind console: {failure}");
        }
        inner.engine.run_pending_jobs();

        if let Invocation::Failed(failure) = inner.invoker.call_global("server", "callSync", &[HostValue::from("setup")]) {
            report.setup_failure = Some(failure);
        }
        inner.engine.run_pending_jobs();

        log::info!(
            "Loaded {} script(s) in {:?} (generation {generation}, {} failed, {} skipped)",
            report.loaded.len(),
            started.elapsed(),
            report.failures.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Evaluate `files` in a throwaway generation that is never installed.
    ///
    /// The throwaway context gets its own bridge over a host that keeps
    /// nothing, so registrations made by the files never reach the real
    /// host or its stubs.
    ///
    /// # Errors
    ///
    /// Same fatal conditions as [`reload`](Self::reload).
    pub fn check(&self, files: &[std::path::PathBuf]) -> Result<ReloadReport> {
        let inner = &self.inner;
        let _guard = inner.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.shut_down.load(Ordering::SeqCst) {
            bail!("script host is shut down");
        }

        let transpiler = config::snapshot(&inner.config)
            .enable_typescript
            .then(|| inner.locator.locate());
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let runtime = inner.engine.create_runtime(generation)?;
        let scope = Arc::new(BindScope::new(generation));
        let sdk = inner
            .resources
            .get(SDK_BOOTSTRAP)
            .ok_or_else(|| anyhow!("bundled SDK '{SDK_BOOTSTRAP}' is missing"))?;

        let marshal = Arc::new(Marshal::default());
        let bridge = Arc::new(CapabilityBridge::new(
            Arc::new(DetachedHost(Arc::clone(&inner.host))),
            Arc::new(Invoker::new(Arc::new(RuntimeCell::default()), Arc::clone(&marshal))),
            marshal,
            Arc::new(TimerQueue::default()),
            DeferredExecutor::new(None),
        ));
        bootstrap(&bridge, &runtime, &scope, sdk).map_err(|failure| anyhow!("SDK bootstrap failed: {failure}"))?;

        let mut report = ReloadReport::new(generation, ReloadTrigger::Manual, transpiler);
        for path in files {
            self.load_file(&runtime, &scope, path, &mut report);
        }
        runtime.close();
        Ok(report)
    }

    fn load_file(&self, runtime: &GuestRuntime, scope: &BindScope, path: &Path, report: &mut ReloadReport) {
        let name = script::display_name(path);
        let mut unit = match ScriptUnit::read(path) {
            Ok(unit) => unit,
            Err(e) => {
                let failure = LoadFailure::Read {
                    file: name,
                    message: format!("{e:#}"),
                };
                log::error!("{failure}");
                report.failures.push(failure);
                return;
            }
        };

        if unit.kind == ScriptKind::NeedsTranspile {
            match report.transpiler.as_ref().filter(|b| b.is_available()) {
                None => {
                    log::warn!("Skipping {name}: no TypeScript transpiler available");
                    report.skipped.push(name);
                    return;
                }
                Some(binding) => match binding.transpile(path) {
                    Ok(code) => unit.transpiled = Some(code),
                    Err(e) => {
                        log::error!("{e}");
                        report.failures.push(LoadFailure::Transpile(e));
                        return;
                    }
                },
            }
        }

        scope.set_origin(&name);
        let code = unit.code();
        let evaluated = runtime.with(|ctx| {
            CapabilityBridge::bind_console(&ctx, &name)
                .and_then(|()| ctx.eval::<(), _>(code))
                .map_err(|e| diagnostics::capture(&ctx, &e, Some(&name)))
        });
        match evaluated {
            Ok(()) => {
                log::debug!("Loaded script {name}");
                report.loaded.push(name);
            }
            Err(failure) => {
                log::error!("{failure}");
                report.failures.push(LoadFailure::Evaluate(failure));
            }
        }
    }

    /// Re-read `config.json` and apply it: the watcher follows the
    /// hot-reload flag; the TypeScript flag applies from the next reload.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn reload_config(&self) -> Result<ScriptingConfig> {
        let (config, _) = ScriptingConfig::load_or_create(&self.inner.paths.config_file())?;
        *self.inner.config.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        self.restart_watcher();
        log::info!("Configuration reloaded");
        Ok(config)
    }

    /// Stop the watcher, close the runtime and detach every registration.
    /// Terminal: later reloads fail.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_watcher();
        let _guard = self.inner.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(generation) = self.inner.cell.close_current() {
            log::debug!("Closed guest generation {generation}");
        }
        self.inner.bridge.shutdown();
        log::info!("Script host shut down");
    }

    // ── Watcher ──────────────────────────────────────────────────────

    fn restart_watcher(&self) {
        self.stop_watcher();
        if config::snapshot(&self.inner.config).is_hot_reload_enabled && !self.inner.shut_down.load(Ordering::SeqCst) {
            if let Err(e) = self.start_watcher() {
                log::warn!("Hot reload unavailable: {e:#}");
            }
        }
    }

    /// Start watching the script directory, replacing any running watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watch or the watcher thread cannot be created.
    pub fn start_watcher(&self) -> Result<()> {
        self.stop_watcher();
        let weak = self.downgrade();
        let watcher = ScriptWatcher::start(&self.inner.paths.scripts_dir(), Arc::clone(&self.inner.config), move |stop| {
            let Some(host) = weak.upgrade() else {
                return;
            };
            let Some(_guard) = lock_unless_stopped(&host.inner.reload_lock, stop) else {
                return;
            };
            log::info!("Script change detected, reloading");
            if let Err(e) = host.reload_locked(ReloadTrigger::Watcher) {
                log::error!("Hot reload failed: {e:#}");
            }
        })?;
        *self.inner.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }

    /// Stop the watcher and release its OS handle.
    pub fn stop_watcher(&self) {
        let watcher = self.inner.watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(watcher) = watcher {
            watcher.stop();
            log::debug!("Stopped script watcher");
        }
    }

    /// Whether a watcher thread is running with its OS watch open.
    pub fn is_watching(&self) -> bool {
        self.inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|watcher| watcher.is_running() && watcher.is_watching())
    }

    // ── Per-tick and events ──────────────────────────────────────────

    /// Fire due guest timers and drain pending promise jobs. Call once per
    /// host tick, outside any guest call.
    pub fn pump(&self) -> PumpStats {
        let timers = self.inner.timers.fire_due(&self.inner.invoker, Instant::now());
        let jobs = self.inner.engine.run_pending_jobs();
        PumpStats { timers, jobs }
    }

    /// `server.callSync(name, payload)`; returns the payload as the guest
    /// left it, or `None` without a runtime or when a listener threw.
    pub fn dispatch(&self, name: &str, payload: HostValue) -> Option<HostValue> {
        self.inner
            .invoker
            .call_global("server", "callSync", &[HostValue::from(name), payload])
            .value()
    }

    /// Copy-out/copy-in dispatch of a cancelable event.
    ///
    /// Listeners see `fields` plus `isCancelled: false` as a live object
    /// and may set `isCancelled`. Returns the flag as the listeners left
    /// it, even when a later listener threw; no runtime means "not
    /// cancelled".
    pub fn dispatch_cancelable(&self, name: &str, fields: BTreeMap<String, HostValue>) -> bool {
        let record = Arc::new(FieldRecord::new(fields));
        record.set(CANCELLED_FIELD, HostValue::Bool(false));
        self.inner
            .invoker
            .call_global("server", "callSync", &[HostValue::from(name), HostValue::Record(Arc::clone(&record))]);
        record.get(CANCELLED_FIELD).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Deliver a host lifecycle event; returns whether a cancelable event
    /// was cancelled.
    pub fn fire(&self, event: LifecycleEvent) -> bool {
        let (name, fields, cancelable) = event.into_parts();
        if cancelable {
            self.dispatch_cancelable(name, fields)
        } else {
            self.dispatch(name, HostValue::Map(fields));
            false
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// Current generation, `None` before the first reload or after shutdown.
    pub fn generation(&self) -> Option<u64> {
        self.inner.cell.generation()
    }

    /// Shared configuration.
    pub fn config(&self) -> SharedConfig {
        Arc::clone(&self.inner.config)
    }

    /// Data directory layout.
    pub fn paths(&self) -> &ScriptPaths {
        &self.inner.paths
    }

    /// Transpiler of the latest reload.
    pub fn transpiler(&self) -> TranspilerBinding {
        self.inner.transpiler.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Native surface and stub registry.
    pub fn bridge(&self) -> &CapabilityBridge {
        &self.inner.bridge
    }

    /// Guest invoker bound to this host's runtime cell.
    pub fn invoker(&self) -> &Invoker {
        &self.inner.invoker
    }
}

/// Bind `bridge` and the console into a fresh context, then evaluate the SDK.
fn bootstrap(bridge: &Arc<CapabilityBridge>, runtime: &GuestRuntime, scope: &Arc<BindScope>, sdk: &str) -> Result<(), GuestFailure> {
    runtime.with(|ctx| {
        let bound = scope
            .install(&ctx)
            .and_then(|()| bridge.bind(&ctx, scope))
            .and_then(|()| CapabilityBridge::bind_console(&ctx, SDK_ORIGIN))
            .and_then(|()| ctx.eval::<(), _>(sdk));
        bound.map_err(|e| diagnostics::capture(&ctx, &e, Some(SDK_ORIGIN)))
    })
}

/// Host seen by [`ScriptHost::check`]: lookups and globals come from the
/// real host, registrations are dropped.
struct DetachedHost(Arc<dyn ExtensionHost>);

impl ExtensionHost for DetachedHost {
    fn register_command(&self, _: Arc<dyn HostCommand>) {}

    fn register_system(&self, _: SystemRegistration) {}

    fn register_packet_filter(&self, _: Arc<PacketFilter>) {}

    fn deregister_packet_filter(&self, _: &Arc<PacketFilter>) {}

    fn register_component(&self, _: Arc<CustomComponentType>) -> HostValue {
        HostValue::Null
    }

    fn players(&self) -> Option<&dyn PlayerDirectory> {
        self.0.players()
    }

    fn globals(&self) -> Vec<(String, HostValue)> {
        self.0.globals()
    }
}

/// Retry interval while the watcher thread waits for the reload lock.
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Reload lock for the watcher thread. Gives up once `stop` is set, so a
/// caller holding the lock can stop and join the watcher.
fn lock_unless_stopped<'a>(lock: &'a Mutex<()>, stop: &AtomicBool) -> Option<MutexGuard<'a, ()>> {
    loop {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        match lock.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => thread::sleep(LOCK_RETRY),
        }
    }
}

fn seed(resources: &ResourceBundle, paths: &ScriptPaths) -> Result<usize> {
    let mut copied = 0;
    for (prefix, target) in [("declare", paths.sdk_dir()), ("scripts", paths.scripts_dir())] {
        for (relative, content) in resources.under(prefix) {
            let dest = target.join(relative);
            if dest.exists() {
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(&dest, content).with_context(|| format!("Failed to seed {}", dest.display()))?;
            copied += 1;
        }
    }
    log::info!("Seeded {copied} file(s) into {}", paths.root.display());
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::RecordingHost;
    use tempfile::TempDir;

    fn quiet_config() -> ScriptingConfig {
        ScriptingConfig {
            is_hot_reload_enabled: false,
            enable_typescript: false,
            ..ScriptingConfig::default()
        }
    }

    #[test]
    fn test_seed_only_on_first_run() {
        let dir = TempDir::new().unwrap();
        let paths = ScriptPaths::new(dir.path());
        let host = ScriptHost::builder(paths.clone(), Arc::new(RecordingHost::default()))
            .config(quiet_config())
            .build()
            .unwrap();
        host.setup().unwrap();
        assert!(paths.sdk_dir().join("hyscript.d.ts").exists());
        assert!(paths.scripts_dir().join("hello.js").exists());

        fs::remove_file(paths.scripts_dir().join("hello.js")).unwrap();
        host.setup().unwrap();
        assert!(!paths.scripts_dir().join("hello.js").exists(), "second setup must not re-seed");
    }

    #[test]
    fn test_missing_sdk_is_fatal() {
        static NO_SDK: &[(&str, &str)] = &[("scripts/a.js", "1;")];
        let dir = TempDir::new().unwrap();
        let host = ScriptHost::builder(ScriptPaths::new(dir.path()), Arc::new(RecordingHost::default()))
            .config(quiet_config())
            .resources(ResourceBundle::from_static(NO_SDK))
            .admin_command(false)
            .build()
            .unwrap();

        assert!(host.setup().is_err());
        assert_eq!(host.generation(), None);
    }

    #[test]
    fn test_report_messages_summarize() {
        let mut report = ReloadReport::new(3, ReloadTrigger::Command, Some(TranspilerBinding::None));
        report.loaded.push("a.js".to_string());
        report.skipped.push("b.ts".to_string());
        let lines = report.messages();
        assert_eq!(lines.first().map(|l| l.0), Some(log::Level::Warn));
        assert!(lines.last().unwrap().1.contains("generation 3"));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let dir = TempDir::new().unwrap();
        let host = ScriptHost::builder(ScriptPaths::new(dir.path()), Arc::new(RecordingHost::default()))
            .config(quiet_config())
            .build()
            .unwrap();
        host.setup().unwrap();
        assert!(host.generation().is_some());

        host.shutdown();
        assert_eq!(host.generation(), None);
        assert!(host.reload().is_err());
    }
}

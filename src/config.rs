//! Configuration loading and persistence.
//!
//! The scripting host keeps a small `config.json` next to its script
//! directory. A missing file is created with defaults, and its absence is
//! reported so the caller can treat the run as a first run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Priority the host uses when it registers its own lifecycle listeners
/// (connect, chat, ...) that forward into the guest.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerPriority {
    /// Runs before every other listener.
    First,
    /// Runs early.
    Early,
    /// Default slot.
    Normal,
    /// Runs after most listeners, so guest code sees their changes.
    #[default]
    Late,
    /// Runs last.
    Last,
}

/// Scripting host configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptingConfig {
    /// Run the script directory watcher and reload on change.
    pub is_hot_reload_enabled: bool,
    /// Transpile `.ts` files through an external tool.
    pub enable_typescript: bool,
    /// Listener priority for host lifecycle events.
    pub event_priority: ListenerPriority,
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            is_hot_reload_enabled: true,
            enable_typescript: true,
            event_priority: ListenerPriority::Late,
        }
    }
}

/// Configuration shared between the lifecycle manager, the watcher thread
/// and the admin command.
pub type SharedConfig = Arc<RwLock<ScriptingConfig>>;

impl ScriptingConfig {
    /// Load `path`, or write the defaults there when it does not exist.
    ///
    /// Returns the config and whether the file was newly created.
    pub fn load_or_create(path: &Path) -> Result<(Self, bool)> {
        if path.exists() {
            let mut config = Self::load_from_file(path)?;
            config.apply_env_overrides();
            return Ok((config, false));
        }

        let config = Self::default();
        config.save(path)?;
        let mut effective = config;
        effective.apply_env_overrides();
        Ok((effective, true))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("HYSCRIPT_HOT_RELOAD") {
            self.is_hot_reload_enabled = enabled;
        }
        if let Some(enabled) = env_flag("HYSCRIPT_TYPESCRIPT") {
            self.enable_typescript = enabled;
        }
    }

    /// Persist this configuration, pretty-printed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Wrap into the shared handle.
    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

/// Read a snapshot of the shared config.
pub fn snapshot(config: &SharedConfig) -> ScriptingConfig {
    config.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("Ignoring {name}={other}: expected true/false");
            None
        }
    }
}

/// Filesystem layout of a scripting host's data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptPaths {
    /// Data root.
    pub root: PathBuf,
}

impl ScriptPaths {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the default data root.
    ///
    /// Priority: `HYSCRIPT_DATA_DIR`, then `<data dir>/hyscript`, then
    /// `./hyscript`.
    pub fn resolve() -> Self {
        if let Ok(dir) = std::env::var("HYSCRIPT_DATA_DIR") {
            return Self::new(dir);
        }
        let root = dirs::data_dir()
            .map(|d| d.join("hyscript"))
            .unwrap_or_else(|| PathBuf::from("hyscript"));
        Self::new(root)
    }

    /// Directory scanned for guest scripts.
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    /// Directory receiving the bundled declaration files.
    pub fn sdk_dir(&self) -> PathBuf {
        self.root.join("sdk")
    }

    /// Location of `config.json`.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }
}

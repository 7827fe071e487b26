//! Shared fixture for integration tests.
#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use hyscript::{Feedback, HostValue, RecordingHost, ScriptHost, ScriptPaths, ScriptingConfig, TranspilerBinding};
use tempfile::TempDir;

/// Loaded first; exposes `globalThis.state` through the `snapshot` event.
pub const STATE_HOOK: &str = r"
globalThis.state = {};
server.on('snapshot', (e) => { e.state = globalThis.state; });
";

/// A script host over a temporary data directory.
pub struct Fixture {
    pub dir: TempDir,
    pub recorder: Arc<RecordingHost>,
    pub host: ScriptHost,
}

impl Fixture {
    pub fn new(scripts: &[(&str, &str)]) -> Self {
        Self::with(RecordingHost::default(), false, scripts)
    }

    /// Build (without running setup) over `recorder`.
    pub fn with(recorder: RecordingHost, hot_reload: bool, scripts: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = ScriptPaths::new(dir.path());
        // An existing SDK directory marks the data dir as already seeded.
        fs::create_dir_all(paths.sdk_dir()).unwrap();
        fs::create_dir_all(paths.scripts_dir()).unwrap();

        let recorder = Arc::new(recorder);
        let config = ScriptingConfig {
            is_hot_reload_enabled: hot_reload,
            enable_typescript: true,
            ..ScriptingConfig::default()
        };
        let host = ScriptHost::builder(paths, Arc::clone(&recorder) as Arc<dyn hyscript::ExtensionHost>)
            .config(config)
            .transpiler(TranspilerBinding::None)
            .build()
            .unwrap();

        let fixture = Self { dir, recorder, host };
        fixture.write("000_state.js", STATE_HOOK);
        for (name, code) in scripts {
            fixture.write(name, code);
        }
        fixture
    }

    pub fn script_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("scripts").join(name)
    }

    pub fn write(&self, name: &str, code: &str) {
        fs::write(self.script_path(name), code).unwrap();
    }

    pub fn remove(&self, name: &str) {
        fs::remove_file(self.script_path(name)).unwrap();
    }

    /// Snapshot of the guest's `globalThis.state`.
    pub fn state(&self) -> BTreeMap<String, HostValue> {
        self.host
            .dispatch("snapshot", HostValue::map::<&str>([]))
            .and_then(|payload| payload.get("state").cloned())
            .map(HostValue::into_map)
            .unwrap_or_default()
    }

    /// Integer field of `globalThis.state`, 0 when absent.
    pub fn counter(&self, key: &str) -> i64 {
        self.state().get(key).and_then(HostValue::as_i64).unwrap_or(0)
    }
}

/// Feedback sink that keeps every line.
#[derive(Default)]
pub struct Lines(pub Mutex<Vec<(log::Level, String)>>);

impl Feedback for Lines {
    fn send(&self, level: log::Level, message: &str) {
        self.0.lock().unwrap().push((level, message.to_string()));
    }
}

impl Lines {
    pub fn take(&self) -> Vec<(log::Level, String)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

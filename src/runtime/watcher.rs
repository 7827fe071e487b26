//! Script directory watcher with trailing-edge debounce.
//!
//! A [`ScriptWatcher`] owns the OS watch handle (`notify`) on the script
//! directory plus a background thread. Bursts of qualifying events are
//! coalesced: each event pushes the deadline out to [`DEBOUNCE`] after it,
//! and once the directory has been quiet that long the reload callback
//! fires exactly once.
//!
//! The thread exits when the watcher is stopped or when hot-reload is
//! switched off in the shared configuration. Either way the notify handle
//! is dropped with it, releasing the OS watch.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::{self, SharedConfig};
use crate::script;

/// Quiet period after the last qualifying event before a reload fires.
pub const DEBOUNCE: Duration = Duration::from_millis(150);

/// Upper bound on how long the loop waits before re-checking its stop
/// conditions.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

type EventRx = Receiver<notify::Result<Event>>;

/// Whether a raw notify event should trigger a reload.
///
/// Creations and content/name changes of recognized script files qualify;
/// metadata-only changes, removals and access events do not.
pub fn is_trigger(event: &Event) -> bool {
    let kind_matches = match event.kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    };
    kind_matches && event.paths.iter().any(|p| script::is_recognized(p))
}

/// Coalesce qualifying events from `rx` and call `on_trigger` once per burst.
///
/// Returns when `rx` disconnects or `keep_running` turns false. A burst
/// still pending at that point is dropped.
pub fn debounce_loop(
    rx: &EventRx,
    debounce: Duration,
    keep_running: impl Fn() -> bool,
    mut on_trigger: impl FnMut(),
) {
    let mut deadline: Option<Instant> = None;

    loop {
        if !keep_running() {
            return;
        }

        let wait = deadline.map_or(POLL_INTERVAL, |d| {
            d.saturating_duration_since(Instant::now()).min(POLL_INTERVAL)
        });

        match rx.recv_timeout(wait) {
            Ok(Ok(event)) => {
                if is_trigger(&event) {
                    log::debug!("Script change: {:?}", event.paths);
                    deadline = Some(Instant::now() + debounce);
                }
            }
            Ok(Err(e)) => log::warn!("Script watcher error: {e}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            deadline = None;
            if keep_running() {
                on_trigger();
            }
        }
    }
}

type WatchHandle = Arc<Mutex<Option<RecommendedWatcher>>>;

/// Running watcher: OS handle plus the debounce thread.
pub(crate) struct ScriptWatcher {
    handle: WatchHandle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ScriptWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptWatcher")
            .field("stopped", &self.stop.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ScriptWatcher {
    /// Watch `dir` (non-recursively) and call `on_change` after each
    /// debounced burst while hot-reload stays enabled.
    ///
    /// `on_change` receives the watcher's stop flag. It must give up
    /// waiting on any lock once the flag is set, since [`stop`](Self::stop)
    /// joins the thread.
    pub(crate) fn start(
        dir: &Path,
        config: SharedConfig,
        mut on_change: impl FnMut(&AtomicBool) + Send + 'static,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch: {}", dir.display()))?;
        let handle: WatchHandle = Arc::new(Mutex::new(Some(watcher)));

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_handle = Arc::clone(&handle);
        let thread = thread::Builder::new()
            .name("hyscript-watcher".to_string())
            .spawn(move || {
                let keep_running = || {
                    !thread_stop.load(Ordering::SeqCst)
                        && config::snapshot(&config).is_hot_reload_enabled
                };
                debounce_loop(&rx, DEBOUNCE, keep_running, || on_change(&thread_stop));
                release(&thread_handle);
                log::debug!("Script watcher thread exited");
            })
            .context("Failed to spawn watcher thread")?;

        log::info!("Watching for script changes: {}", dir.display());
        Ok(Self {
            handle,
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the loop, release the OS watch handle and join the thread.
    ///
    /// Called from the watcher thread itself, the join is skipped; the
    /// thread exits once the current callback returns.
    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        release(&self.handle);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                log::warn!("Script watcher thread panicked");
            }
        }
    }

    /// Whether the background thread is still running.
    pub(crate) fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Whether the OS watch is still open.
    pub(crate) fn is_watching(&self) -> bool {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

fn release(handle: &WatchHandle) {
    drop(handle.lock().unwrap_or_else(PoisonError::into_inner).take());
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn modify(path: &str) -> notify::Result<Event> {
        Ok(Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(PathBuf::from(path)))
    }

    #[test]
    fn test_trigger_filter() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/s/a.ts"));
        assert!(is_trigger(&create));
        assert!(is_trigger(&modify("/s/a.js").unwrap()));

        let backup = modify("/s/~a.js").unwrap();
        assert!(!is_trigger(&backup));
        let other_ext = modify("/s/a.json").unwrap();
        assert!(!is_trigger(&other_ext));
        let metadata = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
            .add_path(PathBuf::from("/s/a.js"));
        assert!(!is_trigger(&metadata));
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from("/s/a.js"));
        assert!(!is_trigger(&removed));
    }

    #[test]
    fn test_burst_coalesces_into_one_trigger_after_quiet_period() {
        let (tx, rx) = mpsc::channel();
        let fired: Arc<Mutex<Vec<Instant>>> = Arc::default();
        let sink = Arc::clone(&fired);

        let worker = thread::spawn(move || {
            debounce_loop(&rx, DEBOUNCE, || true, || sink.lock().unwrap().push(Instant::now()));
        });

        let mut last_sent = Instant::now();
        for _ in 0..3 {
            tx.send(modify("/scripts/main.js")).unwrap();
            last_sent = Instant::now();
            thread::sleep(Duration::from_millis(30));
        }

        thread::sleep(Duration::from_millis(500));
        drop(tx);
        worker.join().unwrap();

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1, "burst must produce exactly one reload");
        assert!(fired[0].duration_since(last_sent) >= DEBOUNCE);
    }

    #[test]
    fn test_ignored_events_never_trigger() {
        let (tx, rx) = mpsc::channel();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);

        let worker = thread::spawn(move || {
            debounce_loop(&rx, DEBOUNCE, || true, || *sink.lock().unwrap() += 1);
        });
        tx.send(modify("/scripts/~backup.js")).unwrap();
        tx.send(modify("/scripts/readme.md")).unwrap();
        thread::sleep(Duration::from_millis(300));
        drop(tx);
        worker.join().unwrap();

        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn test_pending_burst_dropped_when_stopped() {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);

        let worker = thread::spawn(move || {
            debounce_loop(&rx, DEBOUNCE, || flag.load(Ordering::SeqCst), || *sink.lock().unwrap() += 1);
        });
        tx.send(modify("/scripts/main.js")).unwrap();
        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::SeqCst);
        worker.join().unwrap();

        assert_eq!(*count.lock().unwrap(), 0);
        drop(tx);
    }

    #[test]
    fn test_watch_nonexistent_directory_fails() {
        let config = crate::config::ScriptingConfig::default().shared();
        let result = ScriptWatcher::start(Path::new("/nonexistent/hyscript/scripts"), config, |_| {});
        assert!(result.is_err());
    }

    #[test]
    fn test_disabling_hot_reload_ends_thread() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::ScriptingConfig::default().shared();
        let watcher = ScriptWatcher::start(dir.path(), Arc::clone(&config), |_| {}).unwrap();
        assert!(watcher.is_running());

        assert!(watcher.is_watching());

        config.write().unwrap().is_hot_reload_enabled = false;
        thread::sleep(POLL_INTERVAL * 3);
        assert!(!watcher.is_running());
        assert!(!watcher.is_watching(), "OS watch must close with the thread");
        watcher.stop();
    }

    #[test]
    fn test_stop_joins_the_thread() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::ScriptingConfig::default().shared();
        let watcher = ScriptWatcher::start(dir.path(), Arc::clone(&config), |_| {}).unwrap();
        assert_eq!(Arc::strong_count(&config), 2);

        watcher.stop();
        assert_eq!(Arc::strong_count(&config), 1, "thread still holds the config after stop");
    }
}

//! Guest engine and per-reload execution contexts.
//!
//! One [`GuestEngine`] (a QuickJS runtime) lives for the whole process.
//! Each successful reload creates a fresh [`GuestRuntime`] on it, tagged
//! with a monotonically increasing generation. The [`RuntimeCell`] holds the
//! one current runtime; closing a runtime is permanent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context as _, Result};
use rquickjs::{Context, Ctx, Runtime};

use crate::diagnostics;

/// Process-wide guest engine.
pub struct GuestEngine {
    runtime: Runtime,
}

impl std::fmt::Debug for GuestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestEngine").finish_non_exhaustive()
    }
}

impl GuestEngine {
    /// Create the engine.
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("Failed to create guest engine")?;
        // Entries come from several host threads with unrelated stacks; the
        // engine's stack-depth check is calibrated to the creating thread.
        runtime.set_max_stack_size(0);
        Ok(Self { runtime })
    }

    /// Create a new execution context for `generation`.
    pub fn create_runtime(&self, generation: u64) -> Result<GuestRuntime> {
        let context = Context::full(&self.runtime)
            .with_context(|| format!("Failed to create guest context for generation {generation}"))?;
        Ok(GuestRuntime {
            generation,
            context,
            live: AtomicBool::new(true),
        })
    }

    /// Run queued promise jobs until none remain. Returns how many ran.
    pub fn run_pending_jobs(&self) -> usize {
        let mut ran = 0;
        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(exception) => {
                    ran += 1;
                    let failure = exception.0.with(|ctx| pending_failure(&ctx));
                    log::error!("Guest promise job threw: {failure}");
                }
            }
        }
        ran
    }

    /// Force a garbage collection pass.
    pub fn collect_garbage(&self) {
        self.runtime.run_gc();
    }
}

/// Describe the exception pending in `ctx`.
fn pending_failure(ctx: &Ctx<'_>) -> diagnostics::GuestFailure {
    diagnostics::from_thrown(&ctx.catch(), None)
}

/// One generation of guest execution state.
pub struct GuestRuntime {
    generation: u64,
    context: Context,
    live: AtomicBool,
}

impl std::fmt::Debug for GuestRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRuntime")
            .field("generation", &self.generation)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

impl GuestRuntime {
    /// Generation id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this runtime is still open.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Close permanently. Registrations of this generation become stale.
    pub fn close(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Enter the context.
    ///
    /// Entries are serialized by the engine lock. Must not be called from
    /// inside guest execution (a bridge function) or it deadlocks.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send,
        R: Send,
    {
        self.context.with(f)
    }
}

/// Holder of the current [`GuestRuntime`].
#[derive(Debug, Default)]
pub struct RuntimeCell {
    current: RwLock<Option<Arc<GuestRuntime>>>,
}

impl RuntimeCell {
    /// The current runtime, if one is installed.
    pub fn current(&self) -> Option<Arc<GuestRuntime>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Generation of the current runtime.
    pub fn generation(&self) -> Option<u64> {
        self.current().map(|r| r.generation())
    }

    /// Whether `generation` is the current, open generation.
    pub fn is_current(&self, generation: u64) -> bool {
        self.current()
            .is_some_and(|r| r.generation() == generation && r.is_live())
    }

    /// Install `runtime` as current.
    pub fn install(&self, runtime: Arc<GuestRuntime>) {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(runtime);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Close and remove the current runtime.
    pub fn close_current(&self) -> Option<u64> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        previous.map(|runtime| {
            runtime.close();
            runtime.generation()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_evaluates_in_its_own_context() {
        let engine = GuestEngine::new().unwrap();
        let a = engine.create_runtime(1).unwrap();
        let b = engine.create_runtime(2).unwrap();

        a.with(|ctx| ctx.eval::<(), _>("globalThis.marker = 41;").unwrap());
        let seen_in_a: i32 = a.with(|ctx| ctx.eval("marker + 1").unwrap());
        let seen_in_b: bool = b.with(|ctx| ctx.eval("typeof marker === 'undefined'").unwrap());

        assert_eq!(seen_in_a, 42);
        assert!(seen_in_b);
    }

    #[test]
    fn test_cell_generation_tracking() {
        let engine = GuestEngine::new().unwrap();
        let cell = RuntimeCell::default();
        assert_eq!(cell.generation(), None);

        let first = Arc::new(engine.create_runtime(1).unwrap());
        cell.install(Arc::clone(&first));
        assert!(cell.is_current(1));

        cell.install(Arc::new(engine.create_runtime(2).unwrap()));
        assert!(!first.is_live(), "replaced runtime must be closed");
        assert!(!cell.is_current(1));
        assert!(cell.is_current(2));

        assert_eq!(cell.close_current(), Some(2));
        assert!(!cell.is_current(2));
        assert_eq!(cell.close_current(), None);
    }

    #[test]
    fn test_pending_jobs_run() {
        let engine = GuestEngine::new().unwrap();
        let runtime = engine.create_runtime(1).unwrap();
        runtime.with(|ctx| {
            ctx.eval::<(), _>("globalThis.done = false; Promise.resolve().then(() => { done = true; });")
                .unwrap();
        });
        assert!(engine.run_pending_jobs() >= 1);
        let done: bool = runtime.with(|ctx| ctx.globals().get("done").unwrap());
        assert!(done);
    }

    #[test]
    fn test_pending_failure_describes_the_exception() {
        let engine = GuestEngine::new().unwrap();
        let runtime = engine.create_runtime(1).unwrap();
        let failure = runtime.with(|ctx| {
            assert!(ctx.eval::<(), _>("\nthrow new Error('job broke');").is_err());
            pending_failure(&ctx)
        });
        assert_eq!(failure.message, "job broke");
        assert_eq!(failure.position.map(|p| p.line), Some(2));
    }
}

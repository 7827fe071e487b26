//! Guest timers (`setTimeout` / `setInterval`).
//!
//! Timers are plain entries in a queue owned by the script host; nothing
//! runs on its own. The host's per-tick `pump()` fires whatever is due.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::runtime::invoke::{GuestRef, Invoker};

/// Longest delay a guest can ask for. Larger requests are clamped.
pub(crate) const MAX_GUEST_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Convert guest-supplied seconds into a `Duration`.
///
/// NaN, infinities and non-positive values map to zero; anything past
/// [`MAX_GUEST_DELAY`] is clamped to it.
pub(crate) fn guest_seconds(secs: f64) -> Duration {
    if !(secs.is_finite() && secs > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).map_or(MAX_GUEST_DELAY, |delay| delay.min(MAX_GUEST_DELAY))
}

#[derive(Debug, Clone)]
struct TimerEntry {
    id: u32,
    guest: GuestRef,
    /// `None` when the deadline is unrepresentable; such a timer never fires.
    due: Option<Instant>,
    period: Option<Duration>,
}

/// Pending guest timers of the current generation.
#[derive(Debug)]
pub struct TimerQueue {
    entries: Mutex<Vec<TimerEntry>>,
    next_id: AtomicU32,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }
}

impl TimerQueue {
    /// Queue `guest` to run after `delay`, and every `delay` after that when
    /// `repeat` is set. Returns the guest-visible timer id.
    pub(crate) fn schedule(&self, guest: GuestRef, delay: Duration, repeat: bool) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(TimerEntry {
            id,
            guest,
            due: Instant::now().checked_add(delay),
            period: repeat.then_some(delay),
        });
        id
    }

    /// Remove a timer; returns its callable so the caller can release it.
    pub(crate) fn cancel(&self, id: u32) -> Option<GuestRef> {
        let mut entries = self.lock();
        let pos = entries.iter().position(|e| e.id == id)?;
        Some(entries.remove(pos).guest)
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every timer.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Fire every timer due at `now`; returns how many ran.
    ///
    /// Each timer fires at most once per call. Timers of a closed
    /// generation are dropped without running.
    pub(crate) fn fire_due(&self, invoker: &Invoker, now: Instant) -> usize {
        let due: Vec<TimerEntry> = {
            let mut entries = self.lock();
            let mut due = Vec::new();
            entries.retain_mut(|entry| {
                if !invoker.is_live(&entry.guest) {
                    return false;
                }
                if entry.due.is_none_or(|due| due > now) {
                    return true;
                }
                due.push(entry.clone());
                match entry.period {
                    Some(period) => {
                        entry.due = now.checked_add(period.max(Duration::from_millis(1)));
                        true
                    }
                    None => false,
                }
            });
            due
        };

        let mut fired = 0;
        for entry in due {
            let outcome = if entry.period.is_some() {
                invoker.invoke(&entry.guest, None, &[])
            } else {
                invoker.invoke_once(&entry.guest, &[])
            };
            if outcome.is_stale() {
                self.cancel(entry.id);
            } else {
                fired += 1;
            }
        }
        fired
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TimerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::marshal::Marshal;
    use crate::runtime::engine::{GuestEngine, RuntimeCell};
    use crate::runtime::invoke::BindScope;
    use rquickjs::Value;
    use std::sync::Arc;

    struct Fixture {
        _engine: GuestEngine,
        cell: Arc<RuntimeCell>,
        invoker: Invoker,
        refs: Vec<GuestRef>,
    }

    fn fixture(sources: &[&str]) -> Fixture {
        let engine = GuestEngine::new().unwrap();
        let cell = Arc::new(RuntimeCell::default());
        let invoker = Invoker::new(Arc::clone(&cell), Arc::new(Marshal::default()));
        let runtime = Arc::new(engine.create_runtime(1).unwrap());
        cell.install(Arc::clone(&runtime));
        let scope = BindScope::new(1);
        let refs = runtime.with(|ctx| {
            scope.install(&ctx).unwrap();
            ctx.eval::<(), _>("globalThis.hits = 0;").unwrap();
            sources
                .iter()
                .map(|src| {
                    let f: Value = ctx.eval(*src).unwrap();
                    scope.park(&ctx, f).unwrap()
                })
                .collect()
        });
        Fixture {
            _engine: engine,
            cell,
            invoker,
            refs,
        }
    }

    #[test]
    fn test_timeout_fires_once_when_due() {
        let fx = fixture(&["() => { hits += 1; }"]);
        let queue = TimerQueue::default();
        queue.schedule(fx.refs[0].clone(), Duration::from_millis(50), false);

        let start = Instant::now();
        assert_eq!(queue.fire_due(&fx.invoker, start), 0);
        assert_eq!(queue.fire_due(&fx.invoker, start + Duration::from_millis(60)), 1);
        assert_eq!(queue.fire_due(&fx.invoker, start + Duration::from_millis(200)), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_interval_repeats_until_cancelled() {
        let fx = fixture(&["() => { hits += 1; }"]);
        let queue = TimerQueue::default();
        let id = queue.schedule(fx.refs[0].clone(), Duration::from_millis(10), true);

        let mut now = Instant::now();
        for _ in 0..3 {
            now += Duration::from_millis(20);
            assert_eq!(queue.fire_due(&fx.invoker, now), 1);
        }
        assert!(queue.cancel(id).is_some());
        assert_eq!(queue.fire_due(&fx.invoker, now + Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_closed_generation_is_dropped() {
        let fx = fixture(&["() => { hits += 1; }"]);
        let queue = TimerQueue::default();
        queue.schedule(fx.refs[0].clone(), Duration::ZERO, true);
        fx.cell.close_current();

        assert_eq!(queue.fire_due(&fx.invoker, Instant::now() + Duration::from_millis(5)), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_guest_seconds_clamps_out_of_range_input() {
        assert_eq!(guest_seconds(2.5), Duration::from_millis(2500));
        assert_eq!(guest_seconds(1e20), MAX_GUEST_DELAY);
        assert_eq!(guest_seconds(1e300), MAX_GUEST_DELAY);
        assert_eq!(guest_seconds(f64::NAN), Duration::ZERO);
        assert_eq!(guest_seconds(f64::INFINITY), Duration::ZERO);
        assert_eq!(guest_seconds(-3.0), Duration::ZERO);
    }

    #[test]
    fn test_unrepresentable_deadline_never_fires() {
        let fx = fixture(&["() => { hits += 1; }"]);
        let queue = TimerQueue::default();
        queue.schedule(fx.refs[0].clone(), Duration::MAX, false);

        assert_eq!(queue.fire_due(&fx.invoker, Instant::now() + Duration::from_secs(3600)), 0);
        assert_eq!(queue.len(), 1);
    }
}

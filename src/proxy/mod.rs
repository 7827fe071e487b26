//! Reload-safe registration proxies.
//!
//! One proxy per extension family. Each proxy keeps durable stubs (created
//! once per key and registered with the host once) and, per stub, an
//! ordered list of the guest registrations currently attached to it.
//!
//! Dispatch always follows the same protocol: snapshot the list, skip and
//! prune registrations whose generation is no longer current, and invoke
//! the rest through the [`Invoker`] so guest failures end at the log.

pub mod command;
pub mod component;
pub mod event;
pub mod packet;
pub mod system;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use rquickjs::{Ctx, Object, Value};

use crate::host::EntityQuery;
use crate::runtime::invoke::{resolve_field, GuestRef, Invocation, Invoker};
use crate::value::HostValue;

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// One guest descriptor attached to a stub.
#[derive(Debug, Clone)]
pub(crate) struct Registration<T> {
    pub(crate) id: u64,
    pub(crate) guest: GuestRef,
    pub(crate) payload: T,
}

/// Ordered registrations of one stub.
#[derive(Debug)]
pub(crate) struct ActiveRegistrations<T> {
    entries: Mutex<Vec<Registration<T>>>,
}

impl<T> Default for ActiveRegistrations<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> ActiveRegistrations<T> {
    /// Append a registration.
    pub(crate) fn push(&self, guest: GuestRef, payload: T) {
        let id = NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Registration { id, guest, payload });
    }

    /// Drop every registration.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Number of attached registrations, stale ones included until pruned.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `call` for every live registration in order, pruning the stale.
    ///
    /// The list lock is not held while guest code runs, so callbacks may
    /// register further descriptors.
    pub(crate) fn for_each_live(&self, invoker: &Invoker, mut call: impl FnMut(&Registration<T>) -> Invocation) -> Vec<Invocation> {
        let snapshot: Vec<Registration<T>> = self.lock().clone();
        let mut stale = Vec::new();
        let mut results = Vec::with_capacity(snapshot.len());

        for registration in &snapshot {
            if !invoker.is_live(&registration.guest) {
                stale.push(registration.id);
                continue;
            }
            let outcome = call(registration);
            if outcome.is_stale() {
                stale.push(registration.id);
            } else {
                results.push(outcome);
            }
        }

        if !stale.is_empty() {
            log::debug!("Pruning {} stale registration(s)", stale.len());
            self.lock().retain(|r| !stale.contains(&r.id));
        }
        results
    }
}

/// Stub key of an event or component class.
///
/// Classes arrive either as host handles bound through
/// [`ExtensionHost::globals`](crate::host::ExtensionHost::globals) or as
/// plain names.
pub(crate) fn class_key(class: &HostValue) -> Option<String> {
    match class {
        HostValue::Handle(h) => Some(format!("{}#{}", h.kind, h.id)),
        HostValue::String(name) if !name.is_empty() => Some(name.clone()),
        _ => None,
    }
}

/// Resolve a descriptor's `query` field.
///
/// Absent or `null` means match-all; a function is called with the
/// descriptor as `this`; a throw also falls back to match-all.
pub(crate) fn resolve_query<'js>(ctx: &Ctx<'js>, marshal: &crate::bridge::marshal::Marshal, descriptor: &Object<'js>, origin: &str) -> EntityQuery {
    let value: Value = descriptor.clone().into_value();
    match resolve_field(ctx, &value, "query") {
        Ok(resolved) => EntityQuery::from_value(marshal.from_js(ctx, &resolved)),
        Err(e) => {
            let failure = crate::diagnostics::capture(ctx, &e, Some(origin));
            log::error!("query evaluation failed, matching every entity: {failure}");
            EntityQuery::Any
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::marshal::Marshal;
    use crate::runtime::engine::{GuestEngine, RuntimeCell};
    use crate::runtime::invoke::BindScope;
    use std::sync::Arc;

    #[test]
    fn test_for_each_live_prunes_previous_generation() {
        let engine = GuestEngine::new().unwrap();
        let cell = Arc::new(RuntimeCell::default());
        let invoker = Invoker::new(Arc::clone(&cell), Arc::new(Marshal::default()));
        let list: ActiveRegistrations<()> = ActiveRegistrations::default();

        let old = Arc::new(engine.create_runtime(1).unwrap());
        cell.install(Arc::clone(&old));
        let old_scope = BindScope::new(1);
        let old_ref = old.with(|ctx| {
            old_scope.install(&ctx).unwrap();
            let f: Value = ctx.eval("() => 'old'").unwrap();
            old_scope.park(&ctx, f).unwrap()
        });
        list.push(old_ref, ());

        let new = Arc::new(engine.create_runtime(2).unwrap());
        cell.install(Arc::clone(&new));
        let new_scope = BindScope::new(2);
        let new_ref = new.with(|ctx| {
            new_scope.install(&ctx).unwrap();
            let f: Value = ctx.eval("() => 'new'").unwrap();
            new_scope.park(&ctx, f).unwrap()
        });
        list.push(new_ref, ());

        let results = list.for_each_live(&invoker, |r| invoker.invoke(&r.guest, None, &[]));
        assert_eq!(results, vec![Invocation::Returned(HostValue::from("new"))]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_class_key() {
        assert_eq!(class_key(&HostValue::handle("eventClass", 7)).as_deref(), Some("eventClass#7"));
        assert_eq!(class_key(&HostValue::from("PlayerDeath")).as_deref(), Some("PlayerDeath"));
        assert_eq!(class_key(&HostValue::from("")), None);
        assert_eq!(class_key(&HostValue::Null), None);
    }

    #[test]
    fn test_resolve_query_rules() {
        let engine = GuestEngine::new().unwrap();
        let runtime = engine.create_runtime(1).unwrap();
        let marshal = Marshal::default();

        let queries: Vec<EntityQuery> = runtime.with(|ctx| {
            ["({})", "({ query: null })", "({ query: 'mobs' })", "({ query() { return 'npcs'; } })", "({ query() { throw new Error('nope'); } })"]
                .iter()
                .map(|src| {
                    let descriptor: Object = ctx.eval(*src).unwrap();
                    resolve_query(&ctx, &marshal, &descriptor, "q.js")
                })
                .collect()
        });

        assert_eq!(
            queries,
            vec![
                EntityQuery::Any,
                EntityQuery::Any,
                EntityQuery::Filter(HostValue::from("mobs")),
                EntityQuery::Filter(HostValue::from("npcs")),
                EntityQuery::Any,
            ]
        );
    }
}

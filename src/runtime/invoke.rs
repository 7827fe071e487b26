//! Guest callables and safe invocation.
//!
//! Guest functions and descriptor objects never leave their context.
//! Bridge code parks them in a hidden per-context slot table and keeps only
//! a [`GuestRef`] (generation + slot + origin file) on the Rust side. The
//! [`Invoker`] is the one way host code calls back into the guest: it checks
//! liveness first, converts arguments, and turns any throw into a logged
//! [`GuestFailure`] instead of an error in host control flow.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rquickjs::function::{Rest, This};
use rquickjs::{Ctx, Function, Object, Value};

use crate::bridge::marshal::Marshal;
use crate::diagnostics::{self, GuestFailure};
use crate::runtime::engine::{GuestRuntime, RuntimeCell};
use crate::value::HostValue;

/// Hidden global holding parked guest values.
const SLOT_TABLE: &str = "__hsSlots";

/// Reference to a guest value parked in a context's slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRef {
    generation: u64,
    slot: u32,
    origin: Arc<str>,
}

impl GuestRef {
    /// Generation that owns the value.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Script file that created the value.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Per-context binding state shared by every bridge function bound into
/// that context.
#[derive(Debug)]
pub struct BindScope {
    generation: u64,
    next_slot: AtomicU32,
    origin: RwLock<Arc<str>>,
}

impl BindScope {
    /// Scope for a freshly created context.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            next_slot: AtomicU32::new(0),
            origin: RwLock::new(Arc::from("<sdk>")),
        }
    }

    /// Generation of the context.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Attribute subsequently parked values to `origin`.
    pub fn set_origin(&self, origin: &str) {
        *self.origin.write().unwrap_or_else(PoisonError::into_inner) = Arc::from(origin);
    }

    /// Current origin label.
    pub fn origin(&self) -> Arc<str> {
        Arc::clone(&self.origin.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Create the slot table. Called once per context before anything is parked.
    pub(crate) fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        ctx.eval::<(), _>(format!(
            "Object.defineProperty(globalThis, '{SLOT_TABLE}', {{ value: Object.create(null) }});"
        ))
    }

    /// Park `value` and return a reference to it.
    pub(crate) fn park<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<GuestRef> {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        slot_table(ctx)?.set(slot, value)?;
        Ok(GuestRef {
            generation: self.generation,
            slot,
            origin: self.origin(),
        })
    }
}

fn slot_table<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    ctx.globals().get(SLOT_TABLE)
}

/// Fetch a parked value.
pub(crate) fn load<'js>(ctx: &Ctx<'js>, guest: &GuestRef) -> rquickjs::Result<Value<'js>> {
    slot_table(ctx)?.get(guest.slot)
}

/// Drop a parked value so the guest can collect it.
pub(crate) fn release<'js>(ctx: &Ctx<'js>, guest: &GuestRef) -> rquickjs::Result<()> {
    slot_table(ctx)?.remove(guest.slot)
}

/// Outcome of a guarded guest call.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// The call completed; its result converted to a host value.
    Returned(HostValue),
    /// The guest threw. Already logged.
    Failed(GuestFailure),
    /// The owning generation is closed; the caller should prune.
    Stale,
}

impl Invocation {
    /// Result value, or `None` for failures and stale calls.
    pub fn value(self) -> Option<HostValue> {
        match self {
            Self::Returned(v) => Some(v),
            _ => None,
        }
    }

    /// Whether the registration should be pruned.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }
}

/// Calls into the current guest runtime on behalf of host code.
#[derive(Debug)]
pub struct Invoker {
    cell: Arc<RuntimeCell>,
    marshal: Arc<Marshal>,
}

impl Invoker {
    /// Invoker over `cell`.
    pub fn new(cell: Arc<RuntimeCell>, marshal: Arc<Marshal>) -> Self {
        Self { cell, marshal }
    }

    /// Whether `guest` belongs to the current, open generation.
    pub fn is_live(&self, guest: &GuestRef) -> bool {
        self.cell.is_current(guest.generation)
    }

    fn runtime_for(&self, guest: &GuestRef) -> Option<Arc<GuestRuntime>> {
        self.cell
            .current()
            .filter(|r| r.generation() == guest.generation && r.is_live())
    }

    /// Call `guest` (a function) or its `member` method (a descriptor).
    ///
    /// A missing member is not an error: descriptors may leave optional
    /// callbacks out, and the call returns `Null`.
    pub fn invoke(&self, guest: &GuestRef, member: Option<&str>, args: &[HostValue]) -> Invocation {
        self.invoke_inner(guest, member, args, false)
    }

    /// Like [`invoke`](Self::invoke), then release the parked value.
    pub fn invoke_once(&self, guest: &GuestRef, args: &[HostValue]) -> Invocation {
        self.invoke_inner(guest, None, args, true)
    }

    fn invoke_inner(&self, guest: &GuestRef, member: Option<&str>, args: &[HostValue], release_after: bool) -> Invocation {
        let Some(runtime) = self.runtime_for(guest) else {
            return Invocation::Stale;
        };
        let marshal = &self.marshal;
        let _lease = marshal.lease(args);

        let outcome = runtime.with(|ctx| {
            let result = call_parked(&ctx, marshal, guest, member, args);
            if release_after {
                if let Err(e) = release(&ctx, guest) {
                    log::debug!("Failed to release guest slot: {e}");
                }
            }
            match result {
                Ok(value) => Invocation::Returned(marshal.from_js(&ctx, &value)),
                Err(e) => Invocation::Failed(diagnostics::capture(&ctx, &e, Some(guest.origin()))),
            }
        });

        if let Invocation::Failed(failure) = &outcome {
            log::error!("{failure}");
        }
        outcome
    }

    /// Read `member` from a parked descriptor, calling it when it is a
    /// function. Used for `query`-style fields that may be a value or a
    /// producer.
    pub fn resolve_member(&self, guest: &GuestRef, member: &str) -> Invocation {
        let Some(runtime) = self.runtime_for(guest) else {
            return Invocation::Stale;
        };
        let marshal = &self.marshal;
        let outcome = runtime.with(|ctx| {
            let result = load(&ctx, guest).and_then(|target| resolve_field(&ctx, &target, member));
            match result {
                Ok(value) => Invocation::Returned(marshal.from_js(&ctx, &value)),
                Err(e) => Invocation::Failed(diagnostics::capture(&ctx, &e, Some(guest.origin()))),
            }
        });
        if let Invocation::Failed(failure) = &outcome {
            log::error!("{failure}");
        }
        outcome
    }

    /// Call `globalThis[object][method](...args)` in the current runtime.
    ///
    /// `Stale` when no runtime is installed.
    pub fn call_global(&self, object: &str, method: &str, args: &[HostValue]) -> Invocation {
        let Some(runtime) = self.cell.current().filter(|r| r.is_live()) else {
            return Invocation::Stale;
        };
        let marshal = &self.marshal;
        let _lease = marshal.lease(args);
        let outcome = runtime.with(|ctx| {
            let result = (|| {
                let target: Object = ctx.globals().get(object)?;
                let func: Function = target.get(method)?;
                let args = to_js_args(&ctx, marshal, args)?;
                func.call::<_, Value>((This(target), Rest(args)))
            })();
            match result {
                Ok(value) => Invocation::Returned(marshal.from_js(&ctx, &value)),
                Err(e) => Invocation::Failed(diagnostics::capture(&ctx, &e, Some(object))),
            }
        });
        if let Invocation::Failed(failure) = &outcome {
            log::error!("{failure}");
        }
        outcome
    }
}

fn to_js_args<'js>(ctx: &Ctx<'js>, marshal: &Marshal, args: &[HostValue]) -> rquickjs::Result<Vec<Value<'js>>> {
    args.iter().map(|arg| marshal.to_js(ctx, arg)).collect()
}

fn call_parked<'js>(
    ctx: &Ctx<'js>,
    marshal: &Marshal,
    guest: &GuestRef,
    member: Option<&str>,
    args: &[HostValue],
) -> rquickjs::Result<Value<'js>> {
    let target = load(ctx, guest)?;
    let args = to_js_args(ctx, marshal, args)?;

    match member {
        None => {
            let type_name = target.type_name();
            let func = target
                .into_function()
                .ok_or_else(|| rquickjs::Error::new_from_js(type_name, "function"))?;
            func.call((Rest(args),))
        }
        Some(name) => {
            let type_name = target.type_name();
            let object = target
                .into_object()
                .ok_or_else(|| rquickjs::Error::new_from_js(type_name, "object"))?;
            let field: Value = object.get(name)?;
            match field.into_function() {
                Some(func) => func.call((This(object), Rest(args))),
                None => Ok(Value::new_null(ctx.clone())),
            }
        }
    }
}

/// `descriptor[member]`, called with the descriptor as `this` when it is
/// a function.
pub(crate) fn resolve_field<'js>(ctx: &Ctx<'js>, target: &Value<'js>, member: &str) -> rquickjs::Result<Value<'js>> {
    let Some(object) = target.as_object() else {
        return Ok(Value::new_undefined(ctx.clone()));
    };
    let field: Value = object.get(member)?;
    match field.as_function() {
        Some(func) => func.call((This(object.clone()),)),
        None => Ok(field),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::engine::GuestEngine;

    struct Fixture {
        _engine: GuestEngine,
        cell: Arc<RuntimeCell>,
        invoker: Invoker,
        scope: BindScope,
        runtime: Arc<GuestRuntime>,
    }

    fn fixture(generation: u64) -> Fixture {
        let engine = GuestEngine::new().unwrap();
        let cell = Arc::new(RuntimeCell::default());
        let runtime = Arc::new(engine.create_runtime(generation).unwrap());
        cell.install(Arc::clone(&runtime));
        let scope = BindScope::new(generation);
        runtime.with(|ctx| scope.install(&ctx).unwrap());
        let invoker = Invoker::new(Arc::clone(&cell), Arc::new(Marshal::default()));
        Fixture { _engine: engine, cell, invoker, scope, runtime }
    }

    fn park(f: &Fixture, origin: &str, source: &str) -> GuestRef {
        f.scope.set_origin(origin);
        f.runtime.with(|ctx| {
            let value: Value = ctx.eval(source).unwrap();
            f.scope.park(&ctx, value).unwrap()
        })
    }

    #[test]
    fn test_invoke_function_and_member() {
        let f = fixture(1);
        let add = park(&f, "math.js", "(a, b) => a + b");
        let desc = park(&f, "math.js", "({ base: 10, tick(n) { return this.base + n; } })");

        assert_eq!(
            f.invoker.invoke(&add, None, &[HostValue::Int(2), HostValue::Int(3)]),
            Invocation::Returned(HostValue::Int(5))
        );
        assert_eq!(
            f.invoker.invoke(&desc, Some("tick"), &[HostValue::Int(1)]),
            Invocation::Returned(HostValue::Int(11))
        );
        assert_eq!(
            f.invoker.invoke(&desc, Some("missing"), &[]),
            Invocation::Returned(HostValue::Null)
        );
    }

    #[test]
    fn test_throw_becomes_attributed_failure() {
        let f = fixture(1);
        let bad = park(&f, "boom.js", "(function explode() {\n  throw new Error('kaput');\n})");

        match f.invoker.invoke(&bad, None, &[]) {
            Invocation::Failed(failure) => {
                assert_eq!(failure.message, "kaput");
                assert_eq!(failure.origin.as_deref(), Some("boom.js"));
                assert!(failure.to_string().starts_with("[boom.js:2"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // Still callable afterwards.
        assert!(matches!(f.invoker.invoke(&bad, None, &[]), Invocation::Failed(_)));
    }

    #[test]
    fn test_closed_generation_is_stale() {
        let f = fixture(1);
        let callback = park(&f, "a.js", "() => 1");
        assert!(f.invoker.is_live(&callback));

        f.cell.close_current();
        assert!(!f.invoker.is_live(&callback));
        assert_eq!(f.invoker.invoke(&callback, None, &[]), Invocation::Stale);
        assert_eq!(f.invoker.resolve_member(&callback, "x"), Invocation::Stale);
    }

    #[test]
    fn test_resolve_member_value_or_producer() {
        let f = fixture(1);
        let plain = park(&f, "q.js", "({ query: 'players' })");
        let producer = park(&f, "q.js", "({ kind: 'npc', query() { return this.kind; } })");

        assert_eq!(f.invoker.resolve_member(&plain, "query").value(), Some(HostValue::from("players")));
        assert_eq!(f.invoker.resolve_member(&producer, "query").value(), Some(HostValue::from("npc")));
    }

    #[test]
    fn test_invoke_once_releases_slot() {
        let f = fixture(1);
        let once = park(&f, "t.js", "() => 'fired'");
        assert_eq!(f.invoker.invoke_once(&once, &[]).value(), Some(HostValue::from("fired")));
        assert!(matches!(f.invoker.invoke(&once, None, &[]), Invocation::Failed(_)));
    }
}

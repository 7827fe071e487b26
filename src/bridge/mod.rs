//! Capability bridge: the native surface bound into every guest context.
//!
//! The SDK's `Server` class delegates to the `__nativeServer` object built
//! here. Registration functions forward to the proxy of their extension
//! family; construction helpers and player lookup are answered directly.
//!
//! Natives never re-enter the [`Invoker`](crate::runtime::invoke::Invoker):
//! they already run inside the context, so anything they need from guest
//! values (queries, component types, factories) is read on the spot.

pub mod marshal;
pub mod player;
pub mod values;

use std::sync::Arc;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};

use self::marshal::Marshal;
use crate::diagnostics;
use crate::host::{CommandKind, ExtensionHost};
use crate::proxy::command::{CommandProxy, CommandStub, DeferredExecutor};
use crate::proxy::component::{ComponentProxy, CustomComponentType, RefChangeSystem};
use crate::proxy::event::{EntityEventSystem, EventProxy};
use crate::proxy::packet::{PacketDirection, PacketProxy};
use crate::proxy::system::{SystemKind, SystemProxy, TickSystem};
use crate::runtime::invoke::{self, BindScope, Invoker};
use crate::runtime::timer::{self, TimerQueue};
use crate::value::{FieldAccess, FieldRecord, HostValue};

/// Log target of guest `console` output.
pub const GUEST_LOG_TARGET: &str = "hyscript::guest";

/// Everything the natives of one host need, shared by every generation.
pub struct CapabilityBridge {
    host: Arc<dyn ExtensionHost>,
    marshal: Arc<Marshal>,
    timers: Arc<TimerQueue>,
    commands: CommandProxy,
    systems: SystemProxy,
    events: EventProxy,
    components: ComponentProxy,
    packets: PacketProxy,
}

impl std::fmt::Debug for CapabilityBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityBridge")
            .field("packets", &self.packets)
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl CapabilityBridge {
    pub(crate) fn new(
        host: Arc<dyn ExtensionHost>,
        invoker: Arc<Invoker>,
        marshal: Arc<Marshal>,
        timers: Arc<TimerQueue>,
        deferred: DeferredExecutor,
    ) -> Self {
        Self {
            commands: CommandProxy::new(Arc::clone(&host), Arc::clone(&invoker), deferred),
            systems: SystemProxy::new(Arc::clone(&host), Arc::clone(&invoker)),
            events: EventProxy::new(Arc::clone(&host), Arc::clone(&invoker)),
            components: ComponentProxy::new(Arc::clone(&host), Arc::clone(&invoker), Arc::clone(&marshal)),
            packets: PacketProxy::new(Arc::clone(&host), invoker),
            host,
            marshal,
            timers,
        }
    }

    fn args<'js>(&self, ctx: &Ctx<'js>, args: &[Value<'js>]) -> Vec<HostValue> {
        args.iter().map(|a| self.marshal.from_js(ctx, a)).collect()
    }

    /// Bind `__nativeServer`, `__nativeTimers`, `__nativeRecords` and the
    /// host's globals into a fresh context.
    pub(crate) fn bind<'js>(self: &Arc<Self>, ctx: &Ctx<'js>, scope: &Arc<BindScope>) -> rquickjs::Result<()> {
        let globals = ctx.globals();
        globals.set("__nativeServer", self.server_object(ctx, scope)?)?;
        globals.set("__nativeTimers", self.timer_object(ctx, scope)?)?;
        globals.set("__nativeRecords", self.record_object(ctx)?)?;
        for (name, value) in self.host.globals() {
            globals.set(name.as_str(), self.marshal.to_js(ctx, &value)?)?;
        }
        Ok(())
    }

    fn server_object<'js>(self: &Arc<Self>, ctx: &Ctx<'js>, scope: &Arc<BindScope>) -> rquickjs::Result<Object<'js>> {
        let native = Object::new(ctx.clone())?;

        let bridge = Arc::clone(self);
        native.set(
            "create",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, tag: String, args: Rest<Value<'js>>| {
                let args = bridge.args(&ctx, &args.0);
                bridge.marshal.to_js(&ctx, &values::create(&tag, &args))
            })?,
        )?;

        let bridge = Arc::clone(self);
        native.set(
            "createComponent",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, tag: String, args: Rest<Value<'js>>| {
                let args = bridge.args(&ctx, &args.0);
                bridge.marshal.to_js(&ctx, &values::create_component(&tag, &args))
            })?,
        )?;

        for (name, kind) in [
            ("addCommand", CommandKind::Plain),
            ("addPlayerCommand", CommandKind::Player),
            ("addCommandCollection", CommandKind::Collection),
        ] {
            let bridge = Arc::clone(self);
            let scope = Arc::clone(scope);
            native.set(
                name,
                Function::new(ctx.clone(), move |ctx: Ctx<'js>, descriptor: Object<'js>| {
                    bridge.commands.add(&ctx, &scope, kind, descriptor)
                })?,
            )?;
        }

        let (bridge, scope_ref) = (Arc::clone(self), Arc::clone(scope));
        native.set(
            "addSystem",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, tag: String, descriptor: Object<'js>| {
                bridge.systems.add(&ctx, &bridge.marshal, &scope_ref, &tag, descriptor)
            })?,
        )?;

        let (bridge, scope_ref) = (Arc::clone(self), Arc::clone(scope));
        native.set(
            "addEventSystem",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, tag: String, class: Value<'js>, descriptor: Object<'js>| {
                    let class = bridge.marshal.from_js(&ctx, &class);
                    bridge.events.add(&ctx, &bridge.marshal, &scope_ref, &tag, class, descriptor)
                },
            )?,
        )?;

        let (bridge, scope_ref) = (Arc::clone(self), Arc::clone(scope));
        native.set(
            "addComponentSystem",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, tag: String, class: Value<'js>, descriptor: Object<'js>| {
                    let class = bridge.marshal.from_js(&ctx, &class);
                    bridge.components.add_system(&ctx, &scope_ref, &tag, class, descriptor)
                },
            )?,
        )?;

        for (name, direction) in [
            ("addAdapterInbound", PacketDirection::Inbound),
            ("addAdapterOutbound", PacketDirection::Outbound),
        ] {
            let bridge = Arc::clone(self);
            let scope = Arc::clone(scope);
            native.set(
                name,
                Function::new(ctx.clone(), move |ctx: Ctx<'js>, callback: Function<'js>| {
                    bridge.packets.add(&ctx, &scope, direction, callback)
                })?,
            )?;
        }

        let (bridge, scope_ref) = (Arc::clone(self), Arc::clone(scope));
        native.set(
            "createCustomComponent",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, factory: Function<'js>| {
                bridge.components.create_custom(&ctx, &scope_ref, factory)
            })?,
        )?;

        let bridge = Arc::clone(self);
        native.set(
            "getPlayer",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, selector: Value<'js>| {
                let selector = bridge.marshal.from_js(&ctx, &selector);
                let resolved = player::resolve(bridge.host.players(), &selector);
                bridge.marshal.to_js(&ctx, &resolved)
            })?,
        )?;

        Ok(native)
    }

    fn timer_object<'js>(self: &Arc<Self>, ctx: &Ctx<'js>, scope: &Arc<BindScope>) -> rquickjs::Result<Object<'js>> {
        let timers = Object::new(ctx.clone())?;

        let (queue, scope) = (Arc::clone(&self.timers), Arc::clone(scope));
        timers.set(
            "set",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, callback: Function<'js>, ms: f64, repeat: bool| -> rquickjs::Result<u32> {
                    let delay = timer::guest_seconds(ms / 1000.0);
                    let guest = scope.park(&ctx, callback.into_value())?;
                    Ok(queue.schedule(guest, delay, repeat))
                },
            )?,
        )?;

        let queue = Arc::clone(&self.timers);
        timers.set(
            "clear",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, id: f64| -> rquickjs::Result<()> {
                match queue.cancel(id as u32) {
                    Some(guest) => invoke::release(&ctx, &guest),
                    None => Ok(()),
                }
            })?,
        )?;

        Ok(timers)
    }

    fn record_object<'js>(self: &Arc<Self>, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let records = Object::new(ctx.clone())?;

        let marshal = Arc::clone(&self.marshal);
        records.set(
            "get",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, id: f64, key: String| {
                match marshal.record(id as u64).and_then(|r| r.get(&key)) {
                    Some(value) => marshal.to_js(&ctx, &value),
                    None => Ok(Value::new_undefined(ctx.clone())),
                }
            })?,
        )?;

        let marshal = Arc::clone(&self.marshal);
        records.set(
            "set",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, id: f64, key: String, value: Value<'js>| {
                if let Some(record) = marshal.record(id as u64) {
                    record.set(&key, marshal.from_js(&ctx, &value));
                }
            })?,
        )?;

        let marshal = Arc::clone(&self.marshal);
        records.set(
            "has",
            Function::new(ctx.clone(), move |id: f64, key: String| {
                marshal.record(id as u64).is_some_and(|r| r.has(&key))
            })?,
        )?;

        let marshal = Arc::clone(&self.marshal);
        records.set(
            "keys",
            Function::new(ctx.clone(), move |id: f64| {
                marshal.record(id as u64).map(|r| r.keys()).unwrap_or_default()
            })?,
        )?;

        let marshal = Arc::clone(&self.marshal);
        records.set(
            "clone",
            Function::new(ctx.clone(), move |id: f64| -> Option<f64> {
                let copy: FieldRecord = marshal.record(id as u64)?.clone_record();
                Some(marshal.track(&Arc::new(copy)) as f64)
            })?,
        )?;

        Ok(records)
    }

    /// Bind a `console` whose output is attributed to `origin`.
    pub(crate) fn bind_console<'js>(ctx: &Ctx<'js>, origin: &str) -> rquickjs::Result<()> {
        let console = Object::new(ctx.clone())?;
        let origin: Arc<str> = Arc::from(origin);
        for (name, level) in [
            ("log", log::Level::Info),
            ("info", log::Level::Info),
            ("warn", log::Level::Warn),
            ("error", log::Level::Error),
            ("debug", log::Level::Debug),
        ] {
            let origin = Arc::clone(&origin);
            console.set(
                name,
                Function::new(ctx.clone(), move |args: Rest<Value<'js>>| {
                    let line: Vec<String> = args.0.iter().map(diagnostics::describe).collect();
                    log::log!(target: GUEST_LOG_TARGET, level, "[{origin}] {}", line.join(" "));
                })?,
            )?;
        }
        ctx.globals().set("console", console)
    }

    // ── Stub lookup ──────────────────────────────────────────────────

    /// Command stub by root name.
    pub fn command(&self, name: &str) -> Option<Arc<CommandStub>> {
        self.commands.stub(name)
    }

    /// Tick system stub by family.
    pub fn tick_system(&self, kind: SystemKind) -> Option<Arc<TickSystem>> {
        self.systems.stub(kind)
    }

    /// Entity-event stub by event class key.
    pub fn event_system(&self, key: &str) -> Option<Arc<EntityEventSystem>> {
        self.events.stub(key)
    }

    /// Ref-change stub by component class key.
    pub fn component_system(&self, key: &str) -> Option<Arc<RefChangeSystem>> {
        self.components.system(key)
    }

    /// Custom component type by `"<file>#<n>"` key.
    pub fn custom_component(&self, key: &str) -> Option<Arc<CustomComponentType>> {
        self.components.custom_component(key)
    }

    /// Packet filters currently attached to the host.
    pub fn packet_filter_count(&self) -> usize {
        self.packets.len()
    }

    /// Component records currently reachable from guest views.
    pub fn record_count(&self) -> usize {
        self.marshal.record_count()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Detach every registration; durable stubs stay registered.
    pub(crate) fn reload(&self) {
        self.commands.reload();
        self.systems.reload();
        self.events.reload();
        self.components.reload();
        self.packets.reload();
        self.timers.clear();
        self.marshal.clear_records();
    }

    /// Detach everything and forget every stub.
    pub(crate) fn shutdown(&self) {
        self.commands.shutdown();
        self.systems.shutdown();
        self.events.shutdown();
        self.components.shutdown();
        self.packets.shutdown();
        self.timers.clear();
        self.marshal.clear_records();
    }
}

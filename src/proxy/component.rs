//! Component-change ("ref-change") systems and guest-defined component types.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};

use super::{class_key, resolve_query, ActiveRegistrations};
use crate::bridge::marshal::Marshal;
use crate::diagnostics;
use crate::host::{EntityQuery, ExtensionHost, SystemRegistration};
use crate::runtime::invoke::{self, resolve_field, BindScope, GuestRef, Invocation, Invoker};
use crate::value::{FieldRecord, HostValue};

/// Only system type accepted by `addComponentSystem`.
pub const REF_CHANGE: &str = "refChange";

/// Entity whose component changed.
#[derive(Debug, Clone, Default)]
pub struct RefContext {
    /// Entity reference.
    pub entity_ref: HostValue,
    /// Entity store.
    pub store: HostValue,
    /// Deferred mutation buffer.
    pub command_buffer: HostValue,
}

/// Durable stub for one component class.
#[derive(Debug)]
pub struct RefChangeSystem {
    key: String,
    component_class: HostValue,
    component_type: RwLock<HostValue>,
    query: RwLock<EntityQuery>,
    active: ActiveRegistrations<()>,
    invoker: Arc<Invoker>,
}

impl RefChangeSystem {
    /// Stub key derived from the component class.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Component class as the guest passed it.
    pub fn component_class(&self) -> &HostValue {
        &self.component_class
    }

    /// `componentType` resolved from the first registration of the
    /// current generation; falls back to the component class.
    pub fn component_type(&self) -> HostValue {
        let resolved = self.component_type.read().unwrap_or_else(PoisonError::into_inner).clone();
        if resolved.is_null() {
            self.component_class.clone()
        } else {
            resolved
        }
    }

    /// Query of the first registration of the current generation.
    pub fn query(&self) -> EntityQuery {
        self.query.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Attached registrations, stale ones included until pruned.
    pub fn registration_count(&self) -> usize {
        self.active.len()
    }

    /// `onComponentAdded(ref, component, store, commandBuffer)`.
    pub fn on_component_added(&self, at: &RefContext, component: &HostValue) -> usize {
        self.fan_out(
            "onComponentAdded",
            vec![at.entity_ref.clone(), component.clone(), at.store.clone(), at.command_buffer.clone()],
        )
    }

    /// `onComponentSet(ref, previous, next, store, commandBuffer)`.
    pub fn on_component_set(&self, at: &RefContext, previous: &HostValue, next: &HostValue) -> usize {
        self.fan_out(
            "onComponentSet",
            vec![
                at.entity_ref.clone(),
                previous.clone(),
                next.clone(),
                at.store.clone(),
                at.command_buffer.clone(),
            ],
        )
    }

    /// `onComponentRemoved(ref, component, store, commandBuffer)`.
    pub fn on_component_removed(&self, at: &RefContext, component: &HostValue) -> usize {
        self.fan_out(
            "onComponentRemoved",
            vec![at.entity_ref.clone(), component.clone(), at.store.clone(), at.command_buffer.clone()],
        )
    }

    fn fan_out(&self, member: &str, args: Vec<HostValue>) -> usize {
        self.active
            .for_each_live(&self.invoker, |r| self.invoker.invoke(&r.guest, Some(member), &args))
            .len()
    }
}

// ── Custom components ────────────────────────────────────────────────

/// A component type defined by a guest factory.
///
/// Registered with the host once per `(file, position)` pair, so a script
/// that defines the same components on every load keeps its host-level
/// types across reloads. The factory itself is generation-checked.
#[derive(Debug)]
pub struct CustomComponentType {
    key: String,
    handle: RwLock<HostValue>,
    factories: ActiveRegistrations<()>,
    invoker: Arc<Invoker>,
}

impl CustomComponentType {
    /// `"<file>#<n>"`: the n-th component type defined by that file.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Host component-type handle.
    pub fn handle(&self) -> HostValue {
        self.handle.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Instance without fields, for host-side construction (deserialization).
    pub fn empty(&self) -> Arc<FieldRecord> {
        Arc::new(FieldRecord::new(BTreeMap::new()))
    }

    /// Run the live factory with `args` and snapshot its result.
    ///
    /// `None` when no live factory exists or it threw. Non-object results
    /// produce an empty record.
    pub fn instantiate(&self, args: &[HostValue]) -> Option<Arc<FieldRecord>> {
        let results = self
            .factories
            .for_each_live(&self.invoker, |r| self.invoker.invoke(&r.guest, None, args));
        match results.into_iter().last()? {
            Invocation::Returned(value) => Some(Arc::new(FieldRecord::new(value.into_map()))),
            _ => None,
        }
    }
}

/// Call a parked factory inside the guest and wrap its result in a record.
///
/// Used by the guest-facing `create(...)`; host-side construction goes
/// through [`CustomComponentType::instantiate`].
fn construct<'js>(
    ctx: &Ctx<'js>,
    marshal: &Marshal,
    factory: &GuestRef,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let target = invoke::load(ctx, factory)?;
    let type_name = target.type_name();
    let func = target
        .into_function()
        .ok_or_else(|| rquickjs::Error::new_from_js(type_name, "function"))?;
    let produced: Value = func.call((Rest(args),))?;
    let fields = marshal.from_js(ctx, &produced).into_map();
    marshal.to_js(ctx, &HostValue::Record(Arc::new(FieldRecord::new(fields))))
}

// ── Proxy ────────────────────────────────────────────────────────────

/// Proxy for `addComponentSystem` and `createCustomComponent`.
pub(crate) struct ComponentProxy {
    host: Arc<dyn ExtensionHost>,
    invoker: Arc<Invoker>,
    marshal: Arc<Marshal>,
    systems: Mutex<HashMap<String, Arc<RefChangeSystem>>>,
    custom: Mutex<HashMap<String, Arc<CustomComponentType>>>,
    defined_per_file: Mutex<BTreeMap<String, usize>>,
}

impl std::fmt::Debug for ComponentProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentProxy").finish_non_exhaustive()
    }
}

impl ComponentProxy {
    pub(crate) fn new(host: Arc<dyn ExtensionHost>, invoker: Arc<Invoker>, marshal: Arc<Marshal>) -> Self {
        Self {
            host,
            invoker,
            marshal,
            systems: Mutex::new(HashMap::new()),
            custom: Mutex::new(HashMap::new()),
            defined_per_file: Mutex::new(BTreeMap::new()),
        }
    }

    /// `server.addComponentSystem(type, componentClass, descriptor)`.
    pub(crate) fn add_system<'js>(
        &self,
        ctx: &Ctx<'js>,
        scope: &BindScope,
        tag: &str,
        component_class: HostValue,
        descriptor: Object<'js>,
    ) -> rquickjs::Result<bool> {
        if tag != REF_CHANGE {
            log::warn!("[{}] unknown component system type '{tag}', ignoring", scope.origin());
            return Ok(false);
        }
        let Some(key) = class_key(&component_class) else {
            log::warn!("[{}] addComponentSystem needs a component class", scope.origin());
            return Ok(false);
        };

        let (stub, created) = {
            let mut systems = self.systems.lock().unwrap_or_else(PoisonError::into_inner);
            match systems.get(&key) {
                Some(stub) => (Arc::clone(stub), false),
                None => {
                    let stub = Arc::new(RefChangeSystem {
                        key: key.clone(),
                        component_class,
                        component_type: RwLock::new(HostValue::Null),
                        query: RwLock::new(EntityQuery::Any),
                        active: ActiveRegistrations::default(),
                        invoker: Arc::clone(&self.invoker),
                    });
                    systems.insert(key, Arc::clone(&stub));
                    (stub, true)
                }
            }
        };

        if stub.active.is_empty() {
            let origin = scope.origin();
            let query = resolve_query(ctx, &self.marshal, &descriptor, &origin);
            *stub.query.write().unwrap_or_else(PoisonError::into_inner) = query;

            let as_value = descriptor.clone().into_value();
            let component_type = match resolve_field(ctx, &as_value, "componentType") {
                Ok(v) => self.marshal.from_js(ctx, &v),
                Err(e) => {
                    log::error!("componentType evaluation failed: {}", diagnostics::capture(ctx, &e, Some(&origin)));
                    HostValue::Null
                }
            };
            *stub.component_type.write().unwrap_or_else(PoisonError::into_inner) = component_type;
        }
        let guest = scope.park(ctx, descriptor.into_value())?;
        stub.active.push(guest, ());

        if created {
            log::debug!("Registering ref-change system for {}", stub.key);
            self.host.register_system(SystemRegistration::RefChange(stub));
        }
        Ok(true)
    }

    /// `server.createCustomComponent(factory)`: `{ type, create(...args) }`.
    pub(crate) fn create_custom<'js>(
        &self,
        ctx: &Ctx<'js>,
        scope: &BindScope,
        factory: Function<'js>,
    ) -> rquickjs::Result<Value<'js>> {
        let origin = scope.origin();
        let key = {
            let mut counts = self.defined_per_file.lock().unwrap_or_else(PoisonError::into_inner);
            let n = counts.entry(origin.to_string()).or_insert(0);
            *n += 1;
            format!("{origin}#{n}")
        };

        let (component, created) = {
            let mut custom = self.custom.lock().unwrap_or_else(PoisonError::into_inner);
            match custom.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let component = Arc::new(CustomComponentType {
                        key: key.clone(),
                        handle: RwLock::new(HostValue::Null),
                        factories: ActiveRegistrations::default(),
                        invoker: Arc::clone(&self.invoker),
                    });
                    custom.insert(key, Arc::clone(&component));
                    (component, true)
                }
            }
        };
        if created {
            let handle = self.host.register_component(Arc::clone(&component));
            *component.handle.write().unwrap_or_else(PoisonError::into_inner) = handle;
        }

        let guest = scope.park(ctx, factory.into_value())?;
        component.factories.clear();
        component.factories.push(guest.clone(), ());

        let marshal = Arc::clone(&self.marshal);
        let create = Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
            construct(&ctx, &marshal, &guest, args.0)
        })?;

        let result = Object::new(ctx.clone())?;
        result.set("type", self.marshal.to_js(ctx, &component.handle())?)?;
        result.set("create", create)?;
        Ok(result.into_value())
    }

    pub(crate) fn system(&self, key: &str) -> Option<Arc<RefChangeSystem>> {
        self.systems.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub(crate) fn custom_component(&self, key: &str) -> Option<Arc<CustomComponentType>> {
        self.custom.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub(crate) fn reload(&self) {
        for stub in self.systems.lock().unwrap_or_else(PoisonError::into_inner).values() {
            stub.active.clear();
            *stub.query.write().unwrap_or_else(PoisonError::into_inner) = EntityQuery::Any;
            *stub.component_type.write().unwrap_or_else(PoisonError::into_inner) = HostValue::Null;
        }
        for component in self.custom.lock().unwrap_or_else(PoisonError::into_inner).values() {
            component.factories.clear();
        }
        self.defined_per_file.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub(crate) fn shutdown(&self) {
        self.reload();
        self.systems.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.custom.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

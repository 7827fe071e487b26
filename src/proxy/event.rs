//! Entity-event systems, keyed by host event class.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rquickjs::{Ctx, Object};

use super::{class_key, resolve_query, ActiveRegistrations};
use crate::bridge::marshal::Marshal;
use crate::host::{EntityQuery, ExtensionHost, SystemRegistration};
use crate::runtime::invoke::{BindScope, Invoker};
use crate::value::{FieldAccess, FieldRecord, HostValue};

/// Only system type accepted by `addEventSystem`.
pub const ENTITY_EVENT: &str = "entityEvent";

/// Field read back after a cancelable dispatch.
pub const CANCELLED_FIELD: &str = "isCancelled";

/// One occurrence of an entity event.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Entity index within the chunk.
    pub index: usize,
    /// Archetype chunk.
    pub chunk: HostValue,
    /// Entity store.
    pub store: HostValue,
    /// Deferred mutation buffer.
    pub command_buffer: HostValue,
}

/// Durable stub for one event class.
#[derive(Debug)]
pub struct EntityEventSystem {
    key: String,
    event_class: HostValue,
    query: RwLock<EntityQuery>,
    active: ActiveRegistrations<()>,
    invoker: Arc<Invoker>,
}

impl EntityEventSystem {
    /// Stub key derived from the event class.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Event class as the guest passed it.
    pub fn event_class(&self) -> &HostValue {
        &self.event_class
    }

    /// Query of the first registration of the current generation.
    pub fn query(&self) -> EntityQuery {
        self.query.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Attached registrations, stale ones included until pruned.
    pub fn registration_count(&self) -> usize {
        self.active.len()
    }

    /// Deliver `event` to every live registration in registration order;
    /// returns how many ran.
    pub fn handle(&self, at: &EventContext, event: &HostValue) -> usize {
        let args = [
            HostValue::Int(at.index as i64),
            at.chunk.clone(),
            at.store.clone(),
            at.command_buffer.clone(),
            event.clone(),
        ];
        self.active
            .for_each_live(&self.invoker, |r| self.invoker.invoke(&r.guest, Some("handle"), &args))
            .len()
    }

    /// Copy-out/copy-in dispatch of a cancelable event.
    ///
    /// `fields` mirrors the host event; guest code sees it as a live object
    /// with `isCancelled` initially `false`. Returns the flag read back
    /// after every registration ran.
    pub fn handle_cancelable(&self, at: &EventContext, fields: BTreeMap<String, HostValue>) -> bool {
        let record = Arc::new(FieldRecord::new(fields));
        record.set(CANCELLED_FIELD, HostValue::Bool(false));
        self.handle(at, &HostValue::Record(Arc::clone(&record)));
        record
            .get(CANCELLED_FIELD)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Proxy for `addEventSystem`.
pub(crate) struct EventProxy {
    host: Arc<dyn ExtensionHost>,
    invoker: Arc<Invoker>,
    stubs: Mutex<HashMap<String, Arc<EntityEventSystem>>>,
}

impl std::fmt::Debug for EventProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProxy").finish_non_exhaustive()
    }
}

impl EventProxy {
    pub(crate) fn new(host: Arc<dyn ExtensionHost>, invoker: Arc<Invoker>) -> Self {
        Self {
            host,
            invoker,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    /// `server.addEventSystem(type, eventClass, descriptor)`.
    pub(crate) fn add<'js>(
        &self,
        ctx: &Ctx<'js>,
        marshal: &Marshal,
        scope: &BindScope,
        tag: &str,
        event_class: HostValue,
        descriptor: Object<'js>,
    ) -> rquickjs::Result<bool> {
        if tag != ENTITY_EVENT {
            log::warn!("[{}] unknown event system type '{tag}', ignoring", scope.origin());
            return Ok(false);
        }
        let Some(key) = class_key(&event_class) else {
            log::warn!("[{}] addEventSystem needs an event class", scope.origin());
            return Ok(false);
        };

        let (stub, created) = {
            let mut stubs = self.stubs.lock().unwrap_or_else(PoisonError::into_inner);
            match stubs.get(&key) {
                Some(stub) => (Arc::clone(stub), false),
                None => {
                    let stub = Arc::new(EntityEventSystem {
                        key: key.clone(),
                        event_class,
                        query: RwLock::new(EntityQuery::Any),
                        active: ActiveRegistrations::default(),
                        invoker: Arc::clone(&self.invoker),
                    });
                    stubs.insert(key, Arc::clone(&stub));
                    (stub, true)
                }
            }
        };

        if stub.active.is_empty() {
            let query = resolve_query(ctx, marshal, &descriptor, &scope.origin());
            *stub.query.write().unwrap_or_else(PoisonError::into_inner) = query;
        }
        let guest = scope.park(ctx, descriptor.into_value())?;
        stub.active.push(guest, ());

        if created {
            log::debug!("Registering entity event system for {}", stub.key);
            self.host.register_system(SystemRegistration::EntityEvent(stub));
        }
        Ok(true)
    }

    /// Stub for an event class key.
    pub(crate) fn stub(&self, key: &str) -> Option<Arc<EntityEventSystem>> {
        self.stubs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub(crate) fn reload(&self) {
        for stub in self.stubs.lock().unwrap_or_else(PoisonError::into_inner).values() {
            stub.active.clear();
            *stub.query.write().unwrap_or_else(PoisonError::into_inner) = EntityQuery::Any;
        }
    }

    pub(crate) fn shutdown(&self) {
        self.reload();
        self.stubs.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

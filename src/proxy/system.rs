//! Scheduled entity systems: `ticking`, `entityTicking`, `delayedEntity`.
//!
//! One [`TickSystem`] stub per system-type tag. Every guest descriptor
//! registered under a tag shares that stub and is ticked in registration
//! order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rquickjs::{Ctx, Object};

use super::{resolve_query, ActiveRegistrations};
use crate::bridge::marshal::Marshal;
use crate::host::{EntityQuery, ExtensionHost, SystemRegistration};
use crate::runtime::invoke::{BindScope, Invoker};
use crate::runtime::timer;
use crate::value::HostValue;

/// Default period of a `delayedEntity` system.
const DEFAULT_INTERVAL_SEC: f64 = 1.0;

/// System-type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemKind {
    /// Once per store tick: `tick(dt, index, store)`.
    Ticking,
    /// Once per matching entity per tick:
    /// `tick(dt, index, chunk, store, commandBuffer)`.
    EntityTicking,
    /// Like `EntityTicking`, at a fixed interval.
    DelayedEntity,
}

impl SystemKind {
    /// Parse a guest tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "ticking" => Some(Self::Ticking),
            "entityTicking" => Some(Self::EntityTicking),
            "delayedEntity" => Some(Self::DelayedEntity),
            _ => None,
        }
    }

    /// Guest tag.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Ticking => "ticking",
            Self::EntityTicking => "entityTicking",
            Self::DelayedEntity => "delayedEntity",
        }
    }
}

/// Arguments of one tick call.
///
/// `chunk` and `command_buffer` are ignored for [`SystemKind::Ticking`],
/// which the host runs outside any archetype iteration.
#[derive(Debug, Clone, Default)]
pub struct TickContext {
    /// Seconds since the previous tick.
    pub dt: f32,
    /// Entity index within the chunk, or the store index for `ticking`.
    pub index: usize,
    /// Archetype chunk being iterated.
    pub chunk: HostValue,
    /// Entity store.
    pub store: HostValue,
    /// Deferred mutation buffer.
    pub command_buffer: HostValue,
}

/// Durable stub for one system-type tag.
#[derive(Debug)]
pub struct TickSystem {
    kind: SystemKind,
    interval: Option<Duration>,
    query: RwLock<EntityQuery>,
    active: ActiveRegistrations<()>,
    invoker: Arc<Invoker>,
}

impl TickSystem {
    /// System family.
    pub fn kind(&self) -> SystemKind {
        self.kind
    }

    /// Period for `delayedEntity`; `None` for the others. Fixed by the
    /// first registration.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Query of the first registration of the current generation.
    pub fn query(&self) -> EntityQuery {
        self.query.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Attached registrations, stale ones included until pruned.
    pub fn registration_count(&self) -> usize {
        self.active.len()
    }

    /// Tick every live registration; returns how many ran.
    pub fn tick(&self, tick: &TickContext) -> usize {
        let dt = HostValue::Float(f64::from(tick.dt));
        let index = HostValue::Int(tick.index as i64);
        let args = match self.kind {
            SystemKind::Ticking => vec![dt, index, tick.store.clone()],
            SystemKind::EntityTicking | SystemKind::DelayedEntity => vec![
                dt,
                index,
                tick.chunk.clone(),
                tick.store.clone(),
                tick.command_buffer.clone(),
            ],
        };
        self.active
            .for_each_live(&self.invoker, |r| self.invoker.invoke(&r.guest, Some("tick"), &args))
            .len()
    }
}

/// Proxy for scheduled systems.
pub(crate) struct SystemProxy {
    host: Arc<dyn ExtensionHost>,
    invoker: Arc<Invoker>,
    stubs: Mutex<HashMap<SystemKind, Arc<TickSystem>>>,
}

impl std::fmt::Debug for SystemProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProxy").finish_non_exhaustive()
    }
}

impl SystemProxy {
    pub(crate) fn new(host: Arc<dyn ExtensionHost>, invoker: Arc<Invoker>) -> Self {
        Self {
            host,
            invoker,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    /// `server.addSystem(type, descriptor)`.
    pub(crate) fn add<'js>(
        &self,
        ctx: &Ctx<'js>,
        marshal: &Marshal,
        scope: &BindScope,
        tag: &str,
        descriptor: Object<'js>,
    ) -> rquickjs::Result<bool> {
        let Some(kind) = SystemKind::parse(tag) else {
            log::warn!("[{}] unknown system type '{tag}', ignoring", scope.origin());
            return Ok(false);
        };

        let (stub, created) = {
            let mut stubs = self.stubs.lock().unwrap_or_else(PoisonError::into_inner);
            match stubs.get(&kind) {
                Some(stub) => (Arc::clone(stub), false),
                None => {
                    let interval = (kind == SystemKind::DelayedEntity).then(|| {
                        let secs = descriptor
                            .get::<_, Option<f64>>("intervalSec")
                            .ok()
                            .flatten()
                            .filter(|s| s.is_finite() && *s > 0.0)
                            .unwrap_or(DEFAULT_INTERVAL_SEC);
                        timer::guest_seconds(secs)
                    });
                    let stub = Arc::new(TickSystem {
                        kind,
                        interval,
                        query: RwLock::new(EntityQuery::Any),
                        active: ActiveRegistrations::default(),
                        invoker: Arc::clone(&self.invoker),
                    });
                    stubs.insert(kind, Arc::clone(&stub));
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
            log::debug!("Registering {} system with host", kind.tag());
            self.host.register_system(SystemRegistration::Tick(stub));
        }
        Ok(true)
    }

    /// Stub for a tag, if one was ever registered.
    pub(crate) fn stub(&self, kind: SystemKind) -> Option<Arc<TickSystem>> {
        self.stubs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// Detach every registration; stubs stay registered.
    pub(crate) fn reload(&self) {
        for stub in self.stubs.lock().unwrap_or_else(PoisonError::into_inner).values() {
            stub.active.clear();
            *stub.query.write().unwrap_or_else(PoisonError::into_inner) = EntityQuery::Any;
        }
    }

    /// Detach everything and forget the stubs.
    pub(crate) fn shutdown(&self) {
        self.reload();
        self.stubs.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        for kind in [SystemKind::Ticking, SystemKind::EntityTicking, SystemKind::DelayedEntity] {
            assert_eq!(SystemKind::parse(kind.tag()), Some(kind));
        }
        assert_eq!(SystemKind::parse("refChange"), None);
    }
}

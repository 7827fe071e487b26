//! Inbound/outbound packet filters.
//!
//! Unlike the other proxies there is no shared stub: every guest callback
//! becomes its own [`PacketFilter`] registered directly with the host's
//! adapter chain, and is detached again on reload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rquickjs::{Ctx, Function};

use crate::host::ExtensionHost;
use crate::runtime::invoke::{BindScope, GuestRef, Invocation, Invoker};
use crate::value::HostValue;

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// Adapter chain a filter is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketDirection {
    /// Client to server.
    Inbound,
    /// Server to client.
    Outbound,
}

/// One guest packet filter.
#[derive(Debug)]
pub struct PacketFilter {
    id: u64,
    direction: PacketDirection,
    guest: GuestRef,
    invoker: Arc<Invoker>,
}

impl PacketFilter {
    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Chain the filter belongs to.
    pub fn direction(&self) -> PacketDirection {
        self.direction
    }

    /// Whether the guest consumed the packet.
    ///
    /// Only a literal `true` counts; any other result, a throw, or a
    /// filter from a closed generation lets the packet through.
    pub fn filter(&self, handler: &HostValue, packet: &HostValue) -> bool {
        match self.invoker.invoke(&self.guest, None, &[handler.clone(), packet.clone()]) {
            Invocation::Returned(HostValue::Bool(consumed)) => consumed,
            _ => false,
        }
    }
}

/// Proxy for `addAdapterInbound` / `addAdapterOutbound`.
pub(crate) struct PacketProxy {
    host: Arc<dyn ExtensionHost>,
    invoker: Arc<Invoker>,
    filters: Mutex<Vec<Arc<PacketFilter>>>,
}

impl std::fmt::Debug for PacketProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketProxy")
            .field("filters", &self.len())
            .finish_non_exhaustive()
    }
}

impl PacketProxy {
    pub(crate) fn new(host: Arc<dyn ExtensionHost>, invoker: Arc<Invoker>) -> Self {
        Self {
            host,
            invoker,
            filters: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add<'js>(
        &self,
        ctx: &Ctx<'js>,
        scope: &BindScope,
        direction: PacketDirection,
        callback: Function<'js>,
    ) -> rquickjs::Result<bool> {
        let guest = scope.park(ctx, callback.into_value())?;
        let filter = Arc::new(PacketFilter {
            id: NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            guest,
            invoker: Arc::clone(&self.invoker),
        });
        self.filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&filter));
        log::debug!("Registering {direction:?} packet filter {}", filter.id);
        self.host.register_packet_filter(filter);
        Ok(true)
    }

    /// Currently attached filters.
    pub(crate) fn len(&self) -> usize {
        self.filters.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Detach every filter from the host.
    pub(crate) fn reload(&self) {
        let detached: Vec<_> = std::mem::take(&mut *self.filters.lock().unwrap_or_else(PoisonError::into_inner));
        for filter in &detached {
            self.host.deregister_packet_filter(filter);
        }
    }

    pub(crate) fn shutdown(&self) {
        self.reload();
    }
}

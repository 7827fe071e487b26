//! In-memory [`ExtensionHost`] that records every registration.
//!
//! Used by the `hyscript` binary to run scripts without a game server, and
//! by tests to observe what reached the host and how often.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{ExtensionHost, HostCommand, PlayerDirectory, SystemRegistration};
use crate::proxy::component::CustomComponentType;
use crate::proxy::event::EntityEventSystem;
use crate::proxy::packet::{PacketDirection, PacketFilter};
use crate::proxy::system::{TickContext, TickSystem};
use crate::value::{Handle, HostValue};

/// Kind tag of component-type handles issued by [`RecordingHost`].
pub const COMPONENT_TYPE_KIND: &str = "componentType";

#[derive(Default)]
struct Recorded {
    commands: Vec<Arc<dyn HostCommand>>,
    systems: Vec<SystemRegistration>,
    filters: Vec<Arc<PacketFilter>>,
    components: Vec<Arc<CustomComponentType>>,
    counts: HashMap<String, usize>,
}

impl Recorded {
    fn count(&mut self, key: String) {
        *self.counts.entry(key).or_insert(0) += 1;
    }
}

/// Extension host that keeps registrations in memory.
///
/// Registration counts are kept per key and never decrease, so a test can
/// check that a stub key reached the host exactly once across reloads.
/// Keys: `command:<name>`, the [`SystemRegistration::key`], `packet:<id>`
/// and `component:<key>`.
#[derive(Default)]
pub struct RecordingHost {
    recorded: Mutex<Recorded>,
    globals: Vec<(String, HostValue)>,
    players: Option<Box<dyn PlayerDirectory>>,
}

impl std::fmt::Debug for RecordingHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("RecordingHost")
            .field("commands", &recorded.commands.len())
            .field("systems", &recorded.systems.len())
            .field("filters", &recorded.filters.len())
            .field("components", &recorded.components.len())
            .finish_non_exhaustive()
    }
}

impl RecordingHost {
    /// Bind `name = value` into every guest context.
    #[must_use]
    pub fn with_global(mut self, name: impl Into<String>, value: HostValue) -> Self {
        self.globals.push((name.into(), value));
        self
    }

    /// Answer `getPlayer` through `players`.
    #[must_use]
    pub fn with_players(mut self, players: impl PlayerDirectory + 'static) -> Self {
        self.players = Some(Box::new(players));
        self
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How many times `key` was registered.
    pub fn registration_count(&self, key: &str) -> usize {
        self.recorded().counts.get(key).copied().unwrap_or(0)
    }

    /// Registered command by root name or alias.
    pub fn command(&self, name: &str) -> Option<Arc<dyn HostCommand>> {
        self.recorded()
            .commands
            .iter()
            .find(|c| {
                let spec = c.spec();
                spec.name == name || spec.aliases.iter().any(|a| a == name)
            })
            .cloned()
    }

    /// Names of every registered command.
    pub fn command_names(&self) -> Vec<String> {
        self.recorded().commands.iter().map(|c| c.spec().name).collect()
    }

    /// Registered tick systems, in registration order.
    pub fn tick_systems(&self) -> Vec<Arc<TickSystem>> {
        self.recorded()
            .systems
            .iter()
            .filter_map(|s| match s {
                SystemRegistration::Tick(system) => Some(Arc::clone(system)),
                _ => None,
            })
            .collect()
    }

    /// Entity-event system registered for an event class key.
    pub fn event_system(&self, key: &str) -> Option<Arc<EntityEventSystem>> {
        self.recorded().systems.iter().find_map(|s| match s {
            SystemRegistration::EntityEvent(system) if system.key() == key => Some(Arc::clone(system)),
            _ => None,
        })
    }

    /// Every system registration.
    pub fn systems(&self) -> Vec<SystemRegistration> {
        self.recorded().systems.clone()
    }

    /// Packet filters currently attached to `direction`.
    pub fn packet_filters(&self, direction: PacketDirection) -> Vec<Arc<PacketFilter>> {
        self.recorded()
            .filters
            .iter()
            .filter(|f| f.direction() == direction)
            .cloned()
            .collect()
    }

    /// Run the inbound chain; `true` if some filter consumed the packet.
    pub fn filter_inbound(&self, handler: &HostValue, packet: &HostValue) -> bool {
        self.run_chain(PacketDirection::Inbound, handler, packet)
    }

    /// Run the outbound chain; `true` if some filter consumed the packet.
    pub fn filter_outbound(&self, handler: &HostValue, packet: &HostValue) -> bool {
        self.run_chain(PacketDirection::Outbound, handler, packet)
    }

    fn run_chain(&self, direction: PacketDirection, handler: &HostValue, packet: &HostValue) -> bool {
        // Snapshot first: filters may re-enter the host while running.
        let chain = self.packet_filters(direction);
        chain.iter().any(|f| f.filter(handler, packet))
    }

    /// Registered custom component types.
    pub fn components(&self) -> Vec<Arc<CustomComponentType>> {
        self.recorded().components.clone()
    }

    /// Tick every registered tick system once with an empty context;
    /// returns the number of live registrations run.
    pub fn tick_all(&self, dt: f32) -> usize {
        let systems = self.tick_systems();
        let tick = TickContext {
            dt,
            ..TickContext::default()
        };
        systems.iter().map(|s| s.tick(&tick)).sum()
    }
}

impl ExtensionHost for RecordingHost {
    fn register_command(&self, command: Arc<dyn HostCommand>) {
        let name = command.spec().name;
        log::debug!("host: command /{name}");
        let mut recorded = self.recorded();
        recorded.count(format!("command:{name}"));
        recorded.commands.push(command);
    }

    fn register_system(&self, system: SystemRegistration) {
        let key = system.key();
        log::debug!("host: system {key}");
        let mut recorded = self.recorded();
        recorded.count(key);
        recorded.systems.push(system);
    }

    fn register_packet_filter(&self, filter: Arc<PacketFilter>) {
        let mut recorded = self.recorded();
        recorded.count(format!("packet:{}", filter.id()));
        recorded.filters.push(filter);
    }

    fn deregister_packet_filter(&self, filter: &Arc<PacketFilter>) {
        self.recorded().filters.retain(|f| !Arc::ptr_eq(f, filter));
    }

    fn register_component(&self, component: Arc<CustomComponentType>) -> HostValue {
        let mut recorded = self.recorded();
        recorded.count(format!("component:{}", component.key()));
        recorded.components.push(component);
        HostValue::Handle(Handle::new(COMPONENT_TYPE_KIND, recorded.components.len() as u64))
    }

    fn players(&self) -> Option<&dyn PlayerDirectory> {
        self.players.as_deref()
    }

    fn globals(&self) -> Vec<(String, HostValue)> {
        self.globals.clone()
    }
}

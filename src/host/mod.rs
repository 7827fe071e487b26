//! Boundary to the host server.
//!
//! The scripting runtime never links against the game server directly.
//! Instead the server implements [`ExtensionHost`] (and optionally
//! [`PlayerDirectory`]) and receives durable stubs it drives from its own
//! tick, event, command and network machinery:
//!
//! ```text
//! ScriptHost ──► proxies ──► ExtensionHost::register_*  (once per key)
//!                               │
//!   host tick/event/command ──► stub.tick()/handle()/execute()/filter()
//!                               │
//!                               └──► live guest registrations
//! ```
//!
//! Host objects cross into guest code as opaque [`Handle`](crate::value::Handle)s.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

pub use crate::diagnostics::Feedback;
use crate::proxy::component::{CustomComponentType, RefChangeSystem};
use crate::proxy::event::EntityEventSystem;
use crate::proxy::packet::PacketFilter;
use crate::proxy::system::TickSystem;
use crate::value::HostValue;

/// The host's extension registry.
///
/// Each `register_*` call happens at most once per stub key for the life of
/// the process; reloads re-use the already registered stubs.
///
/// Registration calls may arrive while guest code is executing (a script
/// calling `server.addSystem(...)`), so implementations must not call back
/// into stubs synchronously from these methods.
pub trait ExtensionHost: Send + Sync {
    /// Register a command (guest-backed or built-in).
    fn register_command(&self, command: Arc<dyn HostCommand>);

    /// Register a scheduled or reactive entity system.
    fn register_system(&self, system: SystemRegistration);

    /// Attach a packet filter to the adapter chain of its direction.
    fn register_packet_filter(&self, filter: Arc<PacketFilter>);

    /// Detach a packet filter previously registered.
    fn deregister_packet_filter(&self, filter: &Arc<PacketFilter>);

    /// Register a custom component type; returns the host's component-type
    /// handle that guest code uses to refer to it.
    fn register_component(&self, component: Arc<CustomComponentType>) -> HostValue;

    /// Player lookups for `getPlayer`. `None` disables resolution.
    fn players(&self) -> Option<&dyn PlayerDirectory> {
        None
    }

    /// Fixed values bound as globals into every guest context (event-class
    /// and component-class handles, enum tables, ...).
    fn globals(&self) -> Vec<(String, HostValue)> {
        Vec::new()
    }
}

/// A registered system stub, by family.
#[derive(Debug, Clone)]
pub enum SystemRegistration {
    /// `ticking`, `entityTicking` or `delayedEntity`.
    Tick(Arc<TickSystem>),
    /// `entityEvent`, keyed by event class.
    EntityEvent(Arc<EntityEventSystem>),
    /// `refChange`, keyed by component class.
    RefChange(Arc<RefChangeSystem>),
}

impl SystemRegistration {
    /// Stub key as used for de-duplication.
    pub fn key(&self) -> String {
        match self {
            Self::Tick(s) => s.kind().tag().to_string(),
            Self::EntityEvent(s) => format!("entityEvent:{}", s.key()),
            Self::RefChange(s) => format!("refChange:{}", s.key()),
        }
    }
}

/// Entity filter of a system.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EntityQuery {
    /// Match every entity.
    #[default]
    Any,
    /// Host-defined filter value produced by guest code.
    Filter(HostValue),
}

impl EntityQuery {
    /// `Null` means "match everything".
    pub fn from_value(value: HostValue) -> Self {
        if value.is_null() {
            Self::Any
        } else {
            Self::Filter(value)
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────

/// Command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Runs off the calling thread with the command context only.
    Plain,
    /// Runs on the player's world with entity/world context.
    Player,
    /// Pure grouping node; only its subcommands execute.
    Collection,
}

/// Type tag of a command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Free text.
    String,
    /// Integer.
    Integer,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Boolean.
    Boolean,
    /// Online player reference.
    PlayerRef,
    /// Player UUID.
    PlayerUuid,
    /// Any UUID.
    Uuid,
    /// Game mode.
    GameMode,
    /// World name.
    World,
}

impl ArgType {
    /// Parse a guest type tag; unknown tags are treated as strings.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "integer" => Self::Integer,
            "float" => Self::Float,
            "double" => Self::Double,
            "boolean" => Self::Boolean,
            "playerRef" => Self::PlayerRef,
            "playerUuid" => Self::PlayerUuid,
            "uuid" => Self::Uuid,
            "gameMode" => Self::GameMode,
            "world" => Self::World,
            _ => Self::String,
        }
    }
}

/// Whether and how an argument may be omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgMode {
    /// Must be supplied.
    Required,
    /// Falls back to `value` when omitted.
    Default {
        /// Default in its textual form.
        value: String,
        /// Human description of the default.
        description: String,
    },
    /// May be omitted; absent from the argument map then.
    Optional,
}

/// One declared command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    /// Argument name (map key in the guest's `args`).
    pub name: String,
    /// Help text.
    pub description: String,
    /// Parsed type.
    pub arg_type: ArgType,
    /// Omission rule.
    pub mode: ArgMode,
}

/// Shape of a command as the host's command builder sees it.
///
/// `args` is in declaration order, which is also attach order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Command name.
    pub name: String,
    /// Help text.
    pub description: String,
    /// Family.
    pub kind: CommandKind,
    /// Alternative names.
    pub aliases: Vec<String>,
    /// Permission node; applies to this node only.
    pub permission: Option<String>,
    /// Ask the sender to confirm before executing.
    pub requires_confirmation: bool,
    /// Arguments in attach order.
    pub args: Vec<ArgSpec>,
    /// Child commands.
    pub subcommands: Vec<CommandSpec>,
}

impl CommandSpec {
    /// Find the node at `path` (subcommand names below this node).
    pub fn find(&self, path: &[String]) -> Option<&CommandSpec> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .subcommands
                .iter()
                .find(|c| &c.name == head || c.aliases.iter().any(|a| a == head))
                .and_then(|c| c.find(rest)),
        }
    }
}

/// Entity/world context of a player command invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerContext {
    /// Entity store.
    pub store: HostValue,
    /// Entity reference of the player.
    pub entity_ref: HostValue,
    /// Player reference.
    pub player_ref: HostValue,
    /// World the player is in.
    pub world: HostValue,
}

/// One execution request from the host.
#[derive(Clone, Default)]
pub struct CommandInvocation {
    /// Host command context (sender, raw input, ...), handed to guest code as-is.
    pub context: HostValue,
    /// Parsed arguments keyed by name.
    pub args: BTreeMap<String, HostValue>,
    /// Present for player commands.
    pub player: Option<PlayerContext>,
    /// Where to echo report lines for the sender.
    pub feedback: Option<Arc<dyn Feedback>>,
}

impl std::fmt::Debug for CommandInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandInvocation")
            .field("context", &self.context)
            .field("args", &self.args)
            .field("player", &self.player)
            .field("feedback", &self.feedback.is_some())
            .finish()
    }
}

/// Result of [`HostCommand::execute`].
#[derive(Debug)]
pub enum CommandOutcome {
    /// Ran to completion on the calling thread.
    Completed,
    /// Scheduled; the receiver fires once the deferred body has run.
    Deferred(tokio::sync::oneshot::Receiver<()>),
    /// No live handler for that path (unknown subcommand, grouping node,
    /// or every registration stale).
    NoHandler,
}

/// A command object registered with the host.
pub trait HostCommand: Send + Sync + std::fmt::Debug {
    /// Current shape. May change between reloads; hosts re-read it when
    /// building usage text or parsing input.
    fn spec(&self) -> CommandSpec;

    /// Execute the node at `path` below this command.
    fn execute(&self, path: &[String], invocation: CommandInvocation) -> CommandOutcome;
}

// ── Players ──────────────────────────────────────────────────────────

/// Primitive player lookups; `getPlayer` chains them.
///
/// Every method defaults to "unknown" so hosts implement only what they
/// can answer.
#[allow(unused_variables, reason = "default methods ignore their inputs")]
pub trait PlayerDirectory: Send + Sync {
    /// Player reference of an online player.
    fn player_ref_by_uuid(&self, uuid: Uuid) -> Option<HostValue> {
        None
    }
    /// Player entity of a command sender.
    fn player_of_command(&self, context: &HostValue) -> Option<HostValue> {
        None
    }
    /// Entity reference at `index` in an archetype chunk.
    fn ref_in_chunk(&self, chunk: &HostValue, index: i64) -> Option<HostValue> {
        None
    }
    /// Entity reference of a player entity.
    fn ref_of_player(&self, player: &HostValue) -> Option<HostValue> {
        None
    }
    /// World of a player entity.
    fn world_of_player(&self, player: &HostValue) -> Option<HostValue> {
        None
    }
    /// Entity reference of a player reference.
    fn ref_of_player_ref(&self, player_ref: &HostValue) -> Option<HostValue> {
        None
    }
    /// World of a player reference.
    fn world_of_player_ref(&self, player_ref: &HostValue) -> Option<HostValue> {
        None
    }
    /// Store an entity reference lives in.
    fn store_of_ref(&self, entity_ref: &HostValue) -> Option<HostValue> {
        None
    }
    /// Player component of an entity.
    fn player_of_ref(&self, store: &HostValue, entity_ref: &HostValue) -> Option<HostValue> {
        None
    }
    /// Player-reference component of an entity.
    fn player_ref_of_ref(&self, store: &HostValue, entity_ref: &HostValue) -> Option<HostValue> {
        None
    }
}

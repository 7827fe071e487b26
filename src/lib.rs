//! Hyscript - hot-reloadable ECMAScript scripting for tick-driven game servers.
//!
//! The host server implements [`ExtensionHost`] and drives the durable stubs
//! it receives from its own ticks, events, commands and packet pipeline.
//! Guest scripts come and go with every reload; the stubs stay.
//!
//! # Architecture
//!
//! - **ScriptHost** - Lifecycle manager: setup, reload, watcher, shutdown
//! - **CapabilityBridge** - The `server` surface bound into each guest context
//! - **Proxies** - One per extension family; own the durable host stubs
//! - **Invoker** - Generation-checked calls back into guest code
//!
//! # Modules
//!
//! - [`runtime`] - Engine, generations, invocation, timers, watcher
//! - [`bridge`] - Native functions, value conversion, player lookup
//! - [`proxy`] - Command, system, event, component and packet stubs
//! - [`host`] - Boundary traits and the in-memory recording host
//! - [`config`] - `config.json` and data directory layout

pub mod admin;
pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod embedded;
pub mod events;
pub mod host;
pub mod proxy;
pub mod runtime;
pub mod script;
pub mod transpile;
pub mod value;

// Re-export commonly used types
pub use config::{ScriptPaths, ScriptingConfig};
pub use diagnostics::GuestFailure;
pub use events::LifecycleEvent;
pub use host::memory::RecordingHost;
pub use host::{ExtensionHost, Feedback, HostCommand};
pub use runtime::{ReloadReport, ReloadTrigger, ScriptHost};
pub use transpile::TranspilerBinding;
pub use value::{FieldAccess, FieldRecord, HostValue};

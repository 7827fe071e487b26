//! Guest scripting runtime.
//!
//! # Architecture
//!
//! ```text
//! ScriptHost (manager)
//!  ├── GuestEngine        one QuickJS runtime for the process
//!  ├── RuntimeCell        current GuestRuntime (generation N)
//!  ├── Invoker            liveness-checked calls into the guest
//!  ├── TimerQueue         setTimeout / setInterval, fired by pump()
//!  └── ScriptWatcher      notify + debounce, triggers reload
//! ```
//!
//! # Configuration
//!
//! - `HYSCRIPT_DATA_DIR` - Override the data root
//! - `HYSCRIPT_HOT_RELOAD` - Force the watcher on or off
//! - `HYSCRIPT_TYPESCRIPT` - Force `.ts` support on or off

pub mod engine;
pub mod invoke;
pub mod manager;
pub mod timer;
pub mod watcher;

pub use engine::{GuestEngine, GuestRuntime, RuntimeCell};
pub use invoke::{GuestRef, Invocation, Invoker};
pub use manager::{LoadFailure, PumpStats, ReloadReport, ReloadTrigger, ScriptHost, ScriptHostBuilder};

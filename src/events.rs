//! Host lifecycle events delivered to guest listeners.
//!
//! The host calls [`ScriptHost::fire`](crate::ScriptHost::fire) from its own
//! event handlers. Plain events are a `server.callSync(name, payload)`;
//! cancelable ones go through the copy-out/copy-in protocol of
//! [`ScriptHost::dispatch_cancelable`](crate::ScriptHost::dispatch_cancelable).

use std::collections::BTreeMap;

use crate::value::HostValue;

/// One host event, ready to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    name: &'static str,
    fields: BTreeMap<String, HostValue>,
    cancelable: bool,
}

impl LifecycleEvent {
    fn new<const N: usize>(name: &'static str, cancelable: bool, fields: [(&str, HostValue); N]) -> Self {
        Self {
            name,
            fields: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            cancelable,
        }
    }

    /// A player finished connecting.
    pub fn player_connect(player_ref: HostValue, world: HostValue) -> Self {
        Self::new("playerConnect", false, [("playerRef", player_ref), ("world", world)])
    }

    /// A player left.
    pub fn player_disconnect(player_ref: HostValue, reason: impl Into<String>) -> Self {
        Self::new(
            "playerDisconnect",
            false,
            [("playerRef", player_ref), ("reason", HostValue::String(reason.into()))],
        )
    }

    /// A player's client reported ready.
    pub fn player_ready(player_ref: HostValue, ready_id: i64) -> Self {
        Self::new("playerReady", false, [("playerRef", player_ref), ("readyId", HostValue::Int(ready_id))])
    }

    /// A mouse button interaction; listeners may cancel it.
    pub fn player_mouse_button(player_ref: HostValue, button: HostValue, target: HostValue) -> Self {
        Self::new(
            "playerMouseButton",
            true,
            [("playerRef", player_ref), ("button", button), ("target", target)],
        )
    }

    /// A chat message; listeners may rewrite `content` or cancel it.
    pub fn player_chat(sender: HostValue, content: impl Into<String>, formatter: HostValue, targets: Vec<HostValue>) -> Self {
        Self::new(
            "playerChat",
            true,
            [
                ("sender", sender),
                ("content", HostValue::String(content.into())),
                ("formatter", formatter),
                ("targets", HostValue::List(targets)),
            ],
        )
    }

    /// Guest event name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Payload fields, without `isCancelled`.
    pub fn fields(&self) -> &BTreeMap<String, HostValue> {
        &self.fields
    }

    /// Whether listeners may cancel the event.
    pub fn is_cancelable(&self) -> bool {
        self.cancelable
    }

    pub(crate) fn into_parts(self) -> (&'static str, BTreeMap<String, HostValue>, bool) {
        (self.name, self.fields, self.cancelable)
    }
}

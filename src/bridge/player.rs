//! `getPlayer(selector)`: resolve a full player view from partial inputs.

use uuid::Uuid;

use crate::host::PlayerDirectory;
use crate::value::HostValue;

/// Upper bound on resolution passes; each pass fills at least one field or
/// ends the loop, so this only guards against a misbehaving directory.
const MAX_PASSES: usize = 8;

/// Fields of a selector, filled in as lookups succeed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerSelector {
    /// Player reference.
    pub player_ref: Option<HostValue>,
    /// Player entity/component.
    pub player: Option<HostValue>,
    /// Entity store.
    pub store: Option<HostValue>,
    /// Entity reference.
    pub entity_ref: Option<HostValue>,
    /// World.
    pub world: Option<HostValue>,
    /// Player UUID.
    pub uuid: Option<Uuid>,
    /// Command context of a sender.
    pub command_context: Option<HostValue>,
    /// Entity index within `archetype_chunk`.
    pub index: Option<i64>,
    /// Archetype chunk.
    pub archetype_chunk: Option<HostValue>,
}

fn present(value: Option<&HostValue>) -> Option<HostValue> {
    value.filter(|v| !v.is_null()).cloned()
}

impl PlayerSelector {
    /// Read a guest selector object. Unknown fields are ignored.
    pub fn from_value(value: &HostValue) -> Self {
        Self {
            player_ref: present(value.get("playerRef")),
            player: present(value.get("player")),
            store: present(value.get("store")),
            entity_ref: present(value.get("ref")),
            world: present(value.get("world")),
            uuid: value
                .get("uuid")
                .and_then(HostValue::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
            command_context: present(value.get("commandContext")),
            index: value.get("index").and_then(HostValue::as_i64),
            archetype_chunk: present(value.get("archetypeChunk")),
        }
    }

    /// Whether enough is known to hand out a player view.
    pub fn is_complete(&self) -> bool {
        self.player_ref.is_some() && self.player.is_some() && self.entity_ref.is_some() && self.store.is_some()
    }

    /// One round of lookups. Returns whether any field was filled.
    fn fill_pass(&mut self, players: &dyn PlayerDirectory) -> bool {
        let mut changed = false;
        let mut fill = |slot: &mut Option<HostValue>, found: Option<HostValue>| {
            if slot.is_none() {
                if let Some(v) = found.filter(|v| !v.is_null()) {
                    *slot = Some(v);
                    changed = true;
                }
            }
        };

        if let Some(uuid) = self.uuid {
            fill(&mut self.player_ref, players.player_ref_by_uuid(uuid));
        }
        if let Some(context) = &self.command_context {
            fill(&mut self.player, players.player_of_command(context));
        }
        if let (Some(chunk), Some(index)) = (&self.archetype_chunk, self.index) {
            fill(&mut self.entity_ref, players.ref_in_chunk(chunk, index));
        }
        if let Some(player) = self.player.clone() {
            fill(&mut self.entity_ref, players.ref_of_player(&player));
            fill(&mut self.world, players.world_of_player(&player));
        }
        if let Some(player_ref) = self.player_ref.clone() {
            fill(&mut self.entity_ref, players.ref_of_player_ref(&player_ref));
            fill(&mut self.world, players.world_of_player_ref(&player_ref));
        }
        if let Some(entity_ref) = self.entity_ref.clone() {
            fill(&mut self.store, players.store_of_ref(&entity_ref));
        }
        if let (Some(store), Some(entity_ref)) = (self.store.clone(), self.entity_ref.clone()) {
            fill(&mut self.player, players.player_of_ref(&store, &entity_ref));
            fill(&mut self.player_ref, players.player_ref_of_ref(&store, &entity_ref));
        }
        changed
    }

    /// Fill missing fields until nothing changes.
    pub fn resolve(mut self, players: &dyn PlayerDirectory) -> Self {
        for _ in 0..MAX_PASSES {
            if self.is_complete() || !self.fill_pass(players) {
                break;
            }
        }
        self
    }

    /// `{ playerRef, player, ref, store, world }`, or `Null` when incomplete.
    pub fn into_value(self) -> HostValue {
        if !self.is_complete() {
            return HostValue::Null;
        }
        HostValue::map([
            ("playerRef", self.player_ref.unwrap_or_default()),
            ("player", self.player.unwrap_or_default()),
            ("ref", self.entity_ref.unwrap_or_default()),
            ("store", self.store.unwrap_or_default()),
            ("world", self.world.unwrap_or_default()),
        ])
    }
}

/// Resolve a guest selector against `players`.
pub fn resolve(players: Option<&dyn PlayerDirectory>, selector: &HostValue) -> HostValue {
    let selector = PlayerSelector::from_value(selector);
    match players {
        Some(players) => selector.resolve(players).into_value(),
        None => selector.into_value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One online player: uuid U, playerRef #1, entity ref #2 in store #3,
    /// world #4, player component #5, reachable from command context #6.
    struct OnePlayer {
        uuid: Uuid,
    }

    fn h(kind: &str, id: u64) -> HostValue {
        HostValue::handle(kind, id)
    }

    impl PlayerDirectory for OnePlayer {
        fn player_ref_by_uuid(&self, uuid: Uuid) -> Option<HostValue> {
            (uuid == self.uuid).then(|| h("playerRef", 1))
        }
        fn player_of_command(&self, context: &HostValue) -> Option<HostValue> {
            (context == &h("commandContext", 6)).then(|| h("player", 5))
        }
        fn ref_of_player_ref(&self, player_ref: &HostValue) -> Option<HostValue> {
            (player_ref == &h("playerRef", 1)).then(|| h("ref", 2))
        }
        fn world_of_player_ref(&self, _: &HostValue) -> Option<HostValue> {
            Some(h("world", 4))
        }
        fn ref_of_player(&self, _: &HostValue) -> Option<HostValue> {
            Some(h("ref", 2))
        }
        fn store_of_ref(&self, _: &HostValue) -> Option<HostValue> {
            Some(h("store", 3))
        }
        fn player_of_ref(&self, _: &HostValue, _: &HostValue) -> Option<HostValue> {
            Some(h("player", 5))
        }
        fn player_ref_of_ref(&self, _: &HostValue, _: &HostValue) -> Option<HostValue> {
            Some(h("playerRef", 1))
        }
    }

    #[test]
    fn test_resolves_from_uuid_alone() {
        let directory = OnePlayer { uuid: Uuid::new_v4() };
        let selector = HostValue::map([("uuid", HostValue::String(directory.uuid.to_string()))]);
        let resolved = resolve(Some(&directory), &selector);

        assert_eq!(resolved.get("playerRef"), Some(&h("playerRef", 1)));
        assert_eq!(resolved.get("ref"), Some(&h("ref", 2)));
        assert_eq!(resolved.get("store"), Some(&h("store", 3)));
        assert_eq!(resolved.get("player"), Some(&h("player", 5)));
        assert_eq!(resolved.get("world"), Some(&h("world", 4)));
    }

    #[test]
    fn test_resolves_from_command_context() {
        let directory = OnePlayer { uuid: Uuid::new_v4() };
        let selector = HostValue::map([("commandContext", h("commandContext", 6))]);
        let resolved = resolve(Some(&directory), &selector);
        assert_eq!(resolved.get("playerRef"), Some(&h("playerRef", 1)));
    }

    #[test]
    fn test_incomplete_is_null() {
        let directory = OnePlayer { uuid: Uuid::new_v4() };
        let unknown = HostValue::map([("uuid", HostValue::String(Uuid::new_v4().to_string()))]);
        assert_eq!(resolve(Some(&directory), &unknown), HostValue::Null);
        assert_eq!(resolve(None, &HostValue::map([("playerRef", h("playerRef", 1))])), HostValue::Null);
    }

    #[test]
    fn test_complete_selector_needs_no_directory() {
        let selector = HostValue::map([
            ("playerRef", h("playerRef", 1)),
            ("player", h("player", 5)),
            ("ref", h("ref", 2)),
            ("store", h("store", 3)),
        ]);
        let resolved = resolve(None, &selector);
        assert_eq!(resolved.get("world"), Some(&HostValue::Null));
    }
}

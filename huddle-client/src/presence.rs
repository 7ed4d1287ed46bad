//! Presence: the local actor's ephemeral state and the view of everyone
//! else in the room.
//!
//! Presence is a flat JSON object per actor, merged key-wise. Updates on
//! the wire are partial; the receiving side keeps the union. Remote
//! entries appear on the first message from an actor and disappear on
//! `USER_LEFT`. Nothing here is persisted.

use std::collections::BTreeMap;

use serde_json::Value;

use huddle_store::{ActorId, JsonObject};

use crate::protocol::UserMeta;

/// A local presence patch: `None` deletes the key.
pub type PresencePatch = BTreeMap<String, Option<Value>>;

/// Another connected actor, as seen from this client.
#[derive(Debug, Clone, PartialEq)]
pub struct Other {
    pub actor: ActorId,
    pub presence: JsonObject,
    pub info: Option<Value>,
    pub scopes: Vec<String>,
}

/// Change notification for the `others` view.
#[derive(Debug, Clone, PartialEq)]
pub enum OthersEvent {
    Joined { actor: ActorId },
    Left { actor: ActorId },
    Updated { actor: ActorId },
    /// The whole roster was replaced (`ROOM_STATE`).
    Reset,
}

/// Presence state for one room.
#[derive(Debug, Default)]
pub struct PresenceState {
    mine: JsonObject,
    others: BTreeMap<ActorId, Other>,
}

impl PresenceState {
    pub fn mine(&self) -> &JsonObject {
        &self.mine
    }

    pub fn others(&self) -> Vec<Other> {
        self.others.values().cloned().collect()
    }

    pub fn other(&self, actor: ActorId) -> Option<&Other> {
        self.others.get(&actor)
    }

    /// Merge a local patch into our presence. Returns the inverse patch
    /// that restores the previous values.
    pub fn apply_local(&mut self, patch: &PresencePatch) -> PresencePatch {
        let mut inverse = PresencePatch::new();
        for (key, value) in patch {
            let previous = match value {
                Some(v) => self.mine.insert(key.clone(), v.clone()),
                None => self.mine.remove(key),
            };
            inverse.insert(key.clone(), previous);
        }
        inverse
    }

    /// Merge a remote partial update. `null` values delete keys. Creates
    /// the actor's entry on first contact.
    pub fn merge_remote(&mut self, actor: ActorId, data: &JsonObject) {
        let entry = self.others.entry(actor).or_insert_with(|| Other {
            actor,
            presence: JsonObject::new(),
            info: None,
            scopes: Vec::new(),
        });
        for (key, value) in data {
            if value.is_null() {
                entry.presence.remove(key);
            } else {
                entry.presence.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn user_joined(&mut self, actor: ActorId, info: Option<Value>, scopes: Vec<String>) {
        let entry = self.others.entry(actor).or_insert_with(|| Other {
            actor,
            presence: JsonObject::new(),
            info: None,
            scopes: Vec::new(),
        });
        entry.info = info;
        entry.scopes = scopes;
    }

    /// Returns whether the actor was known.
    pub fn user_left(&mut self, actor: ActorId) -> bool {
        self.others.remove(&actor).is_some()
    }

    /// Replace the roster from a `ROOM_STATE` message. Presence data for
    /// the listed actors arrives separately (each peer re-announces to a
    /// newly joined actor).
    pub fn reset_others(&mut self, users: &BTreeMap<ActorId, UserMeta>) {
        self.others = users
            .iter()
            .map(|(actor, meta)| {
                (
                    *actor,
                    Other {
                        actor: *actor,
                        presence: JsonObject::new(),
                        info: meta.info.clone(),
                        scopes: meta.scopes.clone(),
                    },
                )
            })
            .collect();
    }

    pub fn clear_others(&mut self) {
        self.others.clear();
    }
}

/// Convert a local patch to its wire form (`None` → JSON `null`).
pub(crate) fn patch_to_wire(patch: &PresencePatch) -> JsonObject {
    patch
        .iter()
        .map(|(key, value)| {
            (
                key.clone(),
                value.clone().unwrap_or(Value::Null),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(pairs: &[(&str, Option<Value>)]) -> PresencePatch {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_apply_local_and_inverse() {
        let mut presence = PresenceState::default();
        presence.apply_local(&patch(&[("cursor", Some(json!(1)))]));

        let inverse = presence.apply_local(&patch(&[
            ("cursor", Some(json!(2))),
            ("name", Some(json!("ada"))),
        ]));
        assert_eq!(presence.mine().get("cursor"), Some(&json!(2)));
        assert_eq!(inverse.get("cursor"), Some(&Some(json!(1))));
        assert_eq!(inverse.get("name"), Some(&None));

        // applying the inverse restores the old record
        presence.apply_local(&inverse);
        assert_eq!(presence.mine().get("cursor"), Some(&json!(1)));
        assert!(!presence.mine().contains_key("name"));
    }

    #[test]
    fn test_none_deletes_key() {
        let mut presence = PresenceState::default();
        presence.apply_local(&patch(&[("sel", Some(json!([1, 2])))]));
        presence.apply_local(&patch(&[("sel", None)]));
        assert!(presence.mine().is_empty());
    }

    #[test]
    fn test_remote_merge_is_commutative_on_disjoint_keys() {
        let a = json!({"a": 1}).as_object().cloned().unwrap_or_default();
        let b = json!({"b": 2}).as_object().cloned().unwrap_or_default();

        let mut first = PresenceState::default();
        first.merge_remote(7, &a);
        first.merge_remote(7, &b);

        let mut second = PresenceState::default();
        second.merge_remote(7, &b);
        second.merge_remote(7, &a);

        assert_eq!(first.other(7), second.other(7));
    }

    #[test]
    fn test_remote_null_removes_key() {
        let mut presence = PresenceState::default();
        presence.merge_remote(
            3,
            json!({"x": 5}).as_object().expect("object"),
        );
        presence.merge_remote(
            3,
            json!({"x": null, "y": 1}).as_object().expect("object"),
        );
        let other = presence.other(3).expect("known actor");
        assert!(!other.presence.contains_key("x"));
        assert_eq!(other.presence.get("y"), Some(&json!(1)));
    }

    #[test]
    fn test_first_message_creates_entry_and_left_removes() {
        let mut presence = PresenceState::default();
        presence.merge_remote(4, json!({"x": 1}).as_object().expect("object"));
        assert!(presence.other(4).is_some());
        assert!(presence.user_left(4));
        assert!(presence.other(4).is_none());
        assert!(!presence.user_left(4));
    }

    #[test]
    fn test_reset_others_replaces_roster() {
        let mut presence = PresenceState::default();
        presence.merge_remote(1, json!({"x": 1}).as_object().expect("object"));

        let mut users = BTreeMap::new();
        users.insert(
            2,
            UserMeta {
                info: Some(json!({"name": "bo"})),
                scopes: vec!["room:write".into()],
            },
        );
        presence.reset_others(&users);
        assert!(presence.other(1).is_none());
        let other = presence.other(2).expect("actor 2 in roster");
        assert_eq!(other.info, Some(json!({"name": "bo"})));
        assert_eq!(other.scopes, vec!["room:write".to_string()]);
    }

    #[test]
    fn test_patch_to_wire_uses_null_for_deletes() {
        let wire = patch_to_wire(&patch(&[("a", Some(json!(1))), ("b", None)]));
        assert_eq!(wire.get("a"), Some(&json!(1)));
        assert_eq!(wire.get("b"), Some(&Value::Null));
    }
}

//! Outbound coalescer.
//!
//! Everything the client wants to say accumulates here between flushes:
//! a merged presence diff (latest value per key wins), ordered storage
//! ops, and ordered broadcast events. The connection task drains the
//! outbox at most once per throttle window, emitting frames in a fixed
//! order: targeted presence resyncs, then the presence update, then one
//! `UPDATE_STORAGE` with every pending op, then one frame per broadcast
//! event. While the connection is down the buffers simply grow.

use serde_json::Value;

use huddle_store::{ActorId, JsonObject, Op};

use crate::presence::{patch_to_wire, PresencePatch};
use crate::protocol::ClientMessage;

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    /// Merged presence diff in wire form (`null` = delete key).
    presence_diff: JsonObject,
    /// Send the full local presence (not just the diff) on next flush.
    presence_full: bool,
    /// Newly joined actors owed a full, targeted presence snapshot.
    resync_targets: Vec<ActorId>,
    ops: Vec<Op>,
    events: Vec<Value>,
}

impl Outbox {
    pub fn queue_presence(&mut self, patch: &PresencePatch) {
        for (key, value) in patch_to_wire(patch) {
            self.presence_diff.insert(key, value);
        }
    }

    /// Schedule a full presence broadcast (used on every entry into
    /// `open` so reconnecting clients are immediately visible).
    pub fn mark_full_presence(&mut self) {
        self.presence_full = true;
    }

    /// Schedule a full presence snapshot targeted at one new peer.
    pub fn queue_resync(&mut self, actor: ActorId) {
        if !self.resync_targets.contains(&actor) {
            self.resync_targets.push(actor);
        }
    }

    pub fn queue_ops(&mut self, ops: impl IntoIterator<Item = Op>) {
        self.ops.extend(ops);
    }

    /// Move queued storage ops back out (used when rebasing onto a fresh
    /// initial storage state).
    pub fn take_ops(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ops)
    }

    pub fn queue_event(&mut self, event: Value) {
        self.events.push(event);
    }

    pub fn is_dirty(&self) -> bool {
        self.has_flushable(true)
    }

    /// Whether a flush right now would emit at least one frame. Storage
    /// ops only count once the connection has its initial storage state.
    pub fn has_flushable(&self, include_storage: bool) -> bool {
        self.presence_full
            || !self.presence_diff.is_empty()
            || !self.resync_targets.is_empty()
            || !self.events.is_empty()
            || (include_storage && !self.ops.is_empty())
    }

    /// Drain the outbox into wire messages.
    ///
    /// `full_presence` is the complete local presence record, used for
    /// targeted resyncs and full broadcasts. When `include_storage` is
    /// false (initial storage not yet received on this connection) the
    /// op buffer is left untouched. Returns the messages and the ops
    /// that moved into flight, so the caller can track them until acked.
    pub fn take_frames(
        &mut self,
        full_presence: &JsonObject,
        include_storage: bool,
    ) -> (Vec<ClientMessage>, Vec<Op>) {
        let mut messages = Vec::new();

        for actor in self.resync_targets.drain(..) {
            messages.push(ClientMessage::UpdatePresence {
                data: full_presence.clone(),
                target_actor: Some(actor),
            });
        }

        if self.presence_full {
            self.presence_full = false;
            self.presence_diff.clear();
            messages.push(ClientMessage::UpdatePresence {
                data: full_presence.clone(),
                target_actor: None,
            });
        } else if !self.presence_diff.is_empty() {
            messages.push(ClientMessage::UpdatePresence {
                data: std::mem::take(&mut self.presence_diff),
                target_actor: None,
            });
        }

        let mut sent_ops = Vec::new();
        if include_storage && !self.ops.is_empty() {
            sent_ops = std::mem::take(&mut self.ops);
            messages.push(ClientMessage::UpdateStorage {
                ops: sent_ops.clone(),
            });
        }

        for event in self.events.drain(..) {
            messages.push(ClientMessage::BroadcastEvent { event });
        }

        (messages, sent_ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_store::{NodeId, OpId};
    use serde_json::json;

    fn patch(pairs: &[(&str, Option<Value>)]) -> PresencePatch {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn some_op(seq: u32) -> Op {
        Op::DeleteCrdt {
            op_id: OpId::new(1, seq),
            id: NodeId::new(1, seq + 1),
        }
    }

    #[test]
    fn test_presence_diff_merges_latest_wins() {
        let mut outbox = Outbox::default();
        outbox.queue_presence(&patch(&[("x", Some(json!(1)))]));
        outbox.queue_presence(&patch(&[("x", Some(json!(2))), ("y", None)]));

        let mine = JsonObject::new();
        let (messages, _) = outbox.take_frames(&mine, true);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ClientMessage::UpdatePresence { data, target_actor } => {
                assert_eq!(data.get("x"), Some(&json!(2)));
                assert_eq!(data.get("y"), Some(&Value::Null));
                assert!(target_actor.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!outbox.is_dirty());
    }

    #[test]
    fn test_flush_order_presence_then_ops_then_events() {
        let mut outbox = Outbox::default();
        outbox.queue_event(json!({"emoji": "wave"}));
        outbox.queue_ops([some_op(1), some_op(3)]);
        outbox.queue_presence(&patch(&[("c", Some(json!(9)))]));

        let mine = JsonObject::new();
        let (messages, sent_ops) = outbox.take_frames(&mine, true);
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], ClientMessage::UpdatePresence { .. }));
        match &messages[1] {
            ClientMessage::UpdateStorage { ops } => assert_eq!(ops.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(messages[2], ClientMessage::BroadcastEvent { .. }));
        assert_eq!(sent_ops.len(), 2);
    }

    #[test]
    fn test_resync_targets_come_first_with_full_presence() {
        let mut outbox = Outbox::default();
        outbox.queue_presence(&patch(&[("c", Some(json!(1)))]));
        outbox.queue_resync(4);
        outbox.queue_resync(4); // deduped

        let mine = json!({"c": 1, "name": "ada"})
            .as_object()
            .cloned()
            .unwrap_or_default();
        let (messages, _) = outbox.take_frames(&mine, true);
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ClientMessage::UpdatePresence { data, target_actor } => {
                assert_eq!(*target_actor, Some(4));
                assert_eq!(data.len(), 2); // full record, not the diff
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_full_presence_supersedes_diff() {
        let mut outbox = Outbox::default();
        outbox.queue_presence(&patch(&[("stale", Some(json!(1)))]));
        outbox.mark_full_presence();

        let mine = json!({"fresh": true}).as_object().cloned().unwrap_or_default();
        let (messages, _) = outbox.take_frames(&mine, true);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ClientMessage::UpdatePresence { data, .. } => {
                assert!(data.contains_key("fresh"));
                assert!(!data.contains_key("stale"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_storage_held_back_until_synced() {
        let mut outbox = Outbox::default();
        outbox.queue_ops([some_op(1)]);

        let mine = JsonObject::new();
        let (messages, sent_ops) = outbox.take_frames(&mine, false);
        assert!(messages.is_empty());
        assert!(sent_ops.is_empty());
        assert!(outbox.is_dirty());

        let (messages, sent_ops) = outbox.take_frames(&mine, true);
        assert_eq!(messages.len(), 1);
        assert_eq!(sent_ops.len(), 1);
    }

    #[test]
    fn test_events_never_coalesce() {
        let mut outbox = Outbox::default();
        outbox.queue_event(json!(1));
        outbox.queue_event(json!(2));
        let (messages, _) = outbox.take_frames(&JsonObject::new(), true);
        assert_eq!(messages.len(), 2);
    }
}

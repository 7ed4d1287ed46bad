//! A room: presence, shared storage, broadcast, history, and the wiring
//! between them and the connection task.
//!
//! All room state sits behind one lock, matching the single-threaded
//! cooperative model: every mutation (user call, remote frame, ack) runs
//! to completion before the next one observes state. Subscriber callbacks
//! fire after the lock is released but before the mutating call returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};

use huddle_store::{
    merge_updates, ActorId, IdFactory, JsonObject, Op, OpId, OpSource, StorageDoc, StorageError,
    StorageUpdate,
};

use crate::connection::{self, ConnectionConfig, ConnectionStatus, Control};
use crate::error::{HistoryError, ProtocolError, RoomError};
use crate::events::{NodeTopics, Subscription, Topic};
use crate::history::{History, HistoryEntry, HistoryOp};
use crate::outbox::Outbox;
use crate::presence::{Other, OthersEvent, PresencePatch, PresenceState};
use crate::protocol::ServerMessage;
use crate::storage::LiveObject;

/// A broadcast event received from another actor.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    pub actor: ActorId,
    pub payload: Value,
}

/// Options for [`Room::update_presence`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceOptions {
    /// Record the change on the undo stack.
    pub add_to_history: bool,
}

pub(crate) struct Hub {
    pub status: Topic<ConnectionStatus>,
    pub my_presence: Topic<JsonObject>,
    pub others: Topic<OthersEvent>,
    pub event: Topic<RoomEvent>,
    pub error: Topic<RoomError>,
    pub storage: Topic<Vec<StorageUpdate>>,
    pub nodes: NodeTopics,
}

impl Hub {
    fn new() -> Self {
        Self {
            status: Topic::new(),
            my_presence: Topic::new(),
            others: Topic::new(),
            event: Topic::new(),
            error: Topic::new(),
            storage: Topic::new(),
            nodes: NodeTopics::new(),
        }
    }
}

pub(crate) struct RoomState {
    /// `None` until the first `INITIAL_STORAGE_STATE` arrives.
    pub doc: Option<StorageDoc>,
    pub ids: IdFactory,
    pub presence: PresenceState,
    pub outbox: Outbox,
    pub history: History,
    /// Ops sent (or buffered) but not yet echoed back by the server.
    pub unacked: Vec<Op>,
    pub unacked_ids: HashSet<OpId>,
    pub status: ConnectionStatus,
    pub actor: Option<ActorId>,
    /// This connection has received its initial storage state; storage
    /// ops may flush.
    pub storage_synced: bool,
}

pub(crate) struct RoomInner {
    id: String,
    state: Mutex<RoomState>,
    pub(crate) hub: Hub,
    control: mpsc::UnboundedSender<Control>,
    outbox_notify: Notify,
    status_watch: watch::Sender<ConnectionStatus>,
    storage_ready: watch::Sender<bool>,
}

/// Handle to an entered room. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Room {
    pub(crate) inner: Arc<RoomInner>,
}

impl Room {
    pub(crate) fn create(id: String, config: ConnectionConfig, connect: bool) -> Room {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RoomInner {
            id,
            state: Mutex::new(RoomState {
                doc: None,
                ids: IdFactory::new(0),
                presence: PresenceState::default(),
                outbox: Outbox::default(),
                history: History::default(),
                unacked: Vec::new(),
                unacked_ids: HashSet::new(),
                status: ConnectionStatus::Closed,
                actor: None,
                storage_synced: false,
            }),
            hub: Hub::new(),
            control: control_tx,
            outbox_notify: Notify::new(),
            status_watch: watch::channel(ConnectionStatus::Closed).0,
            storage_ready: watch::channel(false).0,
        });
        tokio::spawn(connection::run(
            inner.clone(),
            config,
            control_rx,
            connect,
        ));
        Room { inner }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_watch.borrow()
    }

    /// Start (or restart, after `failed`) the connection.
    pub fn connect(&self) {
        self.inner.signal(Control::Connect);
    }

    // ── presence ────────────────────────────────────────────────────

    /// Snapshot of the local presence record.
    pub fn presence(&self) -> JsonObject {
        self.inner.state().presence.mine().clone()
    }

    /// Snapshot of every other connected actor.
    pub fn others(&self) -> Vec<Other> {
        self.inner.state().presence.others()
    }

    /// Shallow-merge `patch` into the local presence. `None` values
    /// delete keys. Applies synchronously and schedules a flush.
    pub fn update_presence(&self, patch: PresencePatch, options: PresenceOptions) {
        if patch.is_empty() {
            return;
        }
        {
            let mut state = self.inner.state();
            let inverse = state.presence.apply_local(&patch);
            state.outbox.queue_presence(&patch);
            if options.add_to_history {
                state.history.clear_redo();
                state.history.record(vec![HistoryOp::Presence(inverse)]);
            }
        }
        self.inner.outbox_notify.notify_one();
        self.inner.emit_my_presence();
    }

    /// Fire-and-forget event to the other connected actors.
    pub fn broadcast_event(&self, event: Value) {
        self.inner.state().outbox.queue_event(event);
        self.inner.outbox_notify.notify_one();
    }

    // ── storage ─────────────────────────────────────────────────────

    /// The storage root, if the initial fetch has completed.
    pub fn try_root(&self) -> Option<LiveObject> {
        let root = self.inner.state().doc.as_ref().map(|doc| doc.root())?;
        Some(LiveObject::attached(self.clone(), root))
    }

    /// The storage root, waiting for the initial fetch if necessary.
    /// Fails if the connection fails permanently first.
    pub async fn root(&self) -> Result<LiveObject, RoomError> {
        let mut ready = self.inner.storage_ready.subscribe();
        let mut status = self.inner.status_watch.subscribe();
        loop {
            if *ready.borrow() {
                if let Some(root) = self.try_root() {
                    return Ok(root);
                }
            }
            if *status.borrow() == ConnectionStatus::Failed {
                return Err(RoomError::ConnectionFailed);
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return Err(RoomError::ConnectionFailed);
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(RoomError::ConnectionFailed);
                    }
                }
            }
        }
    }

    // ── history ─────────────────────────────────────────────────────

    pub fn can_undo(&self) -> bool {
        self.inner.state().history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.inner.state().history.can_redo()
    }

    /// Revert the most recent local mutation batch. Returns `false` when
    /// there is nothing to undo.
    pub fn undo(&self) -> Result<bool, HistoryError> {
        self.inner.replay_history(|history| history.pop_undo(), |history, entry| {
            history.push_redo(entry)
        })
    }

    /// Re-apply the most recently undone batch.
    pub fn redo(&self) -> Result<bool, HistoryError> {
        self.inner.replay_history(|history| history.pop_redo(), |history, entry| {
            history.push_undo(entry)
        })
    }

    /// Stop recording individual undo entries; mutations made while
    /// paused coalesce into one entry pushed by `resume_history`.
    pub fn pause_history(&self) {
        self.inner.state().history.pause();
    }

    pub fn resume_history(&self) {
        self.inner.state().history.resume();
    }

    // ── subscriptions ───────────────────────────────────────────────

    pub fn subscribe_status(
        &self,
        callback: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.hub.status.subscribe(move |status| callback(*status))
    }

    pub fn subscribe_error(
        &self,
        callback: impl Fn(&RoomError) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.hub.error.subscribe(callback)
    }

    pub fn subscribe_my_presence(
        &self,
        callback: impl Fn(&JsonObject) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.hub.my_presence.subscribe(callback)
    }

    pub fn subscribe_others(
        &self,
        callback: impl Fn(&OthersEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.hub.others.subscribe(callback)
    }

    pub fn subscribe_event(
        &self,
        callback: impl Fn(&RoomEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.hub.event.subscribe(callback)
    }

    /// Batched storage subscription: one callback per mutation batch,
    /// with the merged per-node deltas.
    pub fn subscribe_storage(
        &self,
        callback: impl Fn(&[StorageUpdate]) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .hub
            .storage
            .subscribe(move |updates| callback(updates))
    }

    pub(crate) fn shutdown(&self) {
        self.inner.signal(Control::Shutdown);
    }
}

impl RoomInner {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn signal(&self, control: Control) {
        let _ = self.control.send(control);
    }

    pub(crate) async fn outbox_notified(&self) {
        self.outbox_notify.notified().await;
    }

    pub(crate) fn emit_error(&self, error: RoomError) {
        self.hub.error.emit(&error);
    }

    fn emit_my_presence(&self) {
        let mine = self.state().presence.mine().clone();
        self.hub.my_presence.emit(&mine);
    }

    fn emit_storage_updates(&self, updates: &Vec<StorageUpdate>) {
        if updates.is_empty() {
            return;
        }
        self.hub.storage.emit(updates);
        for update in updates {
            self.hub.nodes.emit(update);
        }
    }

    // ── called by the connection task ───────────────────────────────

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut state = self.state();
            if state.status == status {
                false
            } else {
                state.status = status;
                if status != ConnectionStatus::Open {
                    state.storage_synced = false;
                }
                true
            }
        };
        if changed {
            log::debug!("room {}: status {status}", self.id);
            let _ = self.status_watch.send(status);
            self.hub.status.emit(&status);
        }
    }

    /// A session token was issued: adopt the (possibly fresh) actor id.
    /// The id counter survives, so pre-reconnect ids never collide.
    pub(crate) fn prepare_connection(&self, actor: ActorId) {
        let mut state = self.state();
        state.ids.set_actor(actor);
        state.actor = Some(actor);
    }

    /// Socket open and `ROOM_STATE` received: announce our full presence
    /// and let buffered frames flush.
    pub(crate) fn on_open(&self) {
        self.state().outbox.mark_full_presence();
        self.set_status(ConnectionStatus::Open);
        self.outbox_notify.notify_one();
    }

    /// Whether the outbox holds anything that may flush right now.
    pub(crate) fn flushable(&self) -> bool {
        let state = self.state();
        state.status == ConnectionStatus::Open
            && state.outbox.has_flushable(state.storage_synced)
    }

    /// Drain the outbox into encoded frames, moving sent ops into the
    /// unacked buffer.
    pub(crate) fn take_outgoing_frames(&self) -> Vec<String> {
        let mut state = self.state();
        if state.status != ConnectionStatus::Open {
            return Vec::new();
        }
        let include_storage = state.storage_synced;
        let mine = state.presence.mine().clone();
        let (messages, sent_ops) = state.outbox.take_frames(&mine, include_storage);
        for op in sent_ops {
            state.unacked_ids.insert(op.op_id());
            state.unacked.push(op);
        }
        messages
            .into_iter()
            .filter_map(|message| match message.encode() {
                Ok(frame) => Some(frame),
                Err(err) => {
                    log::error!("room {}: dropping unencodable frame: {err}", self.id);
                    None
                }
            })
            .collect()
    }

    /// Process one inbound text frame. Returns whether a `ROOM_STATE`
    /// message was seen (the open trigger).
    pub(crate) fn handle_server_frame(&self, text: &str) -> Result<bool, ProtocolError> {
        let messages = ServerMessage::decode_frame(text)?;
        let mut saw_room_state = false;
        for message in messages {
            if self.handle_server_message(message)? {
                saw_room_state = true;
            }
        }
        Ok(saw_room_state)
    }

    fn handle_server_message(&self, message: ServerMessage) -> Result<bool, ProtocolError> {
        match message {
            ServerMessage::UpdatePresence {
                actor,
                data,
                target_actor,
            } => {
                {
                    let mut state = self.state();
                    if let Some(target) = target_actor {
                        if state.actor != Some(target) {
                            return Ok(false);
                        }
                    }
                    if state.actor == Some(actor) {
                        return Ok(false);
                    }
                    state.presence.merge_remote(actor, &data);
                }
                self.hub.others.emit(&OthersEvent::Updated { actor });
                Ok(false)
            }
            ServerMessage::UserJoined {
                actor,
                info,
                scopes,
            } => {
                {
                    let mut state = self.state();
                    if state.actor == Some(actor) {
                        return Ok(false);
                    }
                    state.presence.user_joined(actor, info, scopes);
                    // a late joiner must see our entire presence, not
                    // only subsequent diffs
                    state.outbox.queue_resync(actor);
                }
                self.outbox_notify.notify_one();
                self.hub.others.emit(&OthersEvent::Joined { actor });
                Ok(false)
            }
            ServerMessage::UserLeft { actor } => {
                let known = self.state().presence.user_left(actor);
                if known {
                    self.hub.others.emit(&OthersEvent::Left { actor });
                }
                Ok(false)
            }
            ServerMessage::BroadcastEvent { actor, event } => {
                {
                    let state = self.state();
                    if state.actor == Some(actor) {
                        return Ok(false);
                    }
                }
                self.hub.event.emit(&RoomEvent {
                    actor,
                    payload: event,
                });
                Ok(false)
            }
            ServerMessage::RoomState { mut users } => {
                {
                    let mut state = self.state();
                    if let Some(me) = state.actor {
                        users.remove(&me);
                    }
                    state.presence.reset_others(&users);
                }
                self.hub.others.emit(&OthersEvent::Reset);
                Ok(true)
            }
            ServerMessage::InitialStorage { items } => {
                self.on_initial_storage(items)?;
                Ok(false)
            }
            ServerMessage::UpdateStorage { ops } => {
                self.on_remote_ops(ops)?;
                Ok(false)
            }
        }
    }

    /// Replace the local tree with the server's state, then rebase every
    /// op the server has not acknowledged onto it and queue them for
    /// (re)send.
    fn on_initial_storage(
        &self,
        items: Vec<(huddle_store::NodeId, huddle_store::SerializedNode)>,
    ) -> Result<(), ProtocolError> {
        let updates = {
            let mut state = self.state();
            let state = &mut *state;
            let mut doc = StorageDoc::from_items(items)
                .map_err(|e| ProtocolError::Storage(e.to_string()))?;

            let mut pending: Vec<Op> = state.unacked.drain(..).collect();
            state.unacked_ids.clear();
            pending.extend(state.outbox.take_ops());

            let mut updates = vec![StorageUpdate::RootReplaced { id: doc.root() }];
            let mut replayed = Vec::new();
            for op in pending {
                match doc.apply(&op, OpSource::Local, &mut state.ids) {
                    Ok(applied) => {
                        updates.extend(applied.update);
                        replayed.push(op);
                    }
                    Err(err) => {
                        log::warn!(
                            "room {}: dropping buffered op after refetch: {err}",
                            self.id
                        );
                    }
                }
            }
            if !replayed.is_empty() {
                log::info!(
                    "room {}: replaying {} buffered ops",
                    self.id,
                    replayed.len()
                );
                state.outbox.queue_ops(replayed);
            }
            state.doc = Some(doc);
            state.storage_synced = true;
            merge_updates(updates)
        };
        let _ = self.storage_ready.send(true);
        self.outbox_notify.notify_one();
        self.emit_storage_updates(&updates);
        Ok(())
    }

    /// Remote ops in server order; echoes of our own ops are acks.
    fn on_remote_ops(&self, ops: Vec<Op>) -> Result<(), ProtocolError> {
        let (updates, violation) = {
            let mut state = self.state();
            let state = &mut *state;
            let mut updates = Vec::new();
            let mut violation: Option<String> = None;
            for op in ops {
                let op_id = op.op_id();
                if state.unacked_ids.remove(&op_id) {
                    state.unacked.retain(|pending| pending.op_id() != op_id);
                    continue;
                }
                let Some(doc) = state.doc.as_mut() else {
                    log::debug!(
                        "room {}: remote op before initial storage, ignoring",
                        self.id
                    );
                    continue;
                };
                match doc.apply(&op, OpSource::Remote, &mut state.ids) {
                    Ok(applied) => updates.extend(applied.update),
                    Err(err) => {
                        log::warn!("room {}: bad remote op: {err}", self.id);
                        violation.get_or_insert_with(|| err.to_string());
                    }
                }
            }
            (merge_updates(updates), violation)
        };
        self.emit_storage_updates(&updates);
        match violation {
            Some(reason) => Err(ProtocolError::Storage(reason)),
            None => Ok(()),
        }
    }

    // ── mutation pipeline ───────────────────────────────────────────

    /// Apply one user-level storage mutation batch: build ops against the
    /// current tree, apply them locally, record the inverse entry, queue
    /// for flush, and notify subscribers.
    pub(crate) fn mutate_storage<F>(&self, build: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut StorageDoc, &mut IdFactory) -> Result<Vec<Op>, StorageError>,
    {
        let updates = {
            let mut state = self.state();
            let state = &mut *state;
            let doc = state.doc.as_mut().ok_or(StorageError::NotLoaded)?;
            let ops = build(&mut *doc, &mut state.ids)?;
            if ops.is_empty() {
                return Ok(());
            }
            let mut entry: HistoryEntry = Vec::new();
            let mut updates = Vec::new();
            for op in &ops {
                let applied = doc.apply(op, OpSource::Local, &mut state.ids)?;
                updates.extend(applied.update);
                let inverse: Vec<HistoryOp> = applied
                    .inverse
                    .into_iter()
                    .map(HistoryOp::Storage)
                    .collect();
                // newest inverses first, so the entry unwinds in order
                entry.splice(0..0, inverse);
            }
            state.history.clear_redo();
            state.history.record(entry);
            state.outbox.queue_ops(ops);
            merge_updates(updates)
        };
        self.outbox_notify.notify_one();
        self.emit_storage_updates(&updates);
        Ok(())
    }

    /// Shared body of undo/redo: pop an entry from one stack, apply it
    /// as-if-local, push the freshly captured inverse onto the other.
    fn replay_history(
        &self,
        pop: impl FnOnce(&mut History) -> Result<Option<HistoryEntry>, HistoryError>,
        push: impl FnOnce(&mut History, HistoryEntry),
    ) -> Result<bool, HistoryError> {
        let (updates, presence_changed) = {
            let mut state = self.state();
            let state = &mut *state;
            let Some(entry) = pop(&mut state.history)? else {
                return Ok(false);
            };
            let mut opposite: HistoryEntry = Vec::new();
            let mut updates = Vec::new();
            let mut ops_out = Vec::new();
            let mut presence_changed = false;
            for item in entry {
                match item {
                    HistoryOp::Storage(op) => {
                        let Some(doc) = state.doc.as_mut() else {
                            log::warn!("room {}: history op without storage", self.id);
                            continue;
                        };
                        match doc.apply(&op, OpSource::Local, &mut state.ids) {
                            Ok(applied) => {
                                updates.extend(applied.update);
                                let inverse: Vec<HistoryOp> = applied
                                    .inverse
                                    .into_iter()
                                    .map(HistoryOp::Storage)
                                    .collect();
                                opposite.splice(0..0, inverse);
                                ops_out.push(op);
                            }
                            Err(err) => {
                                log::warn!("room {}: skipping stale history op: {err}", self.id)
                            }
                        }
                    }
                    HistoryOp::Presence(patch) => {
                        let inverse = state.presence.apply_local(&patch);
                        state.outbox.queue_presence(&patch);
                        opposite.splice(0..0, vec![HistoryOp::Presence(inverse)]);
                        presence_changed = true;
                    }
                }
            }
            push(&mut state.history, opposite);
            state.outbox.queue_ops(ops_out);
            (merge_updates(updates), presence_changed)
        };
        self.outbox_notify.notify_one();
        self.emit_storage_updates(&updates);
        if presence_changed {
            self.emit_my_presence();
        }
        Ok(true)
    }
}

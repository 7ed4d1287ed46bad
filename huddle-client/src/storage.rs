//! Live handles over the shared document.
//!
//! `LiveObject`, `LiveMap` and `LiveList` are cheap references into a
//! room's tree; reads snapshot under the room lock, mutations build ops
//! and run them through the room's apply pipeline synchronously. Detached
//! subtrees are described with [`LiveValue`] and materialized into nodes
//! when inserted. Registers never appear in the API: plain JSON values
//! read back as plain JSON values.

use serde_json::Value;

use huddle_store::{
    position, IdFactory, JsonObject, ListKey, NodeId, NodeKind, ObjectEntry, Op, Payload,
    StorageDoc, StorageError, StorageUpdate,
};

use crate::events::Subscription;
use crate::room::Room;

/// A detached value, built locally and attached by `set`/`insert`/`push`.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveValue {
    /// A plain JSON leaf. Stored inline in objects, wrapped in a
    /// register inside maps and lists.
    Json(Value),
    Object(Vec<(String, LiveValue)>),
    Map(Vec<(String, LiveValue)>),
    List(Vec<LiveValue>),
}

impl LiveValue {
    pub fn object(entries: impl IntoIterator<Item = (&'static str, LiveValue)>) -> Self {
        LiveValue::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn map(entries: impl IntoIterator<Item = (&'static str, LiveValue)>) -> Self {
        LiveValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn list(items: impl IntoIterator<Item = LiveValue>) -> Self {
        LiveValue::List(items.into_iter().collect())
    }
}

macro_rules! live_value_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for LiveValue {
            fn from(value: $ty) -> Self {
                LiveValue::Json(Value::from(value))
            }
        })*
    };
}

live_value_from!(Value, bool, i32, i64, u32, u64, f64, &str, String);

/// What a read returns: a plain value or a handle to a live container.
#[derive(Clone)]
pub enum StorageRef {
    Json(Value),
    Object(LiveObject),
    Map(LiveMap),
    List(LiveList),
}

impl StorageRef {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            StorageRef::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&LiveObject> {
        match self {
            StorageRef::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&LiveMap> {
        match self {
            StorageRef::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&LiveList> {
        match self {
            StorageRef::List(list) => Some(list),
            _ => None,
        }
    }
}

fn wrap(room: &Room, doc: &StorageDoc, id: NodeId) -> Option<StorageRef> {
    let node = doc.node(id)?;
    Some(match &node.payload {
        Payload::Object { .. } => StorageRef::Object(LiveObject::attached(room.clone(), id)),
        Payload::Map { .. } => StorageRef::Map(LiveMap {
            room: room.clone(),
            id,
        }),
        Payload::List { .. } => StorageRef::List(LiveList {
            room: room.clone(),
            id,
        }),
        // registers are transparent
        Payload::Register { value } => StorageRef::Json(value.clone()),
    })
}

/// Materialize a detached [`LiveValue`] into create ops, parent-first.
/// Plain JSON at this level becomes a register (object fields take the
/// inline path in `LiveObject::set` instead).
fn build_create_ops(
    ids: &mut IdFactory,
    parent_id: NodeId,
    parent_key: String,
    value: LiveValue,
    ops: &mut Vec<Op>,
) {
    match value {
        LiveValue::Json(data) => {
            ops.push(Op::CreateRegister {
                op_id: ids.op_id(),
                id: ids.node_id(),
                parent_id,
                parent_key,
                data,
            });
        }
        LiveValue::Object(entries) => {
            let id = ids.node_id();
            let mut plain = JsonObject::new();
            let mut live = Vec::new();
            for (key, entry) in entries {
                match entry {
                    LiveValue::Json(v) => {
                        plain.insert(key, v);
                    }
                    other => live.push((key, other)),
                }
            }
            ops.push(Op::CreateObject {
                op_id: ids.op_id(),
                id,
                parent_id,
                parent_key,
                data: plain,
            });
            for (key, entry) in live {
                build_create_ops(ids, id, key, entry, ops);
            }
        }
        LiveValue::Map(entries) => {
            let id = ids.node_id();
            ops.push(Op::CreateMap {
                op_id: ids.op_id(),
                id,
                parent_id,
                parent_key,
            });
            for (key, entry) in entries {
                build_create_ops(ids, id, key, entry, ops);
            }
        }
        LiveValue::List(items) => {
            let id = ids.node_id();
            ops.push(Op::CreateList {
                op_id: ids.op_id(),
                id,
                parent_id,
                parent_key,
            });
            let mut last: Option<String> = None;
            for item in items {
                let pos = match &last {
                    None => position::first(),
                    Some(prev) => position::after(prev),
                };
                last = Some(pos.clone());
                build_create_ops(ids, id, pos, item, ops);
            }
        }
    }
}

fn expect_kind(doc: &StorageDoc, id: NodeId, expected: NodeKind) -> Result<(), StorageError> {
    let node = doc.node(id).ok_or(StorageError::Detached(id))?;
    if node.kind() != expected {
        return Err(StorageError::WrongKind {
            id,
            expected,
            actual: node.kind(),
        });
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// LiveObject
// ───────────────────────────────────────────────────────────────────

/// Handle to an attached object node.
#[derive(Clone)]
pub struct LiveObject {
    room: Room,
    id: NodeId,
}

impl LiveObject {
    pub(crate) fn attached(room: Room, id: NodeId) -> Self {
        Self { room, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn get(&self, key: &str) -> Option<StorageRef> {
        let state = self.room.inner.state();
        let doc = state.doc.as_ref()?;
        let node = doc.node(self.id)?;
        let Payload::Object { data } = &node.payload else {
            return None;
        };
        match data.get(key)? {
            ObjectEntry::Value(value) => Some(StorageRef::Json(value.clone())),
            ObjectEntry::Node(child) => wrap(&self.room, doc, *child),
        }
    }

    /// Set a field. Plain JSON values become LWW fields; live values
    /// attach a new subtree (displacing any node already under the key).
    pub fn set(&self, key: &str, value: impl Into<LiveValue>) -> Result<(), StorageError> {
        let value = value.into();
        let id = self.id;
        let key = key.to_string();
        self.room.inner.mutate_storage(move |doc, ids| {
            expect_kind(doc, id, NodeKind::Object)?;
            let mut ops = Vec::new();
            match value {
                LiveValue::Json(v) => {
                    let mut data = JsonObject::new();
                    data.insert(key, v);
                    ops.push(Op::UpdateObject {
                        op_id: ids.op_id(),
                        id,
                        data,
                        deleted: Vec::new(),
                    });
                }
                live => {
                    let existing = match &doc.node(id).ok_or(StorageError::Detached(id))?.payload
                    {
                        Payload::Object { data } => match data.get(&key) {
                            Some(ObjectEntry::Node(child)) => Some(*child),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(child) = existing {
                        ops.push(Op::DeleteCrdt {
                            op_id: ids.op_id(),
                            id: child,
                        });
                    }
                    build_create_ops(ids, id, key, live, &mut ops);
                }
            }
            Ok(ops)
        })
    }

    /// Remove a field (plain or live). No-op when the key is absent.
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let id = self.id;
        let key = key.to_string();
        self.room.inner.mutate_storage(move |doc, ids| {
            expect_kind(doc, id, NodeKind::Object)?;
            let node = doc.node(id).ok_or(StorageError::Detached(id))?;
            let Payload::Object { data } = &node.payload else {
                return Ok(Vec::new());
            };
            Ok(match data.get(&key) {
                None => Vec::new(),
                Some(ObjectEntry::Value(_)) => vec![Op::UpdateObject {
                    op_id: ids.op_id(),
                    id,
                    data: JsonObject::new(),
                    deleted: vec![key],
                }],
                Some(ObjectEntry::Node(child)) => vec![Op::DeleteCrdt {
                    op_id: ids.op_id(),
                    id: *child,
                }],
            })
        })
    }

    /// Deep plain-JSON snapshot of this object.
    pub fn to_json(&self) -> Result<Value, StorageError> {
        let state = self.room.inner.state();
        let doc = state.doc.as_ref().ok_or(StorageError::NotLoaded)?;
        doc.to_json(self.id).ok_or(StorageError::Detached(self.id))
    }

    /// Notifications for changes to this node only.
    pub fn subscribe(
        &self,
        callback: impl Fn(&StorageUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.room.inner.hub.nodes.subscribe(self.id, callback)
    }
}

// ───────────────────────────────────────────────────────────────────
// LiveMap
// ───────────────────────────────────────────────────────────────────

/// Handle to an attached map node. Values are always nodes; plain JSON
/// is wrapped in (and unwrapped from) registers.
#[derive(Clone)]
pub struct LiveMap {
    room: Room,
    id: NodeId,
}

impl LiveMap {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn get(&self, key: &str) -> Option<StorageRef> {
        let state = self.room.inner.state();
        let doc = state.doc.as_ref()?;
        let node = doc.node(self.id)?;
        let Payload::Map { entries } = &node.payload else {
            return None;
        };
        wrap(&self.room, doc, *entries.get(key)?)
    }

    pub fn len(&self) -> usize {
        let state = self.room.inner.state();
        let Some(doc) = state.doc.as_ref() else {
            return 0;
        };
        match doc.node(self.id).map(|n| &n.payload) {
            Some(Payload::Map { entries }) => entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let state = self.room.inner.state();
        let Some(doc) = state.doc.as_ref() else {
            return Vec::new();
        };
        match doc.node(self.id).map(|n| &n.payload) {
            Some(Payload::Map { entries }) => entries.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Set an entry. A register value is never mutated in place: the old
    /// occupant is deleted and a fresh node created in the same batch.
    pub fn set(&self, key: &str, value: impl Into<LiveValue>) -> Result<(), StorageError> {
        let value = value.into();
        let id = self.id;
        let key = key.to_string();
        self.room.inner.mutate_storage(move |doc, ids| {
            expect_kind(doc, id, NodeKind::Map)?;
            let mut ops = Vec::new();
            let existing = match &doc.node(id).ok_or(StorageError::Detached(id))?.payload {
                Payload::Map { entries } => entries.get(&key).copied(),
                _ => None,
            };
            if let Some(child) = existing {
                ops.push(Op::DeleteCrdt {
                    op_id: ids.op_id(),
                    id: child,
                });
            }
            build_create_ops(ids, id, key, value, &mut ops);
            Ok(ops)
        })
    }

    /// Remove an entry; returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let id = self.id;
        let key = key.to_string();
        let mut existed = false;
        self.room.inner.mutate_storage(|doc, ids| {
            expect_kind(doc, id, NodeKind::Map)?;
            let existing = match &doc.node(id).ok_or(StorageError::Detached(id))?.payload {
                Payload::Map { entries } => entries.get(&key).copied(),
                _ => None,
            };
            Ok(match existing {
                None => Vec::new(),
                Some(child) => {
                    existed = true;
                    vec![Op::DeleteCrdt {
                        op_id: ids.op_id(),
                        id: child,
                    }]
                }
            })
        })?;
        Ok(existed)
    }

    pub fn to_json(&self) -> Result<Value, StorageError> {
        let state = self.room.inner.state();
        let doc = state.doc.as_ref().ok_or(StorageError::NotLoaded)?;
        doc.to_json(self.id).ok_or(StorageError::Detached(self.id))
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&StorageUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.room.inner.hub.nodes.subscribe(self.id, callback)
    }
}

// ───────────────────────────────────────────────────────────────────
// LiveList
// ───────────────────────────────────────────────────────────────────

/// Handle to an attached list node, ordered by fractional positions.
#[derive(Clone)]
pub struct LiveList {
    room: Room,
    id: NodeId,
}

impl LiveList {
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn order(doc: &StorageDoc, id: NodeId) -> Result<Vec<(ListKey, NodeId)>, StorageError> {
        expect_kind(doc, id, NodeKind::List)?;
        match &doc.node(id).ok_or(StorageError::Detached(id))?.payload {
            Payload::List { children } => {
                Ok(children.iter().map(|(k, v)| (k.clone(), *v)).collect())
            }
            _ => Err(StorageError::Detached(id)),
        }
    }

    pub fn len(&self) -> usize {
        let state = self.room.inner.state();
        let Some(doc) = state.doc.as_ref() else {
            return 0;
        };
        match doc.node(self.id).map(|n| &n.payload) {
            Some(Payload::List { children }) => children.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<StorageRef> {
        let state = self.room.inner.state();
        let doc = state.doc.as_ref()?;
        let node = doc.node(self.id)?;
        let Payload::List { children } = &node.payload else {
            return None;
        };
        let child = children.values().nth(index)?;
        wrap(&self.room, doc, *child)
    }

    pub fn push(&self, value: impl Into<LiveValue>) -> Result<(), StorageError> {
        self.insert_at(None, value.into())
    }

    /// Insert before the element currently at `index` (`index == len`
    /// appends).
    pub fn insert(&self, index: usize, value: impl Into<LiveValue>) -> Result<(), StorageError> {
        self.insert_at(Some(index), value.into())
    }

    fn insert_at(&self, index: Option<usize>, value: LiveValue) -> Result<(), StorageError> {
        let id = self.id;
        self.room.inner.mutate_storage(move |doc, ids| {
            let order = Self::order(doc, id)?;
            let len = order.len();
            let index = index.unwrap_or(len);
            if index > len {
                return Err(StorageError::IndexOutOfBounds { index, len });
            }
            let lo = index
                .checked_sub(1)
                .and_then(|i| order.get(i))
                .map(|(key, _)| key.position.clone());
            let hi = order.get(index).map(|(key, _)| key.position.clone());
            let pos = position::between(lo.as_deref(), hi.as_deref());
            let mut ops = Vec::new();
            build_create_ops(ids, id, pos, value, &mut ops);
            Ok(ops)
        })
    }

    /// Re-position the element at `from` so it lands at `to`.
    pub fn move_item(&self, from: usize, to: usize) -> Result<(), StorageError> {
        let id = self.id;
        self.room.inner.mutate_storage(move |doc, ids| {
            let order = Self::order(doc, id)?;
            let len = order.len();
            if from >= len {
                return Err(StorageError::IndexOutOfBounds { index: from, len });
            }
            if to >= len {
                return Err(StorageError::IndexOutOfBounds { index: to, len });
            }
            if from == to {
                return Ok(Vec::new());
            }
            let moving = order[from].1;
            let rest: Vec<&(ListKey, NodeId)> = order
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != from)
                .map(|(_, entry)| entry)
                .collect();
            let lo = to
                .checked_sub(1)
                .and_then(|i| rest.get(i))
                .map(|(key, _)| key.position.clone());
            let hi = rest.get(to).map(|(key, _)| key.position.clone());
            let pos = position::between(lo.as_deref(), hi.as_deref());
            Ok(vec![Op::SetParentKey {
                op_id: ids.op_id(),
                id: moving,
                parent_key: pos,
            }])
        })
    }

    /// Delete the element at `index`.
    pub fn delete(&self, index: usize) -> Result<(), StorageError> {
        let id = self.id;
        self.room.inner.mutate_storage(move |doc, ids| {
            let order = Self::order(doc, id)?;
            let len = order.len();
            let Some((_, child)) = order.get(index) else {
                return Err(StorageError::IndexOutOfBounds { index, len });
            };
            Ok(vec![Op::DeleteCrdt {
                op_id: ids.op_id(),
                id: *child,
            }])
        })
    }

    pub fn to_json(&self) -> Result<Value, StorageError> {
        let state = self.room.inner.state();
        let doc = state.doc.as_ref().ok_or(StorageError::NotLoaded)?;
        doc.to_json(self.id).ok_or(StorageError::Detached(self.id))
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&StorageUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.room.inner.hub.nodes.subscribe(self.id, callback)
    }
}

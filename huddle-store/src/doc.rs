//! The storage document: id-indexed node store and op dispatch.
//!
//! All tree state lives in one `id → node` index; parent links are ids,
//! not owning references, so detaching a subtree is "remove the ids from
//! the index". `apply` is the single mutation entry point: it validates
//! the op against the current tree, mutates, and reports both the minimal
//! change delta (for subscribers) and — for locally sourced ops — the
//! inverse ops that undo the mutation.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::StorageError;
use crate::id::{IdFactory, NodeId};
use crate::node::{ListKey, Node, NodeKind, ObjectEntry, Parent, Payload, SerializedNode};
use crate::op::{JsonObject, Op};

/// Where an op came from. Local applications synthesize inverse ops;
/// remote applications do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    Local,
    Remote,
}

/// Minimal description of what one `apply` changed.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageUpdate {
    Object {
        id: NodeId,
        updated: Vec<String>,
        deleted: Vec<String>,
    },
    Map {
        id: NodeId,
        updated: Vec<String>,
        deleted: Vec<String>,
    },
    List {
        id: NodeId,
        changes: Vec<ListChange>,
    },
    /// The whole tree was replaced by an initial storage fetch.
    RootReplaced { id: NodeId },
}

impl StorageUpdate {
    /// The node the delta is reported on.
    pub fn node(&self) -> NodeId {
        match self {
            StorageUpdate::Object { id, .. }
            | StorageUpdate::Map { id, .. }
            | StorageUpdate::List { id, .. }
            | StorageUpdate::RootReplaced { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListChange {
    Insert { index: usize, child: NodeId },
    Move { index: usize, child: NodeId },
    Delete { index: usize, child: NodeId },
}

/// Result of one `apply`.
#[derive(Debug, Default)]
pub struct Applied {
    pub update: Option<StorageUpdate>,
    /// Ops that, applied in order, undo this op. Empty for remote ops.
    pub inverse: Vec<Op>,
}

/// Merge per-op deltas from one mutation batch into at most one delta per
/// node, preserving first-touch order.
pub fn merge_updates(updates: Vec<StorageUpdate>) -> Vec<StorageUpdate> {
    let mut out: Vec<StorageUpdate> = Vec::new();
    for update in updates {
        let merged = out.iter_mut().find_map(|existing| match (existing, &update) {
            (
                StorageUpdate::Object { id, updated, deleted },
                StorageUpdate::Object { id: id2, updated: u2, deleted: d2 },
            ) if *id == *id2 => {
                for k in u2 {
                    if !updated.contains(k) {
                        updated.push(k.clone());
                    }
                    deleted.retain(|d| d != k);
                }
                for k in d2 {
                    if !deleted.contains(k) {
                        deleted.push(k.clone());
                    }
                    updated.retain(|u| u != k);
                }
                Some(())
            }
            (
                StorageUpdate::Map { id, updated, deleted },
                StorageUpdate::Map { id: id2, updated: u2, deleted: d2 },
            ) if *id == *id2 => {
                for k in u2 {
                    if !updated.contains(k) {
                        updated.push(k.clone());
                    }
                    deleted.retain(|d| d != k);
                }
                for k in d2 {
                    if !deleted.contains(k) {
                        deleted.push(k.clone());
                    }
                    updated.retain(|u| u != k);
                }
                Some(())
            }
            (
                StorageUpdate::List { id, changes },
                StorageUpdate::List { id: id2, changes: c2 },
            ) if *id == *id2 => {
                changes.extend(c2.iter().cloned());
                Some(())
            }
            _ => None,
        });
        if merged.is_none() {
            out.push(update);
        }
    }
    out
}

/// The CRDT tree.
#[derive(Debug, Clone)]
pub struct StorageDoc {
    nodes: FxHashMap<NodeId, Node>,
    root: NodeId,
}

impl Default for StorageDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageDoc {
    /// An empty document: a bare root object.
    pub fn new() -> Self {
        let mut nodes = FxHashMap::default();
        nodes.insert(
            NodeId::ROOT,
            Node {
                id: NodeId::ROOT,
                parent: None,
                payload: Payload::empty_object(),
            },
        );
        Self {
            nodes,
            root: NodeId::ROOT,
        }
    }

    /// Build a document from an `INITIAL_STORAGE_STATE` payload.
    pub fn from_items(items: Vec<(NodeId, SerializedNode)>) -> Result<Self, StorageError> {
        let mut nodes: FxHashMap<NodeId, Node> = FxHashMap::default();
        let mut root = None;

        for (id, serialized) in items {
            if nodes.contains_key(&id) {
                return Err(StorageError::DuplicateNode(id));
            }
            let parent = serialized.parent();
            if parent.is_none() {
                if !matches!(serialized, SerializedNode::Object { .. }) {
                    return Err(StorageError::MalformedTree(format!(
                        "parentless node {id} is not an object"
                    )));
                }
                if !id.is_root() {
                    return Err(StorageError::MalformedTree(format!(
                        "parentless node {id} is not the reserved root id"
                    )));
                }
                if root.replace(id).is_some() {
                    return Err(StorageError::MalformedTree("multiple roots".into()));
                }
            }
            let payload = match serialized {
                SerializedNode::Object { data, .. } => Payload::Object {
                    data: data
                        .into_iter()
                        .map(|(k, v)| (k, ObjectEntry::Value(v)))
                        .collect(),
                },
                SerializedNode::Map { .. } => Payload::Map {
                    entries: BTreeMap::new(),
                },
                SerializedNode::List { .. } => Payload::List {
                    children: BTreeMap::new(),
                },
                SerializedNode::Register { data, .. } => Payload::Register { value: data },
            };
            nodes.insert(id, Node { id, parent, payload });
        }

        let root = root.ok_or_else(|| StorageError::MalformedTree("missing root".into()))?;

        // Second pass: register every child in its parent's payload.
        let ids: Vec<NodeId> = nodes.keys().copied().collect();
        for id in ids {
            let Some(parent) = nodes.get(&id).and_then(|n| n.parent.clone()) else {
                continue;
            };
            let parent_node = nodes
                .get_mut(&parent.id)
                .ok_or(StorageError::MissingParent(parent.id))?;
            match &mut parent_node.payload {
                Payload::Object { data } => {
                    if data
                        .insert(parent.key.clone(), ObjectEntry::Node(id))
                        .is_some()
                    {
                        return Err(StorageError::MalformedTree(format!(
                            "duplicate object key {:?} under {}",
                            parent.key, parent.id
                        )));
                    }
                }
                Payload::Map { entries } => {
                    if entries.insert(parent.key.clone(), id).is_some() {
                        return Err(StorageError::MalformedTree(format!(
                            "duplicate map key {:?} under {}",
                            parent.key, parent.id
                        )));
                    }
                }
                Payload::List { children } => {
                    let key = ListKey::new(parent.key.clone(), id.actor);
                    if children.insert(key, id).is_some() {
                        return Err(StorageError::DuplicatePosition(parent.key));
                    }
                }
                Payload::Register { .. } => {
                    return Err(StorageError::NotAContainer(parent.id));
                }
            }
        }

        Ok(Self { nodes, root })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Apply one op. On success the returned [`Applied`] carries the
    /// change delta and, for local ops, the inverse ops. On error the
    /// document is unchanged.
    pub fn apply(
        &mut self,
        op: &Op,
        source: OpSource,
        ids: &mut IdFactory,
    ) -> Result<Applied, StorageError> {
        match op.clone() {
            Op::CreateObject {
                id,
                parent_id,
                parent_key,
                data,
                ..
            } => self.apply_create(
                id,
                parent_id,
                parent_key,
                Payload::Object {
                    data: data
                        .into_iter()
                        .map(|(k, v)| (k, ObjectEntry::Value(v)))
                        .collect(),
                },
                source,
                ids,
            ),
            Op::CreateMap {
                id,
                parent_id,
                parent_key,
                ..
            } => self.apply_create(
                id,
                parent_id,
                parent_key,
                Payload::Map {
                    entries: BTreeMap::new(),
                },
                source,
                ids,
            ),
            Op::CreateList {
                id,
                parent_id,
                parent_key,
                ..
            } => self.apply_create(
                id,
                parent_id,
                parent_key,
                Payload::List {
                    children: BTreeMap::new(),
                },
                source,
                ids,
            ),
            Op::CreateRegister {
                id,
                parent_id,
                parent_key,
                data,
                ..
            } => self.apply_create(
                id,
                parent_id,
                parent_key,
                Payload::Register { value: data },
                source,
                ids,
            ),
            Op::UpdateObject {
                id, data, deleted, ..
            } => self.apply_update_object(id, data, deleted, source, ids),
            Op::SetParentKey { id, parent_key, .. } => {
                self.apply_set_parent_key(id, parent_key, source, ids)
            }
            Op::DeleteCrdt { id, .. } => self.apply_delete(id, source, ids),
        }
    }

    fn apply_create(
        &mut self,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
        payload: Payload,
        source: OpSource,
        ids: &mut IdFactory,
    ) -> Result<Applied, StorageError> {
        if self.nodes.contains_key(&id) {
            return Err(StorageError::DuplicateNode(id));
        }
        let parent_node = self
            .nodes
            .get(&parent_id)
            .ok_or(StorageError::MissingParent(parent_id))?;

        // Read phase: find what (if anything) currently occupies the slot.
        let mut displaced_node = None;
        let mut displaced_value = None;
        match &parent_node.payload {
            Payload::Object { data } => match data.get(&parent_key) {
                Some(ObjectEntry::Node(n)) => displaced_node = Some(*n),
                Some(ObjectEntry::Value(v)) => displaced_value = Some(v.clone()),
                None => {}
            },
            Payload::Map { entries } => displaced_node = entries.get(&parent_key).copied(),
            Payload::List { children } => {
                if children.contains_key(&ListKey::new(parent_key.clone(), id.actor)) {
                    return Err(StorageError::DuplicatePosition(parent_key));
                }
            }
            Payload::Register { .. } => return Err(StorageError::NotAContainer(parent_id)),
        }

        let mut inverse = Vec::new();
        if source == OpSource::Local {
            inverse.push(Op::DeleteCrdt {
                op_id: ids.op_id(),
                id,
            });
            if let Some(value) = &displaced_value {
                let mut restore = JsonObject::new();
                restore.insert(parent_key.clone(), value.clone());
                inverse.push(Op::UpdateObject {
                    op_id: ids.op_id(),
                    id: parent_id,
                    data: restore,
                    deleted: Vec::new(),
                });
            }
            if let Some(displaced) = displaced_node {
                inverse.extend(self.ops_to_recreate(displaced, ids)?);
            }
        }

        // Mutate phase.
        if let Some(displaced) = displaced_node {
            self.remove_subtree(displaced);
        }
        let parent_node = self
            .nodes
            .get_mut(&parent_id)
            .ok_or(StorageError::MissingParent(parent_id))?;
        let update = match &mut parent_node.payload {
            Payload::Object { data } => {
                data.insert(parent_key.clone(), ObjectEntry::Node(id));
                StorageUpdate::Object {
                    id: parent_id,
                    updated: vec![parent_key.clone()],
                    deleted: Vec::new(),
                }
            }
            Payload::Map { entries } => {
                entries.insert(parent_key.clone(), id);
                StorageUpdate::Map {
                    id: parent_id,
                    updated: vec![parent_key.clone()],
                    deleted: Vec::new(),
                }
            }
            Payload::List { children } => {
                let key = ListKey::new(parent_key.clone(), id.actor);
                children.insert(key.clone(), id);
                let index = children.range(..&key).count();
                StorageUpdate::List {
                    id: parent_id,
                    changes: vec![ListChange::Insert { index, child: id }],
                }
            }
            Payload::Register { .. } => return Err(StorageError::NotAContainer(parent_id)),
        };
        self.nodes.insert(
            id,
            Node {
                id,
                parent: Some(Parent {
                    id: parent_id,
                    key: parent_key,
                }),
                payload,
            },
        );
        Ok(Applied {
            update: Some(update),
            inverse,
        })
    }

    fn apply_update_object(
        &mut self,
        id: NodeId,
        data: JsonObject,
        deleted: Vec<String>,
        source: OpSource,
        ids: &mut IdFactory,
    ) -> Result<Applied, StorageError> {
        let node = self.nodes.get(&id).ok_or(StorageError::Detached(id))?;
        let Payload::Object { data: current } = &node.payload else {
            return Err(StorageError::WrongKind {
                id,
                expected: NodeKind::Object,
                actual: node.kind(),
            });
        };

        // Read phase: snapshot previous entries for inverse synthesis.
        let mut inv_data = JsonObject::new();
        let mut inv_deleted = Vec::new();
        let mut displaced = Vec::new();
        for key in data.keys() {
            match current.get(key) {
                None => inv_deleted.push(key.clone()),
                Some(ObjectEntry::Value(prev)) => {
                    inv_data.insert(key.clone(), prev.clone());
                }
                Some(ObjectEntry::Node(n)) => displaced.push(*n),
            }
        }
        for key in &deleted {
            match current.get(key) {
                None => {}
                Some(ObjectEntry::Value(prev)) => {
                    inv_data.insert(key.clone(), prev.clone());
                }
                Some(ObjectEntry::Node(n)) => displaced.push(*n),
            }
        }

        let mut inverse = Vec::new();
        if source == OpSource::Local {
            if !inv_data.is_empty() || !inv_deleted.is_empty() {
                inverse.push(Op::UpdateObject {
                    op_id: ids.op_id(),
                    id,
                    data: inv_data,
                    deleted: inv_deleted,
                });
            }
            for n in &displaced {
                inverse.extend(self.ops_to_recreate(*n, ids)?);
            }
        }

        // Mutate phase.
        for n in &displaced {
            self.remove_subtree(*n);
        }
        let node = self.nodes.get_mut(&id).ok_or(StorageError::Detached(id))?;
        let Payload::Object { data: current } = &mut node.payload else {
            return Err(StorageError::Detached(id));
        };
        let mut updated_keys = Vec::new();
        let mut deleted_keys = Vec::new();
        for (key, value) in data {
            current.insert(key.clone(), ObjectEntry::Value(value));
            updated_keys.push(key);
        }
        for key in deleted {
            if current.remove(&key).is_some() {
                deleted_keys.push(key);
            }
        }

        let update = if updated_keys.is_empty() && deleted_keys.is_empty() {
            None
        } else {
            Some(StorageUpdate::Object {
                id,
                updated: updated_keys,
                deleted: deleted_keys,
            })
        };
        Ok(Applied { update, inverse })
    }

    fn apply_set_parent_key(
        &mut self,
        id: NodeId,
        new_key: String,
        source: OpSource,
        ids: &mut IdFactory,
    ) -> Result<Applied, StorageError> {
        let node = self.nodes.get(&id).ok_or(StorageError::Detached(id))?;
        let parent = node.parent.clone().ok_or(StorageError::NotInList(id))?;
        let parent_node = self
            .nodes
            .get(&parent.id)
            .ok_or(StorageError::MissingParent(parent.id))?;
        let Payload::List { children } = &parent_node.payload else {
            return Err(StorageError::NotInList(id));
        };
        if parent.key == new_key {
            return Ok(Applied::default());
        }
        if children.contains_key(&ListKey::new(new_key.clone(), id.actor)) {
            return Err(StorageError::DuplicatePosition(new_key));
        }

        let mut inverse = Vec::new();
        if source == OpSource::Local {
            inverse.push(Op::SetParentKey {
                op_id: ids.op_id(),
                id,
                parent_key: parent.key.clone(),
            });
        }

        let parent_node = self
            .nodes
            .get_mut(&parent.id)
            .ok_or(StorageError::MissingParent(parent.id))?;
        let Payload::List { children } = &mut parent_node.payload else {
            return Err(StorageError::NotInList(id));
        };
        children.remove(&ListKey::new(parent.key.clone(), id.actor));
        let key = ListKey::new(new_key.clone(), id.actor);
        children.insert(key.clone(), id);
        let index = children.range(..&key).count();

        if let Some(node) = self.nodes.get_mut(&id) {
            if let Some(p) = &mut node.parent {
                p.key = new_key;
            }
        }

        Ok(Applied {
            update: Some(StorageUpdate::List {
                id: parent.id,
                changes: vec![ListChange::Move { index, child: id }],
            }),
            inverse,
        })
    }

    fn apply_delete(
        &mut self,
        id: NodeId,
        source: OpSource,
        ids: &mut IdFactory,
    ) -> Result<Applied, StorageError> {
        let node = self.nodes.get(&id).ok_or(StorageError::Detached(id))?;
        if id == self.root {
            return Err(StorageError::DeleteRoot);
        }
        let parent = node
            .parent
            .clone()
            .ok_or_else(|| StorageError::MalformedTree(format!("non-root node {id} has no parent")))?;

        let inverse = if source == OpSource::Local {
            self.ops_to_recreate(id, ids)?
        } else {
            Vec::new()
        };

        let parent_node = self
            .nodes
            .get_mut(&parent.id)
            .ok_or(StorageError::MissingParent(parent.id))?;
        let update = match &mut parent_node.payload {
            Payload::Object { data } => {
                data.remove(&parent.key);
                StorageUpdate::Object {
                    id: parent.id,
                    updated: Vec::new(),
                    deleted: vec![parent.key],
                }
            }
            Payload::Map { entries } => {
                entries.remove(&parent.key);
                StorageUpdate::Map {
                    id: parent.id,
                    updated: Vec::new(),
                    deleted: vec![parent.key],
                }
            }
            Payload::List { children } => {
                let key = ListKey::new(parent.key, id.actor);
                let index = children.range(..&key).count();
                children.remove(&key);
                StorageUpdate::List {
                    id: parent.id,
                    changes: vec![ListChange::Delete { index, child: id }],
                }
            }
            Payload::Register { .. } => {
                return Err(StorageError::NotAContainer(parent.id));
            }
        };
        self.remove_subtree(id);
        Ok(Applied {
            update: Some(update),
            inverse,
        })
    }

    /// Remove a node and all descendants from the index. The caller is
    /// responsible for the entry in the parent's payload.
    fn remove_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.remove(&next) else {
                continue;
            };
            match node.payload {
                Payload::Object { data } => {
                    stack.extend(data.values().filter_map(|e| match e {
                        ObjectEntry::Node(n) => Some(*n),
                        ObjectEntry::Value(_) => None,
                    }));
                }
                Payload::Map { entries } => stack.extend(entries.values().copied()),
                Payload::List { children } => stack.extend(children.values().copied()),
                Payload::Register { .. } => {}
            }
        }
    }

    /// Ops that recreate `id` and its subtree where it currently stands,
    /// preserving node ids (fresh op ids). Parents are emitted before
    /// their children.
    fn ops_to_recreate(
        &self,
        id: NodeId,
        ids: &mut IdFactory,
    ) -> Result<Vec<Op>, StorageError> {
        let node = self.nodes.get(&id).ok_or(StorageError::Detached(id))?;
        let parent = node
            .parent
            .clone()
            .ok_or_else(|| StorageError::MalformedTree(format!("node {id} has no parent")))?;

        let mut ops = Vec::new();
        let mut children = Vec::new();
        let op = match &node.payload {
            Payload::Object { data } => {
                let mut plain = JsonObject::new();
                for (key, entry) in data {
                    match entry {
                        ObjectEntry::Value(v) => {
                            plain.insert(key.clone(), v.clone());
                        }
                        ObjectEntry::Node(n) => children.push(*n),
                    }
                }
                Op::CreateObject {
                    op_id: ids.op_id(),
                    id,
                    parent_id: parent.id,
                    parent_key: parent.key,
                    data: plain,
                }
            }
            Payload::Map { entries } => {
                children.extend(entries.values().copied());
                Op::CreateMap {
                    op_id: ids.op_id(),
                    id,
                    parent_id: parent.id,
                    parent_key: parent.key,
                }
            }
            Payload::List { children: list } => {
                children.extend(list.values().copied());
                Op::CreateList {
                    op_id: ids.op_id(),
                    id,
                    parent_id: parent.id,
                    parent_key: parent.key,
                }
            }
            Payload::Register { value } => Op::CreateRegister {
                op_id: ids.op_id(),
                id,
                parent_id: parent.id,
                parent_key: parent.key,
                data: value.clone(),
            },
        };
        ops.push(op);
        for child in children {
            ops.extend(self.ops_to_recreate(child, ids)?);
        }
        Ok(ops)
    }

    /// Serialize the whole tree in the wire item format, parents before
    /// children, deterministically ordered.
    pub fn serialize_items(&self) -> Vec<(NodeId, SerializedNode)> {
        let mut items = Vec::with_capacity(self.nodes.len());
        self.serialize_into(self.root, &mut items);
        items
    }

    fn serialize_into(&self, id: NodeId, items: &mut Vec<(NodeId, SerializedNode)>) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let (parent_id, parent_key) = match &node.parent {
            Some(p) => (Some(p.id), Some(p.key.clone())),
            None => (None, None),
        };
        let mut children = Vec::new();
        let serialized = match &node.payload {
            Payload::Object { data } => {
                let mut plain = JsonObject::new();
                for (key, entry) in data {
                    match entry {
                        ObjectEntry::Value(v) => {
                            plain.insert(key.clone(), v.clone());
                        }
                        ObjectEntry::Node(n) => children.push(*n),
                    }
                }
                SerializedNode::Object {
                    data: plain,
                    parent_id,
                    parent_key,
                }
            }
            Payload::Map { entries } => {
                children.extend(entries.values().copied());
                SerializedNode::Map {
                    parent_id,
                    parent_key,
                }
            }
            Payload::List { children: list } => {
                children.extend(list.values().copied());
                SerializedNode::List {
                    parent_id,
                    parent_key,
                }
            }
            Payload::Register { value } => SerializedNode::Register {
                data: value.clone(),
                parent_id,
                parent_key,
            },
        };
        items.push((id, serialized));
        for child in children {
            self.serialize_into(child, items);
        }
    }

    /// Deep snapshot of a subtree as plain JSON. Registers are
    /// transparent; maps become objects; lists become arrays in position
    /// order.
    pub fn to_json(&self, id: NodeId) -> Option<Value> {
        let node = self.nodes.get(&id)?;
        let value = match &node.payload {
            Payload::Object { data } => {
                let mut out = JsonObject::new();
                for (key, entry) in data {
                    let v = match entry {
                        ObjectEntry::Value(v) => v.clone(),
                        ObjectEntry::Node(n) => self.to_json(*n)?,
                    };
                    out.insert(key.clone(), v);
                }
                Value::Object(out)
            }
            Payload::Map { entries } => {
                let mut out = JsonObject::new();
                for (key, child) in entries {
                    out.insert(key.clone(), self.to_json(*child)?);
                }
                Value::Object(out)
            }
            Payload::List { children } => Value::Array(
                children
                    .values()
                    .filter_map(|child| self.to_json(*child))
                    .collect(),
            ),
            Payload::Register { value } => value.clone(),
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::OpId;
    use crate::position;
    use serde_json::json;

    fn obj(v: Value) -> JsonObject {
        v.as_object().cloned().unwrap_or_default()
    }

    fn set_op(ids: &mut IdFactory, target: NodeId, key: &str, value: Value) -> Op {
        Op::UpdateObject {
            op_id: ids.op_id(),
            id: target,
            data: obj(json!({ key: value })),
            deleted: Vec::new(),
        }
    }

    #[test]
    fn test_new_doc_is_bare_root() {
        let doc = StorageDoc::new();
        assert_eq!(doc.root(), NodeId::ROOT);
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.to_json(NodeId::ROOT).unwrap(), json!({}));
    }

    #[test]
    fn test_from_items_minimal_root() {
        let items: Vec<(NodeId, SerializedNode)> =
            serde_json::from_value(json!([["0:0", { "type": "object" }]])).unwrap();
        let doc = StorageDoc::from_items(items).unwrap();
        assert_eq!(doc.to_json(doc.root()).unwrap(), json!({}));
    }

    #[test]
    fn test_from_items_nested_tree() {
        let items: Vec<(NodeId, SerializedNode)> = serde_json::from_value(json!([
            ["0:0", { "type": "object", "data": { "title": "hi" } }],
            ["1:1", { "type": "list", "parentId": "0:0", "parentKey": "todos" }],
            ["1:2", { "type": "register", "parentId": "1:1", "parentKey": "O", "data": "milk" }],
            ["1:3", { "type": "map", "parentId": "0:0", "parentKey": "meta" }],
            ["1:4", { "type": "register", "parentId": "1:3", "parentKey": "author", "data": "ada" }]
        ]))
        .unwrap();
        let doc = StorageDoc::from_items(items).unwrap();
        assert_eq!(
            doc.to_json(doc.root()).unwrap(),
            json!({"title": "hi", "todos": ["milk"], "meta": {"author": "ada"}})
        );
    }

    #[test]
    fn test_from_items_rejects_orphans_and_duplicates() {
        let orphan: Vec<(NodeId, SerializedNode)> = serde_json::from_value(json!([
            ["0:0", { "type": "object" }],
            ["1:1", { "type": "map", "parentId": "9:9", "parentKey": "m" }]
        ]))
        .unwrap();
        assert!(matches!(
            StorageDoc::from_items(orphan),
            Err(StorageError::MissingParent(_))
        ));

        let dup: Vec<(NodeId, SerializedNode)> = serde_json::from_value(json!([
            ["0:0", { "type": "object" }],
            ["0:0", { "type": "object" }]
        ]))
        .unwrap();
        assert!(matches!(
            StorageDoc::from_items(dup),
            Err(StorageError::DuplicateNode(_))
        ));

        let no_root: Vec<(NodeId, SerializedNode)> = serde_json::from_value(json!([
            ["1:1", { "type": "register", "parentId": "0:0", "parentKey": "x", "data": 1 }]
        ]))
        .unwrap();
        assert!(StorageDoc::from_items(no_root).is_err());
    }

    #[test]
    fn test_update_object_and_inverse() {
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(1);

        let op = set_op(&mut ids, NodeId::ROOT, "x", json!(1));
        let applied = doc.apply(&op, OpSource::Local, &mut ids).unwrap();
        assert_eq!(doc.to_json(NodeId::ROOT).unwrap(), json!({"x": 1}));
        assert_eq!(
            applied.update,
            Some(StorageUpdate::Object {
                id: NodeId::ROOT,
                updated: vec!["x".into()],
                deleted: vec![]
            })
        );
        // key was absent before: inverse deletes it
        assert_eq!(applied.inverse.len(), 1);
        match &applied.inverse[0] {
            Op::UpdateObject { data, deleted, .. } => {
                assert!(data.is_empty());
                assert_eq!(deleted, &vec!["x".to_string()]);
            }
            other => panic!("unexpected inverse {other:?}"),
        }

        // overwrite: inverse restores the previous value
        let op2 = set_op(&mut ids, NodeId::ROOT, "x", json!(2));
        let applied2 = doc.apply(&op2, OpSource::Local, &mut ids).unwrap();
        match &applied2.inverse[0] {
            Op::UpdateObject { data, .. } => assert_eq!(data.get("x"), Some(&json!(1))),
            other => panic!("unexpected inverse {other:?}"),
        }

        // applying the inverse rolls back
        for inv in &applied2.inverse {
            doc.apply(inv, OpSource::Local, &mut ids).unwrap();
        }
        assert_eq!(doc.to_json(NodeId::ROOT).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_remote_ops_produce_no_inverse() {
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(1);
        let op = set_op(&mut ids, NodeId::ROOT, "x", json!(1));
        let applied = doc.apply(&op, OpSource::Remote, &mut ids).unwrap();
        assert!(applied.inverse.is_empty());
    }

    #[test]
    fn test_create_and_delete_subtree() {
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(1);

        let map_id = ids.node_id();
        let create_map = Op::CreateMap {
            op_id: ids.op_id(),
            id: map_id,
            parent_id: NodeId::ROOT,
            parent_key: "meta".into(),
        };
        doc.apply(&create_map, OpSource::Local, &mut ids).unwrap();

        let reg_id = ids.node_id();
        let create_reg = Op::CreateRegister {
            op_id: ids.op_id(),
            id: reg_id,
            parent_id: map_id,
            parent_key: "author".into(),
            data: json!("ada"),
        };
        doc.apply(&create_reg, OpSource::Local, &mut ids).unwrap();
        assert_eq!(
            doc.to_json(NodeId::ROOT).unwrap(),
            json!({"meta": {"author": "ada"}})
        );
        assert_eq!(doc.len(), 3);

        let delete = Op::DeleteCrdt {
            op_id: ids.op_id(),
            id: map_id,
        };
        let applied = doc.apply(&delete, OpSource::Local, &mut ids).unwrap();
        assert_eq!(doc.to_json(NodeId::ROOT).unwrap(), json!({}));
        assert_eq!(doc.len(), 1);
        assert!(!doc.contains(reg_id));

        // inverse recreates the whole subtree with the original ids
        assert_eq!(applied.inverse.len(), 2);
        for inv in &applied.inverse {
            doc.apply(inv, OpSource::Local, &mut ids).unwrap();
        }
        assert_eq!(
            doc.to_json(NodeId::ROOT).unwrap(),
            json!({"meta": {"author": "ada"}})
        );
        assert!(doc.contains(map_id));
        assert!(doc.contains(reg_id));
    }

    #[test]
    fn test_list_ordering_and_moves() {
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(1);

        let list_id = ids.node_id();
        doc.apply(
            &Op::CreateList {
                op_id: ids.op_id(),
                id: list_id,
                parent_id: NodeId::ROOT,
                parent_key: "items".into(),
            },
            OpSource::Local,
            &mut ids,
        )
        .unwrap();

        let mut last: Option<String> = None;
        let mut reg_ids = Vec::new();
        for value in ["a", "b", "c"] {
            let pos = match &last {
                None => position::first(),
                Some(prev) => position::after(prev),
            };
            let reg = ids.node_id();
            reg_ids.push(reg);
            let applied = doc
                .apply(
                    &Op::CreateRegister {
                        op_id: ids.op_id(),
                        id: reg,
                        parent_id: list_id,
                        parent_key: pos.clone(),
                        data: json!(value),
                    },
                    OpSource::Local,
                    &mut ids,
                )
                .unwrap();
            let index = match applied.update {
                Some(StorageUpdate::List { ref changes, .. }) => match changes[0] {
                    ListChange::Insert { index, .. } => index,
                    ref other => panic!("expected insert, got {other:?}"),
                },
                ref other => panic!("expected list update, got {other:?}"),
            };
            assert_eq!(index, reg_ids.len() - 1);
            last = Some(pos);
        }
        assert_eq!(
            doc.to_json(NodeId::ROOT).unwrap(),
            json!({"items": ["a", "b", "c"]})
        );

        // move "c" to the front
        let front = {
            let Payload::List { children } = &doc.node(list_id).unwrap().payload else {
                panic!("not a list");
            };
            children.keys().next().unwrap().position.clone()
        };
        let new_pos = position::before(&front);
        let applied = doc
            .apply(
                &Op::SetParentKey {
                    op_id: ids.op_id(),
                    id: reg_ids[2],
                    parent_key: new_pos,
                },
                OpSource::Local,
                &mut ids,
            )
            .unwrap();
        assert_eq!(
            doc.to_json(NodeId::ROOT).unwrap(),
            json!({"items": ["c", "a", "b"]})
        );
        match applied.update {
            Some(StorageUpdate::List { ref changes, .. }) => {
                assert_eq!(changes[0], ListChange::Move { index: 0, child: reg_ids[2] })
            }
            ref other => panic!("expected list update, got {other:?}"),
        }

        // inverse restores the old order
        for inv in &applied.inverse {
            doc.apply(inv, OpSource::Local, &mut ids).unwrap();
        }
        assert_eq!(
            doc.to_json(NodeId::ROOT).unwrap(),
            json!({"items": ["a", "b", "c"]})
        );
    }

    #[test]
    fn test_concurrent_equal_positions_tie_break_on_actor() {
        // two actors insert at the same position; lower actor sorts first
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(0);

        let list_id = NodeId::new(9, 1);
        doc.apply(
            &Op::CreateList {
                op_id: OpId::new(9, 2),
                id: list_id,
                parent_id: NodeId::ROOT,
                parent_key: "l".into(),
            },
            OpSource::Remote,
            &mut ids,
        )
        .unwrap();

        let pos = position::first();
        for (actor, value) in [(5u32, "five"), (2u32, "two")] {
            doc.apply(
                &Op::CreateRegister {
                    op_id: OpId::new(actor, 1),
                    id: NodeId::new(actor, 2),
                    parent_id: list_id,
                    parent_key: pos.clone(),
                    data: json!(value),
                },
                OpSource::Remote,
                &mut ids,
            )
            .unwrap();
        }
        assert_eq!(
            doc.to_json(NodeId::ROOT).unwrap(),
            json!({"l": ["two", "five"]})
        );
    }

    #[test]
    fn test_errors_leave_doc_unchanged() {
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(1);
        let before = doc.serialize_items();

        let missing = Op::UpdateObject {
            op_id: ids.op_id(),
            id: NodeId::new(4, 4),
            data: obj(json!({"x": 1})),
            deleted: vec![],
        };
        assert!(matches!(
            doc.apply(&missing, OpSource::Remote, &mut ids),
            Err(StorageError::Detached(_))
        ));

        let delete_root = Op::DeleteCrdt {
            op_id: ids.op_id(),
            id: NodeId::ROOT,
        };
        assert!(matches!(
            doc.apply(&delete_root, OpSource::Local, &mut ids),
            Err(StorageError::DeleteRoot)
        ));

        assert_eq!(doc.serialize_items(), before);
    }

    #[test]
    fn test_duplicate_attach_rejected() {
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(1);
        let create = Op::CreateMap {
            op_id: OpId::new(2, 1),
            id: NodeId::new(2, 2),
            parent_id: NodeId::ROOT,
            parent_key: "m".into(),
        };
        doc.apply(&create, OpSource::Remote, &mut ids).unwrap();
        assert!(matches!(
            doc.apply(&create, OpSource::Remote, &mut ids),
            Err(StorageError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_serialize_items_roundtrip() {
        let mut doc = StorageDoc::new();
        let mut ids = IdFactory::new(1);
        doc.apply(
            &set_op(&mut ids, NodeId::ROOT, "title", json!("hello")),
            OpSource::Local,
            &mut ids,
        )
        .unwrap();
        let list_id = ids.node_id();
        doc.apply(
            &Op::CreateList {
                op_id: ids.op_id(),
                id: list_id,
                parent_id: NodeId::ROOT,
                parent_key: "items".into(),
            },
            OpSource::Local,
            &mut ids,
        )
        .unwrap();
        let reg_id = ids.node_id();
        doc.apply(
            &Op::CreateRegister {
                op_id: ids.op_id(),
                id: reg_id,
                parent_id: list_id,
                parent_key: position::first(),
                data: json!(7),
            },
            OpSource::Local,
            &mut ids,
        )
        .unwrap();

        let items = doc.serialize_items();
        let rebuilt = StorageDoc::from_items(items.clone()).unwrap();
        assert_eq!(rebuilt.serialize_items(), items);
        assert_eq!(rebuilt.to_json(rebuilt.root()), doc.to_json(doc.root()));
    }

    #[test]
    fn test_merge_updates_coalesces_per_node() {
        let updates = vec![
            StorageUpdate::Object {
                id: NodeId::ROOT,
                updated: vec!["a".into()],
                deleted: vec![],
            },
            StorageUpdate::Object {
                id: NodeId::ROOT,
                updated: vec!["b".into()],
                deleted: vec!["a".into()],
            },
            StorageUpdate::List {
                id: NodeId::new(1, 1),
                changes: vec![ListChange::Insert {
                    index: 0,
                    child: NodeId::new(1, 2),
                }],
            },
        ];
        let merged = merge_updates(updates);
        assert_eq!(merged.len(), 2);
        match &merged[0] {
            StorageUpdate::Object { updated, deleted, .. } => {
                assert_eq!(updated, &vec!["b".to_string()]);
                assert_eq!(deleted, &vec!["a".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

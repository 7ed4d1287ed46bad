//! The node kernel: payload variants and the serialized wire form.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{ActorId, NodeId};
use crate::op::JsonObject;

/// The four live node variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    Map,
    List,
    Register,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Object => "object",
            NodeKind::Map => "map",
            NodeKind::List => "list",
            NodeKind::Register => "register",
        };
        f.write_str(name)
    }
}

/// An object field is either a plain JSON value or a child node.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEntry {
    Value(Value),
    Node(NodeId),
}

/// Sort key for list children.
///
/// Siblings order by position first; two clients that concurrently picked
/// the same position tie-break on the creator's actor id, lower first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListKey {
    pub position: String,
    pub actor: ActorId,
}

impl ListKey {
    pub fn new(position: impl Into<String>, actor: ActorId) -> Self {
        Self {
            position: position.into(),
            actor,
        }
    }
}

/// Back-edge to a node's parent. `key` is the field name for object/map
/// parents and the fractional position for list parents.
#[derive(Debug, Clone, PartialEq)]
pub struct Parent {
    pub id: NodeId,
    pub key: String,
}

/// Variant payload of a node. Children are stored in ordered maps so that
/// iteration (and therefore serialization) is deterministic across
/// replicas.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Object { data: BTreeMap<String, ObjectEntry> },
    Map { entries: BTreeMap<String, NodeId> },
    List { children: BTreeMap<ListKey, NodeId> },
    Register { value: Value },
}

impl Payload {
    pub fn kind(&self) -> NodeKind {
        match self {
            Payload::Object { .. } => NodeKind::Object,
            Payload::Map { .. } => NodeKind::Map,
            Payload::List { .. } => NodeKind::List,
            Payload::Register { .. } => NodeKind::Register,
        }
    }

    pub fn empty_object() -> Payload {
        Payload::Object {
            data: BTreeMap::new(),
        }
    }
}

/// A node attached to a storage document.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// `None` only for the root.
    pub parent: Option<Parent>,
    pub payload: Payload,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.payload.kind()
    }
}

/// Wire form of a node, as it appears in `INITIAL_STORAGE_STATE` items.
///
/// The root serializes as a bare `{"type": "object"}`; every other node
/// carries its parent link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SerializedNode {
    Object {
        #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
        data: JsonObject,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_key: Option<String>,
    },
    Map {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_key: Option<String>,
    },
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_key: Option<String>,
    },
    Register {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_key: Option<String>,
    },
}

impl SerializedNode {
    pub fn parent(&self) -> Option<Parent> {
        let (id, key) = match self {
            SerializedNode::Object {
                parent_id,
                parent_key,
                ..
            }
            | SerializedNode::Map {
                parent_id,
                parent_key,
            }
            | SerializedNode::List {
                parent_id,
                parent_key,
            }
            | SerializedNode::Register {
                parent_id,
                parent_key,
                ..
            } => (parent_id.as_ref()?, parent_key.as_ref()?),
        };
        Some(Parent {
            id: *id,
            key: key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_root_parses() {
        let sn: SerializedNode = serde_json::from_value(json!({"type": "object"})).unwrap();
        match &sn {
            SerializedNode::Object {
                data,
                parent_id,
                parent_key,
            } => {
                assert!(data.is_empty());
                assert!(parent_id.is_none());
                assert!(parent_key.is_none());
            }
            other => panic!("expected object, got {other:?}"),
        }
        assert!(sn.parent().is_none());
    }

    #[test]
    fn test_register_wire_shape() {
        let sn = SerializedNode::Register {
            data: json!(42),
            parent_id: Some(NodeId::ROOT),
            parent_key: Some("O".into()),
        };
        let v = serde_json::to_value(&sn).unwrap();
        assert_eq!(
            v,
            json!({"type": "register", "data": 42, "parentId": "0:0", "parentKey": "O"})
        );
    }

    #[test]
    fn test_list_key_ordering() {
        let a = ListKey::new("O", 2);
        let b = ListKey::new("O", 5);
        let c = ListKey::new("b", 1);
        // same position ties on actor, lower actor first
        assert!(a < b);
        // position dominates
        assert!(b < c);
    }

    #[test]
    fn test_serialized_roundtrip() {
        let nodes = vec![
            SerializedNode::Object {
                data: json!({"a": null}).as_object().unwrap().clone(),
                parent_id: Some(NodeId::new(1, 1)),
                parent_key: Some("k".into()),
            },
            SerializedNode::Map {
                parent_id: Some(NodeId::ROOT),
                parent_key: Some("m".into()),
            },
            SerializedNode::List {
                parent_id: Some(NodeId::ROOT),
                parent_key: Some("l".into()),
            },
        ];
        for sn in nodes {
            let text = serde_json::to_string(&sn).unwrap();
            let back: SerializedNode = serde_json::from_str(&text).unwrap();
            assert_eq!(back, sn);
        }
    }
}

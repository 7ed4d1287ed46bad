//! The operation set applied to a storage document.
//!
//! Ops are the unit of replication: every local mutation is expressed as
//! one or more ops, sent to the server inside an `UPDATE_STORAGE` frame,
//! and applied by every other client in the server's total order. Each op
//! carries a globally unique `opId` so the emitting client can recognize
//! its own echo as an acknowledgement.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{NodeId, OpId};

/// A JSON object, used for plain object fields and presence records.
pub type JsonObject = serde_json::Map<String, Value>;

/// A single storage mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Op {
    /// Attach a new object under `parent_id`/`parent_key`, optionally with
    /// initial plain fields.
    CreateObject {
        op_id: OpId,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
        #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
        data: JsonObject,
    },

    CreateMap {
        op_id: OpId,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
    },

    CreateList {
        op_id: OpId,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
    },

    /// Attach an immutable JSON leaf.
    CreateRegister {
        op_id: OpId,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
        data: Value,
    },

    /// Set plain fields on an object (`data`) and/or remove fields
    /// (`deleted`). A field holding a child node is displaced by a write
    /// to the same key.
    UpdateObject {
        op_id: OpId,
        id: NodeId,
        #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
        data: JsonObject,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        deleted: Vec<String>,
    },

    /// Re-position a node within its parent list.
    SetParentKey {
        op_id: OpId,
        id: NodeId,
        parent_key: String,
    },

    /// Detach a node and its whole subtree.
    DeleteCrdt { op_id: OpId, id: NodeId },
}

impl Op {
    pub fn op_id(&self) -> OpId {
        match self {
            Op::CreateObject { op_id, .. }
            | Op::CreateMap { op_id, .. }
            | Op::CreateList { op_id, .. }
            | Op::CreateRegister { op_id, .. }
            | Op::UpdateObject { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteCrdt { op_id, .. } => *op_id,
        }
    }

    /// The node this op targets (the created node for creates).
    pub fn target(&self) -> NodeId {
        match self {
            Op::CreateObject { id, .. }
            | Op::CreateMap { id, .. }
            | Op::CreateList { id, .. }
            | Op::CreateRegister { id, .. }
            | Op::UpdateObject { id, .. }
            | Op::SetParentKey { id, .. }
            | Op::DeleteCrdt { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_object_wire_shape() {
        let op = Op::CreateObject {
            op_id: OpId::new(1, 5),
            id: NodeId::new(1, 4),
            parent_id: NodeId::ROOT,
            parent_key: "child".into(),
            data: json!({"a": 1}).as_object().unwrap().clone(),
        };
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "CREATE_OBJECT",
                "opId": "1:5",
                "id": "1:4",
                "parentId": "0:0",
                "parentKey": "child",
                "data": {"a": 1}
            })
        );
    }

    #[test]
    fn test_update_object_omits_empty_fields() {
        let op = Op::UpdateObject {
            op_id: OpId::new(2, 1),
            id: NodeId::ROOT,
            data: json!({"x": true}).as_object().unwrap().clone(),
            deleted: Vec::new(),
        };
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(
            v,
            json!({"type": "UPDATE_OBJECT", "opId": "2:1", "id": "0:0", "data": {"x": true}})
        );
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let ops = vec![
            Op::CreateMap {
                op_id: OpId::new(1, 1),
                id: NodeId::new(1, 2),
                parent_id: NodeId::ROOT,
                parent_key: "m".into(),
            },
            Op::CreateList {
                op_id: OpId::new(1, 3),
                id: NodeId::new(1, 4),
                parent_id: NodeId::ROOT,
                parent_key: "l".into(),
            },
            Op::CreateRegister {
                op_id: OpId::new(1, 5),
                id: NodeId::new(1, 6),
                parent_id: NodeId::new(1, 4),
                parent_key: "O".into(),
                data: json!("hello"),
            },
            Op::UpdateObject {
                op_id: OpId::new(1, 7),
                id: NodeId::ROOT,
                data: JsonObject::new(),
                deleted: vec!["gone".into()],
            },
            Op::SetParentKey {
                op_id: OpId::new(1, 8),
                id: NodeId::new(1, 6),
                parent_key: "b".into(),
            },
            Op::DeleteCrdt {
                op_id: OpId::new(1, 9),
                id: NodeId::new(1, 2),
            },
        ];
        for op in ops {
            let text = serde_json::to_string(&op).unwrap();
            let back: Op = serde_json::from_str(&text).unwrap();
            assert_eq!(back, op);
        }
    }

    #[test]
    fn test_tag_names_match_protocol() {
        let v = serde_json::to_value(Op::SetParentKey {
            op_id: OpId::new(1, 1),
            id: NodeId::new(1, 2),
            parent_key: "p".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "SET_PARENT_KEY");

        let v = serde_json::to_value(Op::DeleteCrdt {
            op_id: OpId::new(1, 1),
            id: NodeId::new(1, 2),
        })
        .unwrap();
        assert_eq!(v["type"], "DELETE_CRDT");
    }
}

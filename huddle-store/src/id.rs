//! Identifiers for nodes and operations.
//!
//! Both kinds render as `"<actor>:<seq>"` on the wire. The sequence
//! counter is shared between node ids and op ids, monotonically increasing
//! for the lifetime of the process, and survives reconnects even when the
//! server hands out a fresh actor id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Server-assigned identifier for a connected client session.
pub type ActorId = u32;

fn parse_pair(s: &str) -> Option<(u32, u32)> {
    let (actor, seq) = s.split_once(':')?;
    Some((actor.parse().ok()?, seq.parse().ok()?))
}

macro_rules! wire_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name {
            pub actor: ActorId,
            pub seq: u32,
        }

        impl $name {
            pub fn new(actor: ActorId, seq: u32) -> Self {
                Self { actor, seq }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", self.actor, self.seq)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({self})", stringify!($name))
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_pair(s)
                    .map(|(actor, seq)| Self { actor, seq })
                    .ok_or_else(|| format!("invalid id {s:?}, expected \"actor:seq\""))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_id!(NodeId, "Identifier of a node attached to a storage document.");
wire_id!(OpId, "Identifier of a single emitted operation.");

impl NodeId {
    /// The reserved id of the document root.
    pub const ROOT: NodeId = NodeId { actor: 0, seq: 0 };

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

/// Allocates node and op ids for the local client.
///
/// One counter feeds both id spaces; `set_actor` is called on every
/// reconnect and deliberately leaves the counter alone, so ids issued
/// before and after a reconnect never collide.
#[derive(Debug, Clone)]
pub struct IdFactory {
    actor: ActorId,
    next_seq: u32,
}

impl IdFactory {
    pub fn new(actor: ActorId) -> Self {
        // seq 0 is reserved for the root id "0:0"
        Self { actor, next_seq: 1 }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn set_actor(&mut self, actor: ActorId) {
        self.actor = actor;
    }

    fn bump(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn node_id(&mut self) -> NodeId {
        NodeId::new(self.actor, self.bump())
    }

    pub fn op_id(&mut self) -> OpId {
        OpId::new(self.actor, self.bump())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_roundtrip() {
        let id = NodeId::new(7, 42);
        assert_eq!(id.to_string(), "7:42");
        assert_eq!("7:42".parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn test_root_id() {
        assert_eq!(NodeId::ROOT.to_string(), "0:0");
        assert!("0:0".parse::<NodeId>().unwrap().is_root());
        assert!(!NodeId::new(1, 0).is_root());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<NodeId>().is_err());
        assert!("1".parse::<NodeId>().is_err());
        assert!("a:b".parse::<NodeId>().is_err());
        assert!("1:2:3".parse::<NodeId>().is_err());
        assert!("-1:2".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let id = OpId::new(3, 9);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"3:9\"");
        let back: OpId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_factory_monotonic_across_actor_change() {
        let mut ids = IdFactory::new(1);
        let a = ids.node_id();
        let b = ids.op_id();
        ids.set_actor(5);
        let c = ids.node_id();

        assert_eq!(a, NodeId::new(1, 1));
        assert_eq!(b, OpId::new(1, 2));
        // counter keeps going after the actor changes
        assert_eq!(c, NodeId::new(5, 3));
    }
}

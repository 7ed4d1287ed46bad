//! Error types for document operations.

use thiserror::Error;

use crate::id::NodeId;
use crate::node::NodeKind;

/// Errors raised by [`crate::doc::StorageDoc`] and the live handles built
/// on top of it.
///
/// Errors on remote ops are protocol violations (the caller logs and drops
/// the frame); errors on local calls are user API misuse and leave the
/// document unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("unknown node {0}; it was detached or never attached")]
    Detached(NodeId),

    #[error("duplicate attach for node id {0}")]
    DuplicateNode(NodeId),

    #[error("parent node {0} does not exist")]
    MissingParent(NodeId),

    #[error("node {id} is a {actual}, expected a {expected}")]
    WrongKind {
        id: NodeId,
        expected: NodeKind,
        actual: NodeKind,
    },

    #[error("node {0} cannot contain children")]
    NotAContainer(NodeId),

    #[error("node {0} is not an element of a list")]
    NotInList(NodeId),

    #[error("the storage root cannot be deleted")]
    DeleteRoot,

    #[error("position {0:?} is already occupied in list")]
    DuplicatePosition(String),

    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("malformed storage tree: {0}")]
    MalformedTree(String),

    #[error("storage has not been loaded yet")]
    NotLoaded,
}

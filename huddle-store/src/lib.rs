//! # huddle-store — CRDT tree engine for huddle rooms
//!
//! The shared document behind a room is a tree of *live* nodes:
//!
//! ```text
//! LiveObject (root, "0:0")
//!    ├── "title"  → plain JSON value        (LWW per key)
//!    ├── "meta"   → LiveMap                 (keys unordered)
//!    │                └── "author" → LiveRegister ("ada")
//!    └── "todos"  → LiveList                (fractional positions)
//!                     ├── "O"  → LiveObject
//!                     └── "b"  → LiveObject
//! ```
//!
//! Every attached node has a globally unique id (`actor:seq`) and exactly
//! one parent; the document owns all nodes through an id-indexed store, so
//! parent links are id lookups rather than owning references.
//!
//! ## Modules
//!
//! - [`id`] — node/op identifiers and the per-client id allocator
//! - [`position`] — dense lexicographic positions for list ordering
//! - [`op`] — the operation set applied to a document
//! - [`node`] — node payloads and their serialized wire form
//! - [`doc`] — the document itself: op dispatch, inverse synthesis,
//!   change deltas
//!
//! The engine is pure and synchronous; networking, throttling and undo
//! stacks live in `huddle-client`.

pub mod doc;
pub mod error;
pub mod id;
pub mod node;
pub mod op;
pub mod position;

pub use doc::{Applied, ListChange, OpSource, StorageDoc, StorageUpdate, merge_updates};
pub use error::StorageError;
pub use id::{ActorId, IdFactory, NodeId, OpId};
pub use node::{ListKey, Node, NodeKind, ObjectEntry, Parent, Payload, SerializedNode};
pub use op::{JsonObject, Op};

//! # huddle-client — realtime collaboration rooms
//!
//! A client library for multiplayer applications: join named rooms,
//! share ephemeral per-actor *presence* and a durable CRDT *storage*
//! tree, and stay consistent with a relay server over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  enter/leave   ┌───────────────────────────────┐
//! │  Client  │ ─────────────► │ Room                          │
//! │  (pool)  │                │  ├─ PresenceState (mine+others)│
//! └────┬─────┘                │  ├─ StorageDoc (CRDT tree)    │
//!      │ online/visibility    │  ├─ History (inverse ops)     │
//!      ▼                      │  └─ Outbox (throttled)        │
//! ┌──────────┐                └───────────────┬───────────────┘
//! │ Environ- │                                │ connection task
//! │ ment     │                ┌───────────────▼───────────────┐
//! └──────────┘                │ auth → socket → heartbeat     │
//!                             │ backoff ◄── unavailable       │
//!                             └───────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`client`] — the factory: options, validation, room pool
//! - [`room`] — presence, storage, broadcast, undo/redo per room
//! - [`storage`] — `LiveObject` / `LiveMap` / `LiveList` handles
//! - [`connection`] — state machine, backoff, heartbeat
//! - [`protocol`] — JSON wire messages
//! - [`auth`] — session token acquisition
//! - [`transport`] — WebSocket abstraction (default: tungstenite)
//! - [`environment`] — injectable online/visibility signals
//!
//! ## Quick start
//!
//! ```no_run
//! use huddle_client::{Client, ClientOptions, EnterOptions, PresenceOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientOptions {
//!     public_api_key: Some("pk_live_x".into()),
//!     ..ClientOptions::default()
//! })?;
//! let room = client.enter("my-room", EnterOptions::default())?;
//!
//! room.update_presence(
//!     [("cursor".to_string(), Some(serde_json::json!({"x": 10})))].into(),
//!     PresenceOptions::default(),
//! );
//!
//! let root = room.root().await?;
//! root.set("title", "hello")?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod connection;
pub mod environment;
pub mod error;
pub mod events;
pub mod history;
pub mod outbox;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod storage;
pub mod transport;

pub use auth::{AuthCallback, Fetcher, FetchResponse, HttpFetcher, SessionToken};
pub use client::{
    AuthEndpoint, Client, ClientOptions, EnterOptions, DEFAULT_PUBLIC_AUTHORIZE_ENDPOINT,
    DEFAULT_SERVER_BASE_URL,
};
pub use connection::ConnectionStatus;
pub use environment::{Environment, EnvironmentHandle};
pub use error::{
    AuthError, ConfigError, FetchError, HistoryError, ProtocolError, RoomError, TransportError,
};
pub use events::Subscription;
pub use presence::{Other, OthersEvent, PresencePatch};
pub use room::{PresenceOptions, Room, RoomEvent};
pub use storage::{LiveList, LiveMap, LiveObject, LiveValue, StorageRef};
pub use transport::{Connector, Socket, SocketEvent, SocketOutput};

// the storage engine is part of the public surface
pub use huddle_store::{
    ActorId, JsonObject, ListChange, NodeId, Op, OpId, StorageError, StorageUpdate,
};

//! The client factory: option validation, the room pool, and environment
//! fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::auth::{AuthBackend, AuthCallback, Fetcher, HttpFetcher};
use crate::connection::{ConnectionConfig, Control, HEARTBEAT_INTERVAL, IDLE_TIMEOUT};
use crate::environment::Environment;
use crate::error::ConfigError;
use crate::room::Room;
use crate::transport::{Connector, WsConnector};

/// Default WebSocket relay.
pub const DEFAULT_SERVER_BASE_URL: &str = "wss://relay.huddle.dev/v1";
/// Default endpoint for `public_api_key` authentication.
pub const DEFAULT_PUBLIC_AUTHORIZE_ENDPOINT: &str = "https://api.huddle.dev/v1/public/authorize";

const THROTTLE_MIN_MS: u64 = 80;
const THROTTLE_MAX_MS: u64 = 1000;
const THROTTLE_DEFAULT_MS: u64 = 100;

/// How the client authenticates rooms.
#[derive(Clone)]
pub enum AuthEndpoint {
    /// POST `{ room }` to this URL, expect `{ token }`.
    Url(String),
    /// Called with the room id; returns the raw token.
    Callback(AuthCallback),
}

/// Configuration for [`Client::new`]. Exactly one of `public_api_key`
/// and `auth_endpoint` must be set.
#[derive(Default)]
pub struct ClientOptions {
    /// Authenticate anonymously with a public API key.
    pub public_api_key: Option<String>,
    /// Authenticate through an application endpoint or callback.
    pub auth_endpoint: Option<AuthEndpoint>,
    /// Outbound coalescer delay in milliseconds, 80..=1000 (default 100).
    pub throttle_ms: Option<u64>,
    /// Override of the WebSocket relay base URL (tests, air-gapped
    /// deployments).
    pub server_base_url: Option<String>,
    /// Override of the public-authorize endpoint.
    pub public_authorize_endpoint: Option<String>,
    /// Injected WebSocket implementation (required in hosts without the
    /// default transport).
    pub connector: Option<Arc<dyn Connector>>,
    /// Injected HTTP POST implementation.
    pub fetcher: Option<Arc<dyn Fetcher>>,
    /// Injected environment signals; defaults to always online/visible.
    pub environment: Option<Environment>,
}

/// Options for [`Client::enter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnterOptions {
    /// Create the room without opening a connection (server-side
    /// rendering); call [`Room::connect`] later.
    pub without_connecting: bool,
}

struct ClientInner {
    auth: AuthBackend,
    throttle: Duration,
    server_base: String,
    connector: Arc<dyn Connector>,
    fetcher: Arc<dyn Fetcher>,
    environment: Environment,
    rooms: Mutex<HashMap<String, Room>>,
}

/// Process-wide factory pooling rooms by id.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Validate options and build a client. Must be called within a
    /// tokio runtime (rooms and environment wiring spawn tasks).
    pub fn new(options: ClientOptions) -> Result<Client, ConfigError> {
        let throttle_ms = options.throttle_ms.unwrap_or(THROTTLE_DEFAULT_MS);
        if !(THROTTLE_MIN_MS..=THROTTLE_MAX_MS).contains(&throttle_ms) {
            return Err(ConfigError::InvalidThrottle);
        }

        let auth = match (options.public_api_key, options.auth_endpoint) {
            (Some(key), None) => AuthBackend::PublicKey {
                key,
                endpoint: options
                    .public_authorize_endpoint
                    .unwrap_or_else(|| DEFAULT_PUBLIC_AUTHORIZE_ENDPOINT.to_string()),
            },
            (None, Some(AuthEndpoint::Url(url))) => AuthBackend::Endpoint { url },
            (None, Some(AuthEndpoint::Callback(callback))) => AuthBackend::Callback(callback),
            _ => return Err(ConfigError::MissingOrAmbiguousAuth),
        };

        let server_base = options
            .server_base_url
            .unwrap_or_else(|| DEFAULT_SERVER_BASE_URL.to_string());
        if let Err(err) = reqwest::Url::parse(&server_base) {
            return Err(ConfigError::InvalidServerUrl {
                url: server_base,
                reason: err.to_string(),
            });
        }

        let inner = Arc::new(ClientInner {
            auth,
            throttle: Duration::from_millis(throttle_ms),
            server_base,
            connector: options.connector.unwrap_or_else(|| Arc::new(WsConnector)),
            fetcher: options.fetcher.unwrap_or_else(|| Arc::new(HttpFetcher::new())),
            environment: options.environment.unwrap_or_else(Environment::always_on),
            rooms: Mutex::new(HashMap::new()),
        });
        tokio::spawn(watch_environment(
            inner.environment.clone(),
            Arc::downgrade(&inner),
        ));
        Ok(Client { inner })
    }

    /// Enter a room: return the pooled instance or create (and connect)
    /// a fresh one.
    pub fn enter(&self, room_id: &str, options: EnterOptions) -> Result<Room, ConfigError> {
        if room_id.is_empty() {
            return Err(ConfigError::EmptyRoomId);
        }
        let mut rooms = self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }
        let config = ConnectionConfig {
            room_id: room_id.to_string(),
            server_base: self.inner.server_base.clone(),
            auth: self.inner.auth.clone(),
            fetcher: self.inner.fetcher.clone(),
            connector: self.inner.connector.clone(),
            throttle: self.inner.throttle,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
        };
        let room = Room::create(
            room_id.to_string(),
            config,
            !options.without_connecting,
        );
        rooms.insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    /// Pure lookup of a pooled room.
    pub fn get_room(&self, room_id: &str) -> Option<Room> {
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }

    /// Disconnect a room (socket close 1000, timers cancelled) and drop
    /// it from the pool. A later `enter` yields a fresh instance.
    pub fn leave(&self, room_id: &str) {
        let room = self
            .inner
            .rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(room_id);
        if let Some(room) = room {
            room.shutdown();
        }
    }
}

/// Fan environment edges out to every pooled room: offline drops sockets,
/// back-online and becoming-visible both trigger an immediate retry.
async fn watch_environment(environment: Environment, client: Weak<ClientInner>) {
    let mut online = environment.online.clone();
    let mut visible = environment.visible.clone();
    let mut was_online = *online.borrow();
    loop {
        let control = tokio::select! {
            changed = online.changed() => {
                if changed.is_err() {
                    return;
                }
                let now_online = *online.borrow();
                let control = if now_online && !was_online {
                    Some(Control::RetryNow)
                } else if !now_online {
                    Some(Control::WentOffline)
                } else {
                    None
                };
                was_online = now_online;
                control
            }
            changed = visible.changed() => {
                if changed.is_err() {
                    return;
                }
                if *visible.borrow() {
                    Some(Control::RetryNow)
                } else {
                    None
                }
            }
        };
        let Some(control) = control else {
            continue;
        };
        let Some(client) = client.upgrade() else {
            return;
        };
        let rooms: Vec<Room> = client
            .rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for room in rooms {
            room.inner.signal(control);
        }
    }
}

//! The per-room connection state machine.
//!
//! One task owns the socket lifecycle:
//!
//! ```text
//! closed ──connect()──► authenticating ──► connecting ──► open
//!                            │  ▲              │           │
//!              permanent 403 │  └── backoff ◄──┴───────────┘
//!                            ▼        ▲     socket close / idle /
//!                          failed     └──── offline signal
//! ```
//!
//! `open` requires both a connected socket and the server's `ROOM_STATE`
//! message. While open the task also owns the heartbeat (ping every 30 s,
//! any-frame idle timeout 60 s) and the throttled outbox flush.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::auth::{acquire_token, AuthBackend, Fetcher};
use crate::error::{RoomError, TransportError};
use crate::protocol::{ClientMessage, PING_FRAME, PONG_FRAME};
use crate::room::RoomInner;
use crate::transport::{Connector, Socket, SocketEvent, SocketOutput};

/// Reconnect ladder, capped at the last entry.
const BACKOFF_DELAYS_MS: [u64; 6] = [250, 500, 1000, 2000, 5000, 10_000];

const VIOLATION_WINDOW: Duration = Duration::from_secs(30);
const VIOLATION_LIMIT: usize = 5;

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Public connection status of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Authenticating,
    Connecting,
    Open,
    Unavailable,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Authenticating => "authenticating",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Unavailable => "unavailable",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Signals from the client/room into the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Start connecting (from `closed`/`failed`), or retry immediately.
    Connect,
    /// Skip any remaining backoff and retry now (online/visible signal).
    RetryNow,
    /// The environment went offline; drop the socket.
    WentOffline,
    /// Leave: close the socket with 1000 and end the task.
    Shutdown,
}

pub(crate) struct ConnectionConfig {
    pub room_id: String,
    pub server_base: String,
    pub auth: AuthBackend,
    pub fetcher: Arc<dyn Fetcher>,
    pub connector: Arc<dyn Connector>,
    pub throttle: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

/// Exponential backoff with jitter, reset on every successful open.
pub(crate) struct Backoff {
    attempt: usize,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = BACKOFF_DELAYS_MS[self.attempt.min(BACKOFF_DELAYS_MS.len() - 1)];
        self.attempt += 1;
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Compose the socket URL for a room.
pub(crate) fn room_url(base: &str, room: &str, token: &str) -> Result<String, TransportError> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| TransportError(format!("invalid server URL {base:?}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("room", room)
        .append_pair("token", token);
    Ok(url.to_string())
}

enum SessionEnd {
    /// The socket died; retry with backoff.
    Lost,
    /// Shutdown requested; the task must end.
    Shutdown,
}

enum WaitOutcome {
    Retry,
    Shutdown,
}

/// Task entry point. Runs until shutdown.
pub(crate) async fn run(
    room: Arc<RoomInner>,
    config: ConnectionConfig,
    mut control: mpsc::UnboundedReceiver<Control>,
    connect_on_start: bool,
) {
    let mut want_connect = connect_on_start;
    loop {
        while !want_connect {
            match control.recv().await {
                None | Some(Control::Shutdown) => {
                    room.set_status(ConnectionStatus::Closed);
                    return;
                }
                Some(Control::Connect) => want_connect = true,
                Some(Control::RetryNow) | Some(Control::WentOffline) => {}
            }
        }
        match session_loop(&room, &config, &mut control).await {
            SessionEnd::Shutdown => {
                room.set_status(ConnectionStatus::Closed);
                return;
            }
            SessionEnd::Lost => {
                // `failed` is terminal until connect() is called again
                want_connect = false;
            }
        }
    }
}

/// Authenticate → connect → drive, retrying transient failures until the
/// session ends permanently (`failed`) or shutdown is requested.
async fn session_loop(
    room: &Arc<RoomInner>,
    config: &ConnectionConfig,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> SessionEnd {
    let mut backoff = Backoff::new();
    loop {
        room.set_status(ConnectionStatus::Authenticating);
        // a leave() during the auth round trip drops the response
        let auth = acquire_token(&config.auth, &config.fetcher, &config.room_id);
        tokio::pin!(auth);
        let result = loop {
            tokio::select! {
                result = &mut auth => break result,
                command = control.recv() => match command {
                    None | Some(Control::Shutdown) => return SessionEnd::Shutdown,
                    Some(_) => {}
                }
            }
        };
        let token = match result {
            Ok(token) => token,
            Err(err) if err.is_permanent() => {
                log::error!("room {}: permanent auth failure: {err}", config.room_id);
                room.emit_error(RoomError::Auth(err));
                room.set_status(ConnectionStatus::Failed);
                return SessionEnd::Lost;
            }
            Err(err) => {
                log::warn!("room {}: transient auth failure: {err}", config.room_id);
                match wait_for_retry(room, control, &mut backoff).await {
                    WaitOutcome::Retry => continue,
                    WaitOutcome::Shutdown => return SessionEnd::Shutdown,
                }
            }
        };

        room.prepare_connection(token.actor);
        room.set_status(ConnectionStatus::Connecting);

        let url = match room_url(&config.server_base, &config.room_id, &token.raw) {
            Ok(url) => url,
            Err(err) => {
                log::error!("room {}: {err}", config.room_id);
                room.set_status(ConnectionStatus::Failed);
                return SessionEnd::Lost;
            }
        };
        let connect = config.connector.connect(&url);
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = control.recv() => match command {
                    None | Some(Control::Shutdown) => return SessionEnd::Shutdown,
                    Some(_) => {}
                }
            }
        };
        let socket = match connected {
            Ok(socket) => socket,
            Err(err) => {
                log::warn!("room {}: {err}", config.room_id);
                match wait_for_retry(room, control, &mut backoff).await {
                    WaitOutcome::Retry => continue,
                    WaitOutcome::Shutdown => return SessionEnd::Shutdown,
                }
            }
        };
        log::debug!(
            "room {}: socket connected as actor {}",
            config.room_id,
            token.actor
        );

        match drive_session(room, config, control, &mut backoff, socket).await {
            SessionEnd::Shutdown => return SessionEnd::Shutdown,
            SessionEnd::Lost => match wait_for_retry(room, control, &mut backoff).await {
                WaitOutcome::Retry => continue,
                WaitOutcome::Shutdown => return SessionEnd::Shutdown,
            },
        }
    }
}

/// Sit out the backoff delay in `unavailable`, honoring control signals.
async fn wait_for_retry(
    room: &Arc<RoomInner>,
    control: &mut mpsc::UnboundedReceiver<Control>,
    backoff: &mut Backoff,
) -> WaitOutcome {
    room.set_status(ConnectionStatus::Unavailable);
    let delay = backoff.next_delay();
    log::debug!("room {}: reconnecting in {delay:?}", room.id());
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return WaitOutcome::Retry,
            command = control.recv() => match command {
                None | Some(Control::Shutdown) => return WaitOutcome::Shutdown,
                Some(Control::Connect) | Some(Control::RetryNow) => return WaitOutcome::Retry,
                Some(Control::WentOffline) => {}
            }
        }
    }
}

/// Drive one connected socket until it dies or shutdown is requested.
async fn drive_session(
    room: &Arc<RoomInner>,
    config: &ConnectionConfig,
    control: &mut mpsc::UnboundedReceiver<Control>,
    backoff: &mut Backoff,
    mut socket: Socket,
) -> SessionEnd {
    let mut opened = false;
    let mut last_frame = Instant::now();
    let mut last_flush = Instant::now() - config.throttle;
    let mut violations: Vec<Instant> = Vec::new();

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // consume the immediate first tick

    loop {
        let flush_due = opened && room.flushable();
        let flush_at = last_flush + config.throttle;
        let idle_at = last_frame + config.idle_timeout;

        tokio::select! {
            event = socket.rx.recv() => match event {
                Some(SocketEvent::Message(text)) => {
                    last_frame = Instant::now();
                    if text == PONG_FRAME {
                        continue;
                    }
                    match room.handle_server_frame(&text) {
                        Ok(saw_room_state) => {
                            if saw_room_state && !opened {
                                opened = true;
                                backoff.reset();
                                room.on_open();
                                match ClientMessage::FetchStorage.encode() {
                                    Ok(frame) => {
                                        if socket.tx.send(SocketOutput::Text(frame)).await.is_err() {
                                            return SessionEnd::Lost;
                                        }
                                    }
                                    Err(err) => log::error!("room {}: {err}", config.room_id),
                                }
                            }
                        }
                        Err(err) => {
                            log::warn!("room {}: dropping bad frame: {err}", config.room_id);
                            let now = Instant::now();
                            violations.push(now);
                            violations.retain(|t| now.duration_since(*t) < VIOLATION_WINDOW);
                            if violations.len() >= VIOLATION_LIMIT {
                                log::warn!(
                                    "room {}: {} protocol violations in {:?}, reconnecting",
                                    config.room_id,
                                    violations.len(),
                                    VIOLATION_WINDOW
                                );
                                room.emit_error(RoomError::ProtocolViolations);
                                return SessionEnd::Lost;
                            }
                        }
                    }
                }
                Some(SocketEvent::Closed { code }) => {
                    log::debug!("room {}: socket closed (code {code:?})", config.room_id);
                    return SessionEnd::Lost;
                }
                Some(SocketEvent::Error(err)) => {
                    log::warn!("room {}: socket error: {err}", config.room_id);
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Lost,
            },

            _ = heartbeat.tick(), if opened => {
                if socket.tx.send(SocketOutput::Text(PING_FRAME.into())).await.is_err() {
                    return SessionEnd::Lost;
                }
            }

            _ = tokio::time::sleep_until(idle_at) => {
                log::warn!(
                    "room {}: no server frames for {:?}, reconnecting",
                    config.room_id,
                    config.idle_timeout
                );
                return SessionEnd::Lost;
            }

            _ = tokio::time::sleep_until(flush_at), if flush_due => {
                for frame in room.take_outgoing_frames() {
                    if socket.tx.send(SocketOutput::Text(frame)).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                last_flush = Instant::now();
            }

            // a mutation arrived; loop to re-arm the flush deadline
            _ = room.outbox_notified() => {}

            command = control.recv() => match command {
                None | Some(Control::Shutdown) => {
                    let _ = socket.tx.send(SocketOutput::Close(1000)).await;
                    return SessionEnd::Shutdown;
                }
                Some(Control::WentOffline) => {
                    log::debug!("room {}: environment offline", config.room_id);
                    return SessionEnd::Lost;
                }
                Some(Control::Connect) | Some(Control::RetryNow) => {}
            }
        }
    }
}

//! WebSocket transport abstraction.
//!
//! The connection machine talks to a [`Socket`]: an outgoing command
//! channel and an incoming event channel. The default [`WsConnector`]
//! bridges those channels to a real `tokio-tungstenite` stream with a
//! writer task and a reader task; tests inject their own [`Connector`]
//! and drive both ends deterministically.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// Events surfaced by the socket reader.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// A complete text frame.
    Message(String),
    /// The peer closed the connection.
    Closed { code: Option<u16> },
    /// Transport-level failure; the socket is dead.
    Error(String),
}

/// Commands accepted by the socket writer.
#[derive(Debug, Clone)]
pub enum SocketOutput {
    Text(String),
    /// Close the connection with the given code and stop writing.
    Close(u16),
}

/// A connected socket, already split into channel-backed halves.
pub struct Socket {
    pub tx: mpsc::Sender<SocketOutput>,
    pub rx: mpsc::Receiver<SocketEvent>,
}

/// Opens sockets. Injectable so non-default hosts and tests can supply
/// their own WebSocket implementation.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>>;
}

/// Default connector over `tokio-tungstenite`.
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Socket, TransportError>> {
        let url = url.to_string();
        async move {
            let (stream, _response) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            let (mut writer, mut reader) = stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<SocketOutput>(64);
            let (event_tx, event_rx) = mpsc::channel::<SocketEvent>(256);

            // Writer task: forward the outgoing channel to the sink.
            tokio::spawn(async move {
                while let Some(output) = out_rx.recv().await {
                    match output {
                        SocketOutput::Text(text) => {
                            if writer.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        SocketOutput::Close(code) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            };
                            let _ = writer.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    }
                }
            });

            // Reader task: surface frames and lifecycle events.
            tokio::spawn(async move {
                while let Some(message) = reader.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if event_tx
                                .send(SocketEvent::Message(text.as_str().to_owned()))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            let code = frame.map(|f| f.code.into());
                            let _ = event_tx.send(SocketEvent::Closed { code }).await;
                            return;
                        }
                        // binary frames are not part of this protocol;
                        // ping/pong are answered by tungstenite itself
                        Ok(_) => {}
                        Err(e) => {
                            let _ = event_tx.send(SocketEvent::Error(e.to_string())).await;
                            return;
                        }
                    }
                }
                let _ = event_tx.send(SocketEvent::Closed { code: None }).await;
            });

            Ok(Socket {
                tx: out_tx,
                rx: event_rx,
            })
        }
        .boxed()
    }
}

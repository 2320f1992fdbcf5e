//! The raw frame socket under the signaling channel.
//!
//! [`SignalSocket`] is the minimal capability the relay client needs: send a
//! JSON frame, receive JSON frames, close. Production uses the WebSocket
//! implementation; tests wire two in-memory halves together with [`pair`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::SignalingError;

#[async_trait]
pub trait SignalSocket: Send + Sync {
    async fn send(&self, frame: Value) -> Result<(), SignalingError>;

    /// The next inbound frame, or `None` once the socket is gone.
    async fn recv(&self) -> Option<Value>;

    async fn close(&self);
}

/// WebSocket-backed socket speaking line-per-frame JSON text messages.
pub struct WsSignalSocket {
    send_tx: mpsc::UnboundedSender<Value>,
    recv_rx: AsyncMutex<mpsc::UnboundedReceiver<Value>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WsSignalSocket {
    pub async fn connect(relay_url: &str) -> Result<Self, SignalingError> {
        let url = Url::parse(relay_url)
            .map_err(|err| SignalingError::Socket(format!("invalid relay url {relay_url}: {err}")))?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Socket(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signaling", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Value>();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel::<Value>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                if let Ok(text) = serde_json::to_string(&frame) {
                    if ws_write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => {
                                if recv_tx.send(value).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(
                                    target = "signaling",
                                    "relay sent non-json frame: {err}"
                                );
                            }
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(value) = serde_json::from_slice::<Value>(&data) {
                            if recv_tx.send(value).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signaling",
                                    "relay websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signaling",
                                    "relay websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
        });

        Ok(Self {
            send_tx,
            recv_rx: AsyncMutex::new(recv_rx),
            tasks: Mutex::new(vec![writer, reader]),
        })
    }
}

#[async_trait]
impl SignalSocket for WsSignalSocket {
    async fn send(&self, frame: Value) -> Result<(), SignalingError> {
        self.send_tx
            .send(frame)
            .map_err(|_| SignalingError::SocketClosed)
    }

    async fn recv(&self) -> Option<Value> {
        self.recv_rx.lock().await.recv().await
    }

    async fn close(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

/// One half of an in-memory socket pair.
pub struct MemorySignalSocket {
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Value>>,
}

/// Two sockets cross-wired so whatever one sends the other receives.
pub fn pair() -> (MemorySignalSocket, MemorySignalSocket) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemorySignalSocket {
            tx: Mutex::new(Some(a_tx)),
            rx: AsyncMutex::new(a_rx),
        },
        MemorySignalSocket {
            tx: Mutex::new(Some(b_tx)),
            rx: AsyncMutex::new(b_rx),
        },
    )
}

#[async_trait]
impl SignalSocket for MemorySignalSocket {
    async fn send(&self, frame: Value) -> Result<(), SignalingError> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(frame).map_err(|_| SignalingError::SocketClosed),
            None => Err(SignalingError::SocketClosed),
        }
    }

    async fn recv(&self) -> Option<Value> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.tx.lock().take();
    }
}

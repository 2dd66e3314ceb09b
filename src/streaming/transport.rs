//! Duplex transport under the ConnectionManager
//!
//! A transport opens one raw duplex stream and exposes it as a pair of
//! channels. The ConnectionManager never sees the socket itself.
//!
//! # WebSocket Transport
//!
//! ```text
//!  ConnectionManager            writer task                 server
//!  tx ── OutboundFrame ──▶  SplitSink::send(Message) ──▶
//!  rx ◀── InboundFrame ───  reader task ◀── SplitStream ◀──
//! ```
//!
//! Outbound frames go through a single FIFO channel, so transmission order is
//! `send` order.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
};

use super::ConnectionError;

/// Connection timeout for the WebSocket upgrade
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames written by the client
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    /// Close the stream cleanly (close code 1000)
    Close,
}

/// Frames read from the server
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    /// The stream ended. `clean` is true only for a normal close.
    Closed {
        clean: bool,
        reason: Option<String>,
    },
}

/// An open duplex stream
pub struct Duplex {
    pub tx: mpsc::UnboundedSender<OutboundFrame>,
    pub rx: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Opens raw duplex streams to the backend
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Duplex, ConnectionError>;
}

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Duplex, ConnectionError> {
        log::info!("Transport: connecting to {}", url);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                url, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| ConnectionError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundFrame>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            log::warn!("Transport: send failed: {}", e);
                            break;
                        }
                    }
                    OutboundFrame::Close => {
                        if let Err(e) = write.close().await {
                            log::debug!("Transport: error closing WebSocket: {}", e);
                        }
                        break;
                    }
                }
            }
            log::debug!("Transport: writer task exiting");
        });

        tokio::spawn(async move {
            let closed = loop {
                let next = tokio::select! {
                    _ = in_tx.closed() => {
                        log::debug!("Transport: reader dropped by owner");
                        return;
                    }
                    next = read.next() => next,
                };

                match next {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(InboundFrame::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (clean, reason) = match frame {
                            Some(f) => (f.code == CloseCode::Normal, Some(f.reason.to_string())),
                            None => (false, None),
                        };
                        log::info!("Transport: closed by server (clean: {})", clean);
                        break InboundFrame::Closed { clean, reason };
                    }
                    Some(Ok(_)) => {} // Ignore ping/pong/binary
                    Some(Err(e)) => {
                        log::warn!("Transport: WebSocket error: {}", e);
                        break InboundFrame::Closed {
                            clean: false,
                            reason: Some(e.to_string()),
                        };
                    }
                    None => {
                        break InboundFrame::Closed {
                            clean: false,
                            reason: Some("stream ended".to_string()),
                        };
                    }
                }
            };
            let _ = in_tx.send(closed);
            log::debug!("Transport: reader task exiting");
        });

        Ok(Duplex {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

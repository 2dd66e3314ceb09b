//! ConnectionManager: one authenticated duplex stream per test attempt
//!
//! # Connection Flow
//!
//! 1. `connect()` - open the transport, send `auth`, wait for the reply
//! 2. `send()` - transmit while Authenticated (returns false otherwise)
//! 3. inbound frames are decoded by the reader task and emitted on the bus
//! 4. `disconnect()` - clean shutdown, never reconnects
//!
//! # Epochs
//!
//! Every `connect()` starts a new epoch (`Uuid`). Reader tasks, heartbeat
//! tasks and reconnect timers carry the epoch they were started for and do
//! nothing once it is no longer current.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{ConnectionEvent, EventBus, EventHandler, EventKind, SubscriptionId};
use super::protocol::{decode, ClientMessage, Decoded, ServerMessage};
use super::transport::{Duplex, InboundFrame, OutboundFrame, Transport, WebSocketTransport};
use super::ConnectionError;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Stream endpoint (ws:// or wss://)
    pub url: String,
    /// How long to wait for `authenticated` / `auth_error`
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Delay before the first reconnect; doubles per attempt
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".to_string(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    /// Transport open, handshake pending
    Connected,
    Authenticated,
    Reconnecting,
    /// Reconnection exhausted; only `connect()` leaves this state
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub reconnect_attempts: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Reconnect delay before `attempt` (1-based): `base × 2^(attempt-1)`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.checked_mul(2u32.pow(exponent)).unwrap_or(Duration::MAX)
}

#[derive(Clone)]
struct Credentials {
    session_id: String,
    token: String,
}

/// The live half of an authenticated stream
struct Link {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    reader: JoinHandle<()>,
    heartbeat: CancellationToken,
}

impl Link {
    /// Close cleanly and stop both background tasks
    fn shutdown(self) {
        let _ = self.tx.send(OutboundFrame::Close);
        self.heartbeat.cancel();
        self.reader.abort();
    }
}

struct Core {
    config: ConnectionConfig,
    state: ConnectionState,
    epoch: Option<Uuid>,
    credentials: Option<Credentials>,
    link: Option<Link>,
    reconnect_timer: Option<JoinHandle<()>>,
    failure_reported: bool,
}

struct Shared {
    transport: Arc<dyn Transport>,
    bus: EventBus,
    core: Mutex<Core>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if let Some(timer) = core.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(link) = core.link.take() {
            link.shutdown();
        }
    }
}

/// Handle to the live stream. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                bus: EventBus::new(),
                core: Mutex::new(Core {
                    config,
                    state: ConnectionState::default(),
                    epoch: None,
                    credentials: None,
                    link: None,
                    reconnect_timer: None,
                    failure_reported: false,
                }),
            }),
        }
    }

    /// Manager over the production WebSocket transport
    pub fn with_websocket(config: ConnectionConfig) -> Self {
        Self::new(config, Arc::new(WebSocketTransport))
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub fn on(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.shared.bus.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.bus.off(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.core.lock().state.status
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == ConnectionStatus::Authenticated
    }

    /// Point future connects (and reconnects) at another endpoint
    pub fn set_endpoint(&self, url: &str) {
        log::info!("ConnectionManager: endpoint set to {}", url);
        self.shared.core.lock().config.url = url.to_string();
    }

    /// Open and authenticate the stream for `session_id`.
    ///
    /// Supersedes any previous connection. On failure the status is left
    /// Disconnected; no reconnect is scheduled for a failed initial connect.
    pub async fn connect(&self, session_id: &str, token: &str) -> Result<(), ConnectionError> {
        let epoch = Uuid::new_v4();

        let (old_timer, old_link) = {
            let mut core = self.shared.core.lock();
            core.epoch = Some(epoch);
            core.credentials = Some(Credentials {
                session_id: session_id.to_string(),
                token: token.to_string(),
            });
            core.failure_reported = false;
            core.state = ConnectionState {
                session_id: Some(session_id.to_string()),
                ..ConnectionState::default()
            };
            (core.reconnect_timer.take(), core.link.take())
        };

        if let Some(timer) = old_timer {
            timer.abort();
        }
        if let Some(link) = old_link {
            log::info!("ConnectionManager: closing previous stream");
            link.shutdown();
        }

        log::info!("ConnectionManager: connecting session {}", session_id);

        match self.establish(epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut core = self.shared.core.lock();
                if core.epoch == Some(epoch) {
                    core.state.status = ConnectionStatus::Disconnected;
                }
                log::warn!("ConnectionManager: connect failed: {}", e);
                Err(e)
            }
        }
    }

    /// Clean, non-reconnecting close. Safe from any state.
    pub fn disconnect(&self) {
        let (timer, link, previous) = {
            let mut core = self.shared.core.lock();
            let previous = core.state.status;
            core.epoch = None;
            core.credentials = None;
            core.state = ConnectionState::default();
            (core.reconnect_timer.take(), core.link.take(), previous)
        };

        if let Some(timer) = timer {
            timer.abort();
        }

        let had_link = link.is_some();
        if let Some(link) = link {
            link.shutdown();
        }

        let was_active = !matches!(
            previous,
            ConnectionStatus::Disconnected | ConnectionStatus::Failed
        );
        if had_link || was_active {
            log::info!("ConnectionManager: disconnected (was {:?})", previous);
            self.shared.bus.emit(&ConnectionEvent::Disconnected {
                clean: true,
                reason: Some("client disconnect".to_string()),
            });
        }
    }

    /// Transmit `message` if Authenticated. Returns whether it was queued.
    pub fn send(&self, message: &ClientMessage) -> bool {
        let core = self.shared.core.lock();

        if core.state.status != ConnectionStatus::Authenticated {
            log::debug!(
                "ConnectionManager: not sending {} while {:?}",
                message.kind(),
                core.state.status
            );
            return false;
        }

        let Some(link) = core.link.as_ref() else {
            return false;
        };

        match serde_json::to_string(message) {
            // Sent under the lock so concurrent senders keep FIFO order
            Ok(json) => link.tx.send(OutboundFrame::Text(json)).is_ok(),
            Err(e) => {
                log::error!("ConnectionManager: failed to encode {}: {}", message.kind(), e);
                false
            }
        }
    }

    /// One connect + handshake attempt for `epoch`
    async fn establish(&self, epoch: Uuid) -> Result<(), ConnectionError> {
        let (url, credentials, config) = {
            let mut core = self.shared.core.lock();
            if core.epoch != Some(epoch) {
                return Err(ConnectionError::Cancelled);
            }
            let credentials = core
                .credentials
                .clone()
                .ok_or(ConnectionError::NotConnected)?;
            if core.state.status != ConnectionStatus::Reconnecting {
                core.state.status = ConnectionStatus::Connecting;
            }
            (core.config.url.clone(), credentials, core.config.clone())
        };

        let mut duplex = self.shared.transport.open(&url).await?;

        {
            let mut core = self.shared.core.lock();
            if core.epoch != Some(epoch) {
                let _ = duplex.tx.send(OutboundFrame::Close);
                return Err(ConnectionError::Cancelled);
            }
            core.state.status = ConnectionStatus::Connected;
        }
        self.shared.bus.emit(&ConnectionEvent::Connected);

        let auth = ClientMessage::auth(&credentials.token, &credentials.session_id);
        let auth_json = serde_json::to_string(&auth)
            .map_err(|e| ConnectionError::ProtocolError(e.to_string()))?;
        duplex
            .tx
            .send(OutboundFrame::Text(auth_json))
            .map_err(|_| ConnectionError::Disconnected("stream closed before handshake".to_string()))?;

        log::info!("ConnectionManager: stream open, waiting for handshake reply...");

        let reply = timeout(config.handshake_timeout, self.await_handshake(&mut duplex)).await;
        let user_id = match reply {
            Ok(Ok(user_id)) => user_id,
            Ok(Err(e)) => {
                let _ = duplex.tx.send(OutboundFrame::Close);
                if let ConnectionError::AuthFailed(message) = &e {
                    self.shared.bus.emit(&ConnectionEvent::Error {
                        message: message.clone(),
                    });
                }
                return Err(e);
            }
            Err(_) => {
                log::warn!(
                    "ConnectionManager: no handshake reply within {:?}",
                    config.handshake_timeout
                );
                let _ = duplex.tx.send(OutboundFrame::Close);
                return Err(ConnectionError::AuthTimeout);
            }
        };

        let Duplex { tx, rx } = duplex;
        {
            let mut core = self.shared.core.lock();
            if core.epoch != Some(epoch) {
                let _ = tx.send(OutboundFrame::Close);
                return Err(ConnectionError::Cancelled);
            }

            let heartbeat = CancellationToken::new();
            tokio::spawn(heartbeat_loop(
                tx.clone(),
                config.heartbeat_interval,
                heartbeat.clone(),
            ));
            let reader = tokio::spawn(read_loop(self.downgrade(), epoch, rx));

            if let Some(stale) = core.link.replace(Link {
                tx,
                reader,
                heartbeat,
            }) {
                stale.shutdown();
            }

            core.state.status = ConnectionStatus::Authenticated;
            core.state.user_id = Some(user_id.clone());
            core.state.reconnect_attempts = 0;
            core.failure_reported = false;
        }

        log::info!("ConnectionManager: authenticated as {}", user_id);
        self.shared
            .bus
            .emit(&ConnectionEvent::Authenticated { user_id });
        Ok(())
    }

    /// Read frames until the handshake reply arrives
    async fn await_handshake(&self, duplex: &mut Duplex) -> Result<String, ConnectionError> {
        while let Some(frame) = duplex.rx.recv().await {
            match frame {
                InboundFrame::Text(text) => match decode(&text) {
                    Ok(Decoded::Known(ServerMessage::Authenticated { user_id })) => {
                        return Ok(user_id);
                    }
                    Ok(Decoded::Known(ServerMessage::AuthError { message })) => {
                        return Err(ConnectionError::AuthFailed(message));
                    }
                    Ok(_) => {
                        log::debug!("ConnectionManager: ignoring message before handshake");
                    }
                    Err(e) => {
                        log::warn!("ConnectionManager: unparseable handshake frame: {}", e);
                        self.shared.bus.emit(&ConnectionEvent::ParseError {
                            raw: text,
                            error: e.to_string(),
                        });
                    }
                },
                InboundFrame::Closed { reason, .. } => {
                    return Err(ConnectionError::Disconnected(
                        reason.unwrap_or_else(|| "closed during handshake".to_string()),
                    ));
                }
            }
        }
        Err(ConnectionError::Disconnected("stream ended".to_string()))
    }

    fn handle_text(&self, text: &str) {
        let message = match decode(text) {
            Ok(Decoded::Known(message)) => message,
            Ok(Decoded::Other(value)) => {
                self.shared.bus.emit(&ConnectionEvent::Message(value));
                return;
            }
            Err(e) => {
                log::warn!("ConnectionManager: failed to parse message: {}", e);
                self.shared.bus.emit(&ConnectionEvent::ParseError {
                    raw: text.to_string(),
                    error: e.to_string(),
                });
                return;
            }
        };

        let event = match message {
            ServerMessage::Pong => {
                let at = Utc::now();
                self.shared.core.lock().state.last_heartbeat_at = Some(at);
                ConnectionEvent::HeartbeatAck { at }
            }
            ServerMessage::SessionUpdated { data } => ConnectionEvent::SessionUpdated(data),
            ServerMessage::AudioProcessed { data } => ConnectionEvent::AudioProcessed(data),
            ServerMessage::Transcription { data } => ConnectionEvent::Transcription(data),
            ServerMessage::AiResponse { data } => ConnectionEvent::AiResponse(data),
            ServerMessage::RealTimeFeedback { data } => ConnectionEvent::RealTimeFeedback(data),
            ServerMessage::Error { message } => {
                log::warn!("ConnectionManager: backend error: {}", message);
                ConnectionEvent::Error { message }
            }
            ServerMessage::Authenticated { .. } | ServerMessage::AuthError { .. } => {
                log::debug!("ConnectionManager: ignoring handshake reply after authentication");
                return;
            }
            ServerMessage::Unknown => return,
        };

        self.shared.bus.emit(&event);
    }

    /// The link for `epoch` ended
    fn on_closed(&self, epoch: Uuid, clean: bool, reason: Option<String>) {
        let link = {
            let mut core = self.shared.core.lock();
            if core.epoch != Some(epoch) {
                return;
            }
            let link = core.link.take();
            if link.is_some() && clean {
                core.state.status = ConnectionStatus::Disconnected;
            }
            link
        };

        // Called from the link's own reader task, so don't abort it
        let Some(link) = link else {
            return;
        };
        link.heartbeat.cancel();

        log::info!(
            "ConnectionManager: stream closed (clean: {}, reason: {:?})",
            clean,
            reason
        );
        self.shared
            .bus
            .emit(&ConnectionEvent::Disconnected { clean, reason });

        if !clean {
            self.schedule_reconnect(epoch);
        }
    }

    fn schedule_reconnect(&self, epoch: Uuid) {
        let exhausted = {
            let mut core = self.shared.core.lock();
            if core.epoch != Some(epoch) {
                return;
            }

            let max = core.config.max_reconnect_attempts;
            let attempt = core.state.reconnect_attempts + 1;

            if attempt > max {
                core.state.status = ConnectionStatus::Failed;
                let first = !core.failure_reported;
                core.failure_reported = true;
                Some((max, first))
            } else {
                core.state.reconnect_attempts = attempt;
                core.state.status = ConnectionStatus::Reconnecting;

                let delay = backoff_delay(core.config.reconnect_base_delay, attempt);
                log::info!(
                    "ConnectionManager: reconnecting in {:?} (attempt {}/{})",
                    delay,
                    attempt,
                    max
                );

                let weak = self.downgrade();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    ConnectionManager::from_shared(shared)
                        .run_reconnect(epoch, attempt)
                        .await;
                });
                if let Some(previous) = core.reconnect_timer.replace(timer) {
                    previous.abort();
                }
                None
            }
        };

        if let Some((attempts, first)) = exhausted {
            if first {
                log::error!(
                    "ConnectionManager: giving up after {} reconnection attempts",
                    attempts
                );
                self.shared
                    .bus
                    .emit(&ConnectionEvent::ReconnectionFailed { attempts });
            }
        }
    }

    async fn run_reconnect(&self, epoch: Uuid, attempt: u32) {
        {
            let mut core = self.shared.core.lock();
            let current = core.epoch == Some(epoch)
                && core.state.status == ConnectionStatus::Reconnecting
                && core.state.reconnect_attempts == attempt;
            if !current {
                log::debug!("ConnectionManager: stale reconnect timer (attempt {})", attempt);
                return;
            }
            // Our own handle; dropping it detaches rather than aborts
            core.reconnect_timer = None;
        }

        match self.establish(epoch).await {
            Ok(()) => log::info!("ConnectionManager: reconnected on attempt {}", attempt),
            Err(ConnectionError::Cancelled) => {}
            Err(e) => {
                log::warn!("ConnectionManager: reconnect attempt {} failed: {}", attempt, e);
                self.shared.bus.emit(&ConnectionEvent::Error {
                    message: e.to_string(),
                });
                self.schedule_reconnect(epoch);
            }
        }
    }
}

async fn read_loop(
    weak: Weak<Shared>,
    epoch: Uuid,
    mut rx: mpsc::UnboundedReceiver<InboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let manager = ConnectionManager::from_shared(shared);

        match frame {
            InboundFrame::Text(text) => manager.handle_text(&text),
            InboundFrame::Closed { clean, reason } => {
                manager.on_closed(epoch, clean, reason);
                return;
            }
        }
    }

    if let Some(shared) = weak.upgrade() {
        ConnectionManager::from_shared(shared).on_closed(
            epoch,
            false,
            Some("stream ended".to_string()),
        );
    }
}

async fn heartbeat_loop(
    tx: mpsc::UnboundedSender<OutboundFrame>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let ping = ClientMessage::ping(Utc::now().timestamp_millis());
                let json = match serde_json::to_string(&ping) {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("ConnectionManager: failed to encode ping: {}", e);
                        continue;
                    }
                };
                if tx.send(OutboundFrame::Text(json)).is_err() {
                    break;
                }
                log::trace!("ConnectionManager: ping sent");
            }
        }
    }
}

//! Persistent channel to the signaling server
//!
//! [`SocketChannel`] owns one shared connection, created lazily on the first
//! authenticated [`SocketChannel::connect`] and reused by every layer above
//! it. The channel is pure transport: it relays [`SignalMessage`]s and knows
//! nothing about call or room semantics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::signaling::{SignalMessage, SignalSender};

/// Errors raised by the transport layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Publish attempted with no live connection
    #[error("channel is not connected")]
    NotConnected,

    /// The server refused the bearer credential
    #[error("authentication failed")]
    AuthFailed,

    /// The connection attempt failed for a non-auth reason
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// An accepted message could not be written to the socket
    #[error("send failed: {0}")]
    SendError(String),

    /// The bounded reconnect budget ran out
    #[error("gave up after {0} connection attempts")]
    RetriesExhausted(u32),
}

/// Connection lifecycle of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No live connection
    Disconnected,
    /// A dial attempt is in flight
    Connecting,
    /// Messages flow
    Connected,
}

/// Transport tuning knobs
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Dial attempts per connect/re-dial cycle
    pub max_reconnect_attempts: u32,
    /// Base delay between attempts; attempt n waits n times this
    pub reconnect_backoff: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

/// The two halves of an established socket session
pub struct SocketConnection {
    /// Sink for outgoing messages
    pub outgoing: mpsc::Sender<SignalMessage>,
    /// Source of incoming messages; closes when the connection drops
    pub incoming: mpsc::Receiver<SignalMessage>,
}

/// Dials one authenticated session to the signaling server
///
/// Implementations wrap whatever concrete socket the deployment uses. An
/// [`TransportError::AuthFailed`] return is terminal for the connect cycle;
/// any other error is retried within the configured budget.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Establish one session using the given bearer token
    async fn connect(&self, token: &str) -> Result<SocketConnection, TransportError>;
}

/// The shared signaling channel
pub struct SocketChannel {
    connector: Arc<dyn SocketConnector>,
    config: ChannelConfig,
    state: Arc<RwLock<ChannelState>>,
    token: Arc<RwLock<Option<String>>>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<SignalMessage>>>>,
    incoming_tx: broadcast::Sender<SignalMessage>,
    shutdown_tx: watch::Sender<bool>,
}

impl SocketChannel {
    /// Create a channel over the given connector
    #[must_use]
    pub fn new(connector: Arc<dyn SocketConnector>, config: ChannelConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connector,
            config,
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            token: Arc::new(RwLock::new(None)),
            outgoing: Arc::new(RwLock::new(None)),
            incoming_tx,
            shutdown_tx,
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Subscribe to every incoming message
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.incoming_tx.subscribe()
    }

    /// Connect with a bearer token
    ///
    /// Idempotent: returns Ok immediately if already connected or connecting.
    /// Auth failure disconnects proactively and is never retried; other dial
    /// failures are retried with linear backoff up to the configured budget.
    #[tracing::instrument(skip(self, token))]
    pub async fn connect(&self, token: &str) -> Result<(), TransportError> {
        {
            let mut state = self.state.write().await;
            match *state {
                ChannelState::Connected | ChannelState::Connecting => {
                    debug!("connect ignored, channel already {:?}", *state);
                    return Ok(());
                }
                ChannelState::Disconnected => *state = ChannelState::Connecting,
            }
        }
        *self.token.write().await = Some(token.to_string());
        let _ = self.shutdown_tx.send(false);

        match self.dial_with_retries(token).await {
            Ok(()) => Ok(()),
            Err(err) => {
                *self.state.write().await = ChannelState::Disconnected;
                Err(err)
            }
        }
    }

    async fn dial_with_retries(&self, token: &str) -> Result<(), TransportError> {
        let mut last_err = TransportError::NotConnected;
        for attempt in 1..=self.config.max_reconnect_attempts {
            match self.connector.connect(token).await {
                Ok(conn) => {
                    self.install(conn).await;
                    info!(attempt, "signaling channel connected");
                    return Ok(());
                }
                Err(TransportError::AuthFailed) => {
                    warn!("authentication rejected, not retrying");
                    return Err(TransportError::AuthFailed);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "dial failed");
                    last_err = err;
                    if attempt < self.config.max_reconnect_attempts {
                        tokio::time::sleep(self.config.reconnect_backoff * attempt).await;
                    }
                }
            }
        }
        debug!(error = %last_err, "reconnect budget exhausted");
        Err(TransportError::RetriesExhausted(
            self.config.max_reconnect_attempts,
        ))
    }

    async fn install(&self, conn: SocketConnection) {
        *self.outgoing.write().await = Some(conn.outgoing);
        *self.state.write().await = ChannelState::Connected;

        let mut incoming = conn.incoming;
        let incoming_tx = self.incoming_tx.clone();
        let state = Arc::clone(&self.state);
        let outgoing = Arc::clone(&self.outgoing);
        let token = Arc::clone(&self.token);
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = incoming.recv() => {
                        match message {
                            Some(message) => {
                                let _ = incoming_tx.send(message);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("receive loop stopping on shutdown");
                            return;
                        }
                    }
                }
            }

            // Connection dropped underneath us: re-dial with the stored
            // token, within the same bounded budget.
            warn!("signaling connection lost");
            *state.write().await = ChannelState::Connecting;
            *outgoing.write().await = None;
            let stored = token.read().await.clone();
            let Some(stored) = stored else {
                *state.write().await = ChannelState::Disconnected;
                return;
            };

            for attempt in 1..=config.max_reconnect_attempts {
                if *shutdown_rx.borrow() {
                    *state.write().await = ChannelState::Disconnected;
                    return;
                }
                match connector.connect(&stored).await {
                    Ok(conn) => {
                        info!(attempt, "signaling channel re-established");
                        let mut next_incoming = conn.incoming;
                        *outgoing.write().await = Some(conn.outgoing);
                        *state.write().await = ChannelState::Connected;
                        loop {
                            tokio::select! {
                                message = next_incoming.recv() => {
                                    match message {
                                        Some(message) => {
                                            let _ = incoming_tx.send(message);
                                        }
                                        None => break,
                                    }
                                }
                                _ = shutdown_rx.changed() => {
                                    if *shutdown_rx.borrow() {
                                        return;
                                    }
                                }
                            }
                        }
                        warn!("re-established connection lost again");
                        *state.write().await = ChannelState::Connecting;
                        *outgoing.write().await = None;
                    }
                    Err(TransportError::AuthFailed) => {
                        warn!("re-dial refused by auth, giving up");
                        *state.write().await = ChannelState::Disconnected;
                        return;
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "re-dial failed");
                        tokio::time::sleep(config.reconnect_backoff * attempt).await;
                    }
                }
            }
            warn!("re-dial budget exhausted, channel resting disconnected");
            *state.write().await = ChannelState::Disconnected;
        });
    }

    /// Tear down the connection and reset the retry budget
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        *self.outgoing.write().await = None;
        *self.token.write().await = None;
        *self.state.write().await = ChannelState::Disconnected;
        info!("signaling channel disconnected");
    }
}

#[async_trait]
impl SignalSender for SocketChannel {
    async fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        let guard = self.outgoing.read().await;
        let Some(sender) = guard.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        sender
            .send(message)
            .await
            .map_err(|e| TransportError::SendError(e.to_string()))
    }
}

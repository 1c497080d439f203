//! Service orchestration
//!
//! [`RtcService`] owns the signaling channel and the two state machines,
//! routes every inbound message to the right one, and enforces the
//! call-xor-room exclusivity rule: the local media hardware belongs to
//! exactly one of them at a time.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::call::{CallConfig, CallError, CallManager};
use crate::feedback::{FeedbackSink, NullFeedback};
use crate::media::{MediaSource, SyntheticMediaSource};
use crate::peer::{PeerConfig, PeerFactory, WebRtcPeerFactory};
use crate::room::{RoomApi, RoomConfig, RoomError, RoomManager, RoomPhase};
use crate::signaling::{SignalMessage, SignalSender};
use crate::transport::{ChannelConfig, SocketChannel, SocketConnector, TransportError};
use crate::types::{CallId, MediaKind, RoomId, RoomKind, SocketId, UserId, UserInfo};

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The other concern already holds the media hardware
    #[error("a call and a room cannot be active at the same time")]
    Busy,

    /// The builder was not given a required collaborator
    #[error("service builder missing {0}")]
    Incomplete(&'static str),

    /// Call operation failed
    #[error(transparent)]
    Call(#[from] CallError),

    /// Room operation failed
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Transport operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct RtcConfig {
    /// Call state machine knobs
    pub call: CallConfig,
    /// Room state machine knobs
    pub room: RoomConfig,
    /// Transport knobs
    pub channel: ChannelConfig,
    /// Negotiation engine knobs
    pub peer: PeerConfig,
}

/// The real-time communication service
pub struct RtcService {
    channel: Arc<SocketChannel>,
    calls: Arc<CallManager>,
    rooms: Arc<RoomManager>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RtcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcService").finish_non_exhaustive()
    }
}

impl RtcService {
    /// Start building a service
    #[must_use]
    pub fn builder() -> RtcServiceBuilder {
        RtcServiceBuilder::new()
    }

    /// The call state machine
    #[must_use]
    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    /// The room state machine
    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Connect the signaling channel
    pub async fn connect(&self, token: &str) -> Result<(), ServiceError> {
        self.channel.connect(token).await?;
        Ok(())
    }

    /// Tear the signaling channel down
    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    /// Spawn the dispatch loop routing inbound messages to the managers
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) {
        let mut dispatch = self.dispatch.lock().await;
        if dispatch.is_some() {
            return;
        }
        let mut incoming = self.channel.subscribe();
        let calls = Arc::clone(&self.calls);
        let rooms = Arc::clone(&self.rooms);
        *dispatch = Some(tokio::spawn(async move {
            loop {
                let message = match incoming.recv().await {
                    Ok(message) => message,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "dispatch loop lagged behind the channel");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if message.is_call() {
                    // An invite cannot interrupt an active room
                    if matches!(message, SignalMessage::CallIncoming { .. })
                        && rooms.is_active().await
                    {
                        warn!("invite ignored while a room is active");
                        continue;
                    }
                    calls.handle_signal(message).await;
                } else {
                    rooms.handle_signal(message).await;
                }
            }
        }));
        info!("rtc service dispatching");
    }

    /// Stop the dispatch loop
    pub async fn stop(&self) {
        if let Some(task) = self.dispatch.lock().await.take() {
            task.abort();
        }
    }

    /// Start an outbound call, unless a room is active
    pub async fn initiate_call(
        &self,
        target_user_id: UserId,
        kind: MediaKind,
    ) -> Result<CallId, ServiceError> {
        if self.rooms.is_active().await {
            return Err(ServiceError::Busy);
        }
        Ok(self.calls.initiate_call(target_user_id, kind).await?)
    }

    /// Create a room, unless a call is active
    pub async fn create_room(
        &self,
        name: &str,
        kind: RoomKind,
        require_approval: bool,
    ) -> Result<RoomId, ServiceError> {
        if self.calls.is_active().await {
            return Err(ServiceError::Busy);
        }
        Ok(self.rooms.create_room(name, kind, require_approval).await?)
    }

    /// Join an open room, unless a call is active
    pub async fn join_room(&self, room_id: &RoomId) -> Result<(), ServiceError> {
        if self.calls.is_active().await {
            return Err(ServiceError::Busy);
        }
        self.rooms.join_room(room_id).await?;
        Ok(())
    }

    /// Ask to join an approval-gated room, unless a call is active
    pub async fn request_to_join(&self, room_id: &RoomId) -> Result<RoomPhase, ServiceError> {
        if self.calls.is_active().await {
            return Err(ServiceError::Busy);
        }
        Ok(self.rooms.request_to_join(room_id).await?)
    }
}

/// Builder wiring the service's collaborators, with sensible defaults for
/// the optional ones
pub struct RtcServiceBuilder {
    connector: Option<Arc<dyn SocketConnector>>,
    api: Option<Arc<dyn RoomApi>>,
    media: Option<Arc<dyn MediaSource>>,
    peers: Option<Arc<dyn PeerFactory>>,
    feedback: Option<Arc<dyn FeedbackSink>>,
    local_user: Option<UserInfo>,
    local_socket: Option<SocketId>,
    config: RtcConfig,
}

impl RtcServiceBuilder {
    fn new() -> Self {
        Self {
            connector: None,
            api: None,
            media: None,
            peers: None,
            feedback: None,
            local_user: None,
            local_socket: None,
            config: RtcConfig::default(),
        }
    }

    /// Socket connector for the signaling channel (required)
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// External room resource (required)
    #[must_use]
    pub fn room_api(mut self, api: Arc<dyn RoomApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Capture source; defaults to the synthetic in-process source
    #[must_use]
    pub fn media(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Peer backend factory; defaults to the WebRTC engine
    #[must_use]
    pub fn peers(mut self, peers: Arc<dyn PeerFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Feedback sink; defaults to the tracing null sink
    #[must_use]
    pub fn feedback(mut self, feedback: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    /// The local user's display info (required)
    #[must_use]
    pub fn local_user(mut self, user: UserInfo) -> Self {
        self.local_user = Some(user);
        self
    }

    /// The local socket id assigned by the signaling server (required)
    #[must_use]
    pub fn local_socket(mut self, socket: SocketId) -> Self {
        self.local_socket = Some(socket);
        self
    }

    /// Override the default configuration
    #[must_use]
    pub fn config(mut self, config: RtcConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire everything together
    pub fn build(self) -> Result<RtcService, ServiceError> {
        let connector = self
            .connector
            .ok_or(ServiceError::Incomplete("connector"))?;
        let api = self.api.ok_or(ServiceError::Incomplete("room_api"))?;
        let local_user = self
            .local_user
            .ok_or(ServiceError::Incomplete("local_user"))?;
        let local_socket = self
            .local_socket
            .ok_or(ServiceError::Incomplete("local_socket"))?;

        let media = self
            .media
            .unwrap_or_else(|| Arc::new(SyntheticMediaSource::new()));
        let peers = self
            .peers
            .unwrap_or_else(|| Arc::new(WebRtcPeerFactory::new(self.config.peer.clone())));
        let feedback = self.feedback.unwrap_or_else(|| Arc::new(NullFeedback));

        let channel = Arc::new(SocketChannel::new(connector, self.config.channel.clone()));
        let signaling = Arc::clone(&channel) as Arc<dyn SignalSender>;

        let calls = Arc::new(CallManager::new(
            Arc::clone(&signaling),
            Arc::clone(&media),
            Arc::clone(&peers),
            Arc::clone(&feedback),
            local_user.clone(),
            self.config.call.clone(),
        ));
        let rooms = Arc::new(RoomManager::new(
            api,
            signaling,
            media,
            peers,
            feedback,
            local_user,
            local_socket,
            self.config.room.clone(),
        ));

        Ok(RtcService {
            channel,
            calls,
            rooms,
            dispatch: Mutex::new(None),
        })
    }
}

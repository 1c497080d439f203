//! One negotiated media session per remote party
//!
//! [`PeerLink`] wraps a negotiation backend and enforces the candidate
//! ordering rule: ICE candidates arriving before the remote description are
//! queued and flushed exactly once, in arrival order, immediately after the
//! remote description is applied. [`WebRtcPeerBackend`] is the production
//! backend over the `webrtc` crate; tests substitute mocks through the
//! [`PeerBackend`] seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::media::LocalTrack;
use crate::types::{IceCandidate, MediaKind, SdpKind, SessionDescription, SocketId, UserId};

/// Errors raised while negotiating or driving a peer session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// The negotiation engine failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Operation attempted on a closed link
    #[error("peer link is closed")]
    Closed,

    /// A description or candidate could not be applied
    #[error("negotiation error: {0}")]
    Negotiation(String),
}

/// Observable connection state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Freshly created
    New,
    /// Connectivity checks in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Possibly transient loss
    Disconnected,
    /// Unrecoverable loss
    Failed,
    /// Deliberately shut
    Closed,
}

/// Who is on the other end of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    /// The remote party's socket
    pub socket_id: SocketId,
    /// The remote party's user id
    pub user_id: UserId,
}

/// Negotiation engine tuning
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// STUN server URLs handed to the ICE agent
    pub stun_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// The negotiation engine behind a [`PeerLink`]
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Create an offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the remote party's description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Attach a local capture track to the outgoing media
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError>;

    /// Swap the outgoing video track in place, without renegotiation
    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), PeerError>;

    /// Shut the session down
    async fn close(&self) -> Result<(), PeerError>;

    /// Observe connection state transitions
    fn state_changes(&self) -> broadcast::Receiver<LinkState>;

    /// Observe locally discovered candidates for trickling to the remote
    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate>;
}

/// Creates backends; injected so state machines stay testable
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create one fresh backend
    async fn create(&self) -> Result<Arc<dyn PeerBackend>, PeerError>;
}

struct Negotiation {
    remote_set: bool,
    pending: Vec<IceCandidate>,
}

/// One peer session with candidate buffering
pub struct PeerLink {
    target: PeerTarget,
    backend: Arc<dyn PeerBackend>,
    negotiation: Mutex<Negotiation>,
    closed: AtomicBool,
}

impl PeerLink {
    /// Wrap a backend for the given remote party
    #[must_use]
    pub fn new(target: PeerTarget, backend: Arc<dyn PeerBackend>) -> Self {
        Self {
            target,
            backend,
            negotiation: Mutex::new(Negotiation {
                remote_set: false,
                pending: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// The remote party this link speaks to
    #[must_use]
    pub fn target(&self) -> &PeerTarget {
        &self.target
    }

    /// Whether the link has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Create an offer (sets the local description)
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        self.backend.create_offer().await
    }

    /// Create an answer (sets the local description)
    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        self.backend.create_answer().await
    }

    /// Attach a local track
    pub async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        self.check_open()?;
        self.backend.add_track(track).await
    }

    /// Swap the outgoing video track
    pub async fn replace_video_track(
        &self,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<(), PeerError> {
        self.check_open()?;
        self.backend.replace_video_track(track).await
    }

    /// Apply the remote description, then flush buffered candidates in FIFO
    /// arrival order. Each buffered candidate is applied exactly once.
    pub async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        self.check_open()?;
        let mut negotiation = self.negotiation.lock().await;
        self.backend.set_remote_description(desc).await?;
        negotiation.remote_set = true;
        let pending = std::mem::take(&mut negotiation.pending);
        if !pending.is_empty() {
            debug!(
                peer = %self.target.socket_id,
                count = pending.len(),
                "flushing buffered candidates"
            );
        }
        for candidate in pending {
            self.backend.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Apply a remote candidate now, or buffer it until the remote
    /// description is set
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.check_open()?;
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.remote_set {
            self.backend.add_ice_candidate(candidate).await
        } else {
            negotiation.pending.push(candidate);
            Ok(())
        }
    }

    /// Observe connection state transitions
    #[must_use]
    pub fn state_changes(&self) -> broadcast::Receiver<LinkState> {
        self.backend.state_changes()
    }

    /// Observe locally discovered candidates
    #[must_use]
    pub fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.backend.local_candidates()
    }

    /// Close the link. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.backend.close().await {
            warn!(peer = %self.target.socket_id, error = %err, "close failed");
        }
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> LinkState {
    match state {
        RTCIceConnectionState::Checking => LinkState::Connecting,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            LinkState::Connected
        }
        RTCIceConnectionState::Disconnected => LinkState::Disconnected,
        RTCIceConnectionState::Failed => LinkState::Failed,
        RTCIceConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

/// Production backend over the `webrtc` crate
pub struct WebRtcPeerBackend {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    state_tx: broadcast::Sender<LinkState>,
    candidate_tx: broadcast::Sender<IceCandidate>,
}

impl WebRtcPeerBackend {
    /// Build a peer connection with default codecs and interceptors
    pub async fn new(config: &PeerConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Backend(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::Backend(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::Backend(e.to_string()))?,
        );

        let (state_tx, _) = broadcast::channel(32);
        let (candidate_tx, _) = broadcast::channel(64);

        let state_out = state_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let _ = state_out.send(map_ice_state(state));
            Box::pin(async {})
        }));

        let candidate_out = candidate_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_out = candidate_out.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = candidate_out.send(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "discarding unserializable candidate");
                        }
                    }
                }
            })
        }));

        Ok(Self {
            pc,
            video_sender: Mutex::new(None),
            state_tx,
            candidate_tx,
        })
    }

    async fn make_rtc_track(
        track: &LocalTrack,
    ) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            "huddle".to_string(),
        ))
    }
}

#[async_trait]
impl PeerBackend for WebRtcPeerBackend {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let rtc_desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc
            .set_remote_description(rtc_desc)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let kind = track.kind();
        let rtc_track = Self::make_rtc_track(&track).await;
        let sender = self
            .pc
            .add_track(rtc_track)
            .await
            .map_err(|e| PeerError::Backend(e.to_string()))?;
        if kind == MediaKind::Video {
            *self.video_sender.lock().await = Some(sender);
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), PeerError> {
        let guard = self.video_sender.lock().await;
        let Some(sender) = guard.as_ref() else {
            return Err(PeerError::Negotiation("no outgoing video sender".into()));
        };
        let replacement = match track {
            Some(track) => Some(Self::make_rtc_track(&track).await),
            None => None,
        };
        sender
            .replace_track(replacement)
            .await
            .map_err(|e| PeerError::Backend(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Backend(e.to_string()))?;
        let _ = self.state_tx.send(LinkState::Closed);
        Ok(())
    }

    fn state_changes(&self) -> broadcast::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.candidate_tx.subscribe()
    }
}

/// Factory producing [`WebRtcPeerBackend`]s from one shared config
pub struct WebRtcPeerFactory {
    config: PeerConfig,
}

impl WebRtcPeerFactory {
    /// Create a factory with the given ICE configuration
    #[must_use]
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }
}

impl Default for WebRtcPeerFactory {
    fn default() -> Self {
        Self::new(PeerConfig::default())
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerBackend>, PeerError> {
        Ok(Arc::new(WebRtcPeerBackend::new(&self.config).await?))
    }
}

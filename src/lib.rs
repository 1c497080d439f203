//! huddle-rtc - Real-time call and voice-room core for the Huddle client
//!
//! This library is the signaling and connection-lifecycle layer behind
//! Huddle's live features: one-to-one audio/video calls and multi-party
//! voice/video/live rooms over a mesh of direct peer connections. It
//! provides:
//!
//! - **Call sessions**: an explicit Idle / RingingOutbound / RingingInbound /
//!   Connected state machine with deferred inbound media acquisition and
//!   grace-timer recovery for transient connection loss
//! - **Rooms**: membership, speaker/listener roles, raised hands, admission
//!   control, screen sharing, and deterministic joiner-offers mesh fan-out
//! - **Candidate ordering**: ICE candidates are buffered until the remote
//!   description applies, then flushed exactly once in arrival order
//! - **Pluggable edges**: transport, media capture, peer negotiation, the
//!   room REST resource, and user feedback all live behind traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use huddle_rtc::{RtcService, UserInfo, SocketId, MediaKind, UserId};
//! use std::sync::Arc;
//!
//! # async fn example(connector: Arc<dyn huddle_rtc::SocketConnector>,
//! #                  api: Arc<dyn huddle_rtc::RoomApi>) -> anyhow::Result<()> {
//! let service = RtcService::builder()
//!     .connector(connector)
//!     .room_api(api)
//!     .local_user(UserInfo::new("u1", "Alice"))
//!     .local_socket(SocketId::new("s1"))
//!     .build()?;
//!
//! service.connect("bearer-token").await?;
//! service.start().await;
//!
//! let call_id = service.initiate_call(UserId::new("u2"), MediaKind::Video).await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Shared identifiers and data structures
pub mod types;

/// Wire protocol spoken with the signaling server
pub mod signaling;

/// Persistent channel to the signaling server
pub mod transport;

/// Local capture as a managed resource
pub mod media;

/// Peer connection management and candidate buffering
pub mod peer;

/// One-to-one call session state machine
pub mod call;

/// Multi-party voice/video room state machine
pub mod room;

/// Best-effort feedback side channels
pub mod feedback;

/// Service orchestration
pub mod service;

pub use call::{CallConfig, CallError, CallEvent, CallManager, CallPhase, CallSnapshot, EndReason};
pub use feedback::{Cue, FeedbackSink, NullFeedback};
pub use media::{LocalStream, LocalTrack, MediaError, MediaSource, SyntheticMediaSource};
pub use peer::{
    LinkState, PeerBackend, PeerConfig, PeerError, PeerFactory, PeerLink, PeerTarget,
    WebRtcPeerBackend, WebRtcPeerFactory,
};
pub use room::{
    ApiError, JoinDecision, ParticipantView, RoomApi, RoomConfig, RoomError, RoomEvent,
    RoomInfo, RoomManager, RoomPhase, RoomSnapshot, RoomView,
};
pub use service::{RtcConfig, RtcService, RtcServiceBuilder, ServiceError};
pub use signaling::{RoomPeer, SignalMessage, SignalSender};
pub use transport::{
    ChannelConfig, ChannelState, SocketChannel, SocketConnection, SocketConnector, TransportError,
};
pub use types::{
    CallDirection, CallId, IceCandidate, JoinRequest, MediaKind, RaisedHand, RoomId, RoomKind,
    SdpKind, SessionDescription, SocketId, UserId, UserInfo,
};

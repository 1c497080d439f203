//! Wire protocol spoken over the transport channel
//!
//! Every message is a tagged JSON object whose `event` field selects the
//! variant. Call-scoped events are addressed to a single user; room-scoped
//! events are relayed within a room broadcast group by the server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;
use crate::types::{
    CallId, IceCandidate, MediaKind, RoomId, SessionDescription, SocketId, UserId, UserInfo,
};

/// A peer listed in the room snapshot sent to a new joiner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPeer {
    /// The peer's user identifier
    pub user_id: UserId,
    /// The peer's current socket identifier
    pub socket_id: SocketId,
}

/// Messages exchanged with the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SignalMessage {
    /// Outbound call invite
    #[serde(rename = "call:initiate", rename_all = "camelCase")]
    CallInitiate {
        /// Call identifier
        call_id: CallId,
        /// Invited user
        target_user_id: UserId,
        /// Audio or video call
        #[serde(rename = "type")]
        kind: MediaKind,
        /// The caller's session description
        offer: SessionDescription,
        /// Caller display info
        caller: UserInfo,
    },
    /// Inbound call invite
    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    CallIncoming {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller_id: UserId,
        /// Audio or video call
        #[serde(rename = "type")]
        kind: MediaKind,
        /// The caller's session description
        offer: SessionDescription,
        /// Caller display info
        caller: UserInfo,
    },
    /// Answer to a call invite
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    CallAnswer {
        /// Call identifier
        call_id: CallId,
        /// Recipient of the answer
        target_user_id: UserId,
        /// The callee's session description
        answer: SessionDescription,
    },
    /// Trickled candidate for a 1:1 call
    #[serde(rename = "call:ice-candidate", rename_all = "camelCase")]
    CallIceCandidate {
        /// Call identifier
        call_id: CallId,
        /// Recipient of the candidate
        target_user_id: UserId,
        /// The candidate
        candidate: IceCandidate,
    },
    /// Local hangup notice
    #[serde(rename = "call:end", rename_all = "camelCase")]
    CallEnd {
        /// Call identifier
        call_id: CallId,
        /// Remote party
        target_user_id: UserId,
    },
    /// Remote hangup notice
    #[serde(rename = "call:ended", rename_all = "camelCase")]
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Remote party
        target_user_id: UserId,
    },
    /// Local rejection of an inbound invite
    #[serde(rename = "call:reject", rename_all = "camelCase")]
    CallReject {
        /// Call identifier
        call_id: CallId,
        /// The caller being rejected
        target_user_id: UserId,
    },
    /// Remote rejection of an outbound invite
    #[serde(rename = "call:rejected", rename_all = "camelCase")]
    CallRejected {
        /// Call identifier
        call_id: CallId,
        /// Remote party
        target_user_id: UserId,
    },
    /// Announce entry into a room broadcast group
    #[serde(rename = "voiceroom:join", rename_all = "camelCase")]
    RoomJoin {
        /// Room identifier
        room_id: RoomId,
        /// The joining user
        user: UserInfo,
    },
    /// Announce departure from a room broadcast group
    #[serde(rename = "voiceroom:leave", rename_all = "camelCase")]
    RoomLeave {
        /// Room identifier
        room_id: RoomId,
        /// The leaving user
        user_id: UserId,
    },
    /// Participants already present, sent to the new joiner
    #[serde(rename = "voiceroom:existing-users", rename_all = "camelCase")]
    RoomExistingUsers {
        /// Room identifier
        room_id: RoomId,
        /// Peers the joiner must offer to
        users: Vec<RoomPeer>,
    },
    /// A new participant entered the room
    #[serde(rename = "voiceroom:user-joined", rename_all = "camelCase")]
    RoomUserJoined {
        /// Room identifier
        room_id: RoomId,
        /// The newcomer's socket
        socket_id: SocketId,
        /// The newcomer
        user: UserInfo,
    },
    /// A participant left the room
    #[serde(rename = "voiceroom:user-left", rename_all = "camelCase")]
    RoomUserLeft {
        /// Room identifier
        room_id: RoomId,
        /// The departed socket
        socket_id: SocketId,
        /// The departed user
        user_id: UserId,
    },
    /// Mesh offer relayed to one participant
    #[serde(rename = "voiceroom:offer", rename_all = "camelCase")]
    RoomOffer {
        /// Room identifier
        room_id: RoomId,
        /// Sender's socket
        from_socket_id: SocketId,
        /// Sender's user id
        from_user_id: UserId,
        /// Addressee's socket
        target_socket_id: SocketId,
        /// The offer
        payload: SessionDescription,
    },
    /// Mesh answer relayed to one participant
    #[serde(rename = "voiceroom:answer", rename_all = "camelCase")]
    RoomAnswer {
        /// Room identifier
        room_id: RoomId,
        /// Sender's socket
        from_socket_id: SocketId,
        /// Sender's user id
        from_user_id: UserId,
        /// Addressee's socket
        target_socket_id: SocketId,
        /// The answer
        payload: SessionDescription,
    },
    /// Mesh candidate relayed to one participant
    #[serde(rename = "voiceroom:ice-candidate", rename_all = "camelCase")]
    RoomIceCandidate {
        /// Room identifier
        room_id: RoomId,
        /// Sender's socket
        from_socket_id: SocketId,
        /// Addressee's socket
        target_socket_id: SocketId,
        /// The candidate
        payload: IceCandidate,
    },
    /// A participant's mute state changed
    #[serde(rename = "voiceroom:mute-change", rename_all = "camelCase")]
    RoomMuteChange {
        /// Room identifier
        room_id: RoomId,
        /// Whose state changed
        user_id: UserId,
        /// New mute state
        is_muted: bool,
    },
    /// A participant's camera state changed
    #[serde(rename = "voiceroom:video-change", rename_all = "camelCase")]
    RoomVideoChange {
        /// Room identifier
        room_id: RoomId,
        /// Whose state changed
        user_id: UserId,
        /// New camera-off state
        is_video_off: bool,
    },
    /// Local screen-share start announcement
    #[serde(rename = "voiceroom:screen-start", rename_all = "camelCase")]
    RoomScreenStart {
        /// Room identifier
        room_id: RoomId,
        /// Who is sharing
        user_id: UserId,
    },
    /// Local screen-share stop announcement
    #[serde(rename = "voiceroom:screen-stop", rename_all = "camelCase")]
    RoomScreenStop {
        /// Room identifier
        room_id: RoomId,
        /// Who stopped sharing
        user_id: UserId,
    },
    /// A remote participant started sharing
    #[serde(rename = "voiceroom:screen-started", rename_all = "camelCase")]
    RoomScreenStarted {
        /// Room identifier
        room_id: RoomId,
        /// Who is sharing
        user_id: UserId,
    },
    /// A remote participant stopped sharing
    #[serde(rename = "voiceroom:screen-stopped", rename_all = "camelCase")]
    RoomScreenStopped {
        /// Room identifier
        room_id: RoomId,
        /// Who stopped sharing
        user_id: UserId,
    },
    /// A join request arrived for the room admin
    #[serde(rename = "voiceroom:join-request", rename_all = "camelCase")]
    RoomJoinRequest {
        /// Room identifier
        room_id: RoomId,
        /// Who wants in
        user: UserInfo,
    },
    /// The admin approved our join request
    #[serde(rename = "voiceroom:request-approved", rename_all = "camelCase")]
    RoomRequestApproved {
        /// Room identifier
        room_id: RoomId,
    },
    /// The admin rejected our join request
    #[serde(rename = "voiceroom:request-rejected", rename_all = "camelCase")]
    RoomRequestRejected {
        /// Room identifier
        room_id: RoomId,
    },
    /// The room was deleted by its admin
    #[serde(rename = "voiceroom:room-deleted", rename_all = "camelCase")]
    RoomDeleted {
        /// Display name of the deleted room
        room_name: String,
    },
    /// Server-confirmed hand raise or lower
    #[serde(rename = "voiceroom:hand-toggled", rename_all = "camelCase")]
    RoomHandToggled {
        /// Whose hand
        user_id: UserId,
        /// Their display name
        name: String,
        /// Raised or lowered
        is_raised: bool,
    },
    /// A participant was promoted to speaker
    #[serde(rename = "voiceroom:user-promoted", rename_all = "camelCase")]
    RoomUserPromoted {
        /// The promoted user
        user_id: UserId,
    },
    /// A participant was demoted to listener
    #[serde(rename = "voiceroom:user-demoted", rename_all = "camelCase")]
    RoomUserDemoted {
        /// The demoted user
        user_id: UserId,
    },
}

impl SignalMessage {
    /// The wire event name of this message
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CallInitiate { .. } => "call:initiate",
            Self::CallIncoming { .. } => "call:incoming",
            Self::CallAnswer { .. } => "call:answer",
            Self::CallIceCandidate { .. } => "call:ice-candidate",
            Self::CallEnd { .. } => "call:end",
            Self::CallEnded { .. } => "call:ended",
            Self::CallReject { .. } => "call:reject",
            Self::CallRejected { .. } => "call:rejected",
            Self::RoomJoin { .. } => "voiceroom:join",
            Self::RoomLeave { .. } => "voiceroom:leave",
            Self::RoomExistingUsers { .. } => "voiceroom:existing-users",
            Self::RoomUserJoined { .. } => "voiceroom:user-joined",
            Self::RoomUserLeft { .. } => "voiceroom:user-left",
            Self::RoomOffer { .. } => "voiceroom:offer",
            Self::RoomAnswer { .. } => "voiceroom:answer",
            Self::RoomIceCandidate { .. } => "voiceroom:ice-candidate",
            Self::RoomMuteChange { .. } => "voiceroom:mute-change",
            Self::RoomVideoChange { .. } => "voiceroom:video-change",
            Self::RoomScreenStart { .. } => "voiceroom:screen-start",
            Self::RoomScreenStop { .. } => "voiceroom:screen-stop",
            Self::RoomScreenStarted { .. } => "voiceroom:screen-started",
            Self::RoomScreenStopped { .. } => "voiceroom:screen-stopped",
            Self::RoomJoinRequest { .. } => "voiceroom:join-request",
            Self::RoomRequestApproved { .. } => "voiceroom:request-approved",
            Self::RoomRequestRejected { .. } => "voiceroom:request-rejected",
            Self::RoomDeleted { .. } => "voiceroom:room-deleted",
            Self::RoomHandToggled { .. } => "voiceroom:hand-toggled",
            Self::RoomUserPromoted { .. } => "voiceroom:user-promoted",
            Self::RoomUserDemoted { .. } => "voiceroom:user-demoted",
        }
    }

    /// Whether this message belongs to the 1:1 call protocol
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.event_name().starts_with("call:")
    }

    /// Whether this message belongs to the room protocol
    #[must_use]
    pub fn is_room(&self) -> bool {
        self.event_name().starts_with("voiceroom:")
    }
}

/// Outbound half of the signaling channel, as seen by the state machines
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Publish one message to the signaling server
    async fn send(&self, message: SignalMessage) -> Result<(), TransportError>;
}

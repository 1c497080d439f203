//! Multi-party voice/video room state machine
//!
//! Room membership is mesh topology: the local client keeps one peer link
//! per other participant, keyed by socket id. Offer direction is
//! deterministic: the joiner offers to every existing member, existing
//! members passively await the newcomer's offer. At most one room is joined
//! at a time.

use std::collections::HashMap;
use std::time::Duration;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::feedback::FeedbackSink;
use crate::media::{LocalStream, MediaError, MediaSource};
use crate::peer::{PeerError, PeerFactory, PeerLink, PeerTarget};
use crate::signaling::{SignalMessage, SignalSender};
use crate::transport::TransportError;
use crate::types::{
    IceCandidate, JoinRequest, RaisedHand, RoomId, RoomKind, SessionDescription, SocketId, UserId,
    UserInfo,
};

/// Errors reported by the external room resource
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The server explicitly refused (room full, not admin, ...)
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The request never completed
    #[error("network error: {0}")]
    Network(String),
}

/// Errors raised by room operations
#[derive(Debug, Error)]
pub enum RoomError {
    /// Admin-only operation attempted by a non-admin; checked locally
    /// before any network call
    #[error("local user is not the room admin")]
    NotAdmin,

    /// The operation needs an active room
    #[error("not in a room")]
    NotInRoom,

    /// Already joined or waiting on a room
    #[error("already in a room")]
    AlreadyInRoom,

    /// The operation is not legal right now
    #[error("invalid room state: {0}")]
    InvalidState(&'static str),

    /// The external room resource failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Local capture failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Peer negotiation failed
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// The signaling channel refused the message
    #[error(transparent)]
    Signal(#[from] TransportError),
}

/// Server-side description of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    /// Room identifier
    pub id: RoomId,
    /// Display name
    pub name: String,
    /// Voice, video, or live
    pub kind: RoomKind,
    /// Whether joins need admin approval
    pub require_approval: bool,
    /// The admin
    pub creator_id: UserId,
}

/// Server-reported room state used to seed a join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    /// The room
    pub room: RoomInfo,
    /// Users permitted to transmit
    pub speakers: Vec<UserId>,
    /// Audience-only users
    pub listeners: Vec<UserId>,
    /// Outstanding hand raises
    pub raised_hands: Vec<RaisedHand>,
}

/// Server verdict on a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    /// No approval needed; join proceeds now
    Admitted(RoomSnapshot),
    /// An admin must approve; the verdict arrives as a broadcast later
    Deferred,
}

/// The external room resource (REST), consumed behind this seam
#[async_trait]
pub trait RoomApi: Send + Sync {
    /// Allocate a room
    async fn create_room(
        &self,
        name: &str,
        kind: RoomKind,
        require_approval: bool,
    ) -> Result<RoomInfo, ApiError>;

    /// Join directly (open rooms, or after approval)
    async fn join_room(&self, room_id: &RoomId) -> Result<RoomSnapshot, ApiError>;

    /// Ask to join an approval-gated room
    async fn request_join(&self, room_id: &RoomId) -> Result<JoinDecision, ApiError>;

    /// Admit a pending requester (admin)
    async fn approve_request(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), ApiError>;

    /// Turn a pending requester away (admin)
    async fn reject_request(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), ApiError>;

    /// Post a hand raise/lower intent
    async fn toggle_hand(&self, room_id: &RoomId) -> Result<(), ApiError>;

    /// Grant a listener the speaker role (admin)
    async fn promote(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), ApiError>;

    /// Move a speaker back to the audience (admin)
    async fn demote(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), ApiError>;

    /// Leave the room
    async fn leave_room(&self, room_id: &RoomId) -> Result<(), ApiError>;

    /// Delete the room (admin)
    async fn delete_room(&self, room_id: &RoomId) -> Result<(), ApiError>;
}

/// Room lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Not joined, nothing pending
    NotInRoom,
    /// An approval-gated join request is outstanding
    WaitingApproval,
    /// Joined
    InRoom,
}

/// Room tuning knobs
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How long to wait for an approval verdict; `None` waits forever
    pub join_request_timeout: Option<Duration>,
    /// Prefix for invite links copied to the clipboard
    pub invite_link_base: String,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            join_request_timeout: Some(Duration::from_secs(60)),
            invite_link_base: "https://huddle.app/voicerooms".to_string(),
        }
    }
}

/// Room lifecycle notifications for the UI
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// We are in the room
    Joined {
        /// Room identifier
        room_id: RoomId,
    },
    /// We left, were removed, or the room died
    Left {
        /// Room identifier
        room_id: RoomId,
    },
    /// Our join request is waiting on an admin
    ApprovalPending {
        /// Room identifier
        room_id: RoomId,
    },
    /// Our join request was approved
    JoinApproved {
        /// Room identifier
        room_id: RoomId,
    },
    /// Our join request was rejected
    JoinRejected {
        /// Room identifier
        room_id: RoomId,
    },
    /// No verdict arrived within the configured wait
    JoinRequestTimedOut {
        /// Room identifier
        room_id: RoomId,
    },
    /// A join request arrived for us to decide (admin)
    JoinRequestReceived {
        /// Who wants in
        user: UserInfo,
    },
    /// Someone entered the room
    ParticipantJoined {
        /// The newcomer
        user: UserInfo,
    },
    /// Someone left the room
    ParticipantLeft {
        /// The departed user
        user_id: UserId,
    },
    /// A hand was raised or lowered (server-confirmed)
    HandToggled {
        /// Whose hand
        user_id: UserId,
        /// Raised or lowered
        is_raised: bool,
    },
    /// A listener became a speaker
    Promoted {
        /// The promoted user
        user_id: UserId,
    },
    /// A speaker became a listener
    Demoted {
        /// The demoted user
        user_id: UserId,
    },
    /// A participant's mute state changed (or our own forced mute)
    MuteChanged {
        /// Whose state
        user_id: UserId,
        /// New state
        is_muted: bool,
    },
    /// A participant's camera state changed
    VideoChanged {
        /// Whose state
        user_id: UserId,
        /// New state
        is_video_off: bool,
    },
    /// A screen share started
    ScreenShareStarted {
        /// Who is sharing
        user_id: UserId,
    },
    /// A screen share stopped
    ScreenShareStopped {
        /// Who stopped
        user_id: UserId,
    },
    /// The room was deleted by its admin
    RoomDeleted {
        /// Display name of the dead room
        room_name: String,
    },
}

/// One remote participant as the UI sees them
#[derive(Debug, Clone)]
pub struct ParticipantView {
    /// User identifier
    pub user_id: UserId,
    /// Their socket
    pub socket_id: SocketId,
    /// Display info, once known
    pub info: Option<UserInfo>,
    /// Their mute flag
    pub is_muted: bool,
    /// Their camera flag
    pub is_video_off: bool,
    /// Whether they are sharing a screen
    pub is_screen_sharing: bool,
    /// Whether a peer link exists
    pub connected: bool,
}

/// Read model of the joined room
#[derive(Debug, Clone)]
pub struct RoomView {
    /// The room
    pub room: RoomInfo,
    /// Whether the local user is the admin
    pub is_admin: bool,
    /// Everyone else in the room
    pub participants: Vec<ParticipantView>,
    /// Users permitted to transmit
    pub speakers: Vec<UserId>,
    /// Audience-only users
    pub listeners: Vec<UserId>,
    /// Outstanding hand raises, in request order
    pub raised_hands: Vec<RaisedHand>,
    /// Join requests awaiting our verdict (admin only)
    pub pending_requests: Vec<JoinRequest>,
    /// Our mute flag
    pub is_muted: bool,
    /// Our camera flag
    pub is_video_off: bool,
    /// Whether we are sharing a screen
    pub is_screen_sharing: bool,
}

struct Participant {
    user_id: UserId,
    socket_id: SocketId,
    info: Option<UserInfo>,
    is_muted: bool,
    is_video_off: bool,
    is_screen_sharing: bool,
    link: Option<Arc<PeerLink>>,
}

struct ActiveRoom {
    info: RoomInfo,
    is_admin: bool,
    participants: HashMap<SocketId, Participant>,
    speakers: Vec<UserId>,
    listeners: Vec<UserId>,
    raised_hands: Vec<RaisedHand>,
    pending_requests: Vec<JoinRequest>,
    // Candidates that arrived before that peer's description exchange began
    early_candidates: HashMap<SocketId, Vec<IceCandidate>>,
    stream: LocalStream,
    screen_stream: Option<LocalStream>,
    is_muted: bool,
    is_video_off: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveRoom {
    /// Put a user in exactly one role set
    fn assign_role(&mut self, user_id: &UserId, speaker: bool) {
        self.speakers.retain(|u| u != user_id);
        self.listeners.retain(|u| u != user_id);
        if speaker {
            self.speakers.push(user_id.clone());
        } else {
            self.listeners.push(user_id.clone());
        }
    }

    fn drop_user(&mut self, user_id: &UserId) {
        self.speakers.retain(|u| u != user_id);
        self.listeners.retain(|u| u != user_id);
        self.raised_hands.retain(|h| &h.user_id != user_id);
    }

    fn camera_track(&self) -> Option<Arc<crate::media::LocalTrack>> {
        self.stream.video_tracks().next().cloned()
    }
}

enum RoomState {
    NotInRoom,
    WaitingApproval {
        room_id: RoomId,
        timer: Option<JoinHandle<()>>,
    },
    InRoom(Box<ActiveRoom>),
}

/// The room state machine
pub struct RoomManager {
    api: Arc<dyn RoomApi>,
    signaling: Arc<dyn SignalSender>,
    media: Arc<dyn MediaSource>,
    peers: Arc<dyn PeerFactory>,
    feedback: Arc<dyn FeedbackSink>,
    local_user: UserInfo,
    local_socket: SocketId,
    config: RoomConfig,
    state: Arc<Mutex<RoomState>>,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomManager {
    /// Create a manager around the given collaborators
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn RoomApi>,
        signaling: Arc<dyn SignalSender>,
        media: Arc<dyn MediaSource>,
        peers: Arc<dyn PeerFactory>,
        feedback: Arc<dyn FeedbackSink>,
        local_user: UserInfo,
        local_socket: SocketId,
        config: RoomConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            api,
            signaling,
            media,
            peers,
            feedback,
            local_user,
            local_socket,
            config,
            state: Arc::new(Mutex::new(RoomState::NotInRoom)),
            events,
        }
    }

    /// Subscribe to room lifecycle events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Current phase
    pub async fn phase(&self) -> RoomPhase {
        match &*self.state.lock().await {
            RoomState::NotInRoom => RoomPhase::NotInRoom,
            RoomState::WaitingApproval { .. } => RoomPhase::WaitingApproval,
            RoomState::InRoom(_) => RoomPhase::InRoom,
        }
    }

    /// Whether a room is joined or a join is pending
    pub async fn is_active(&self) -> bool {
        !matches!(&*self.state.lock().await, RoomState::NotInRoom)
    }

    /// Read model of the joined room
    pub async fn view(&self) -> Option<RoomView> {
        match &*self.state.lock().await {
            RoomState::InRoom(room) => Some(RoomView {
                room: room.info.clone(),
                is_admin: room.is_admin,
                participants: room
                    .participants
                    .values()
                    .map(|p| ParticipantView {
                        user_id: p.user_id.clone(),
                        socket_id: p.socket_id.clone(),
                        info: p.info.clone(),
                        is_muted: p.is_muted,
                        is_video_off: p.is_video_off,
                        is_screen_sharing: p.is_screen_sharing,
                        connected: p.link.is_some(),
                    })
                    .collect(),
                speakers: room.speakers.clone(),
                listeners: room.listeners.clone(),
                raised_hands: room.raised_hands.clone(),
                pending_requests: room.pending_requests.clone(),
                is_muted: room.is_muted,
                is_video_off: room.is_video_off,
                is_screen_sharing: room.screen_stream.is_some(),
            }),
            _ => None,
        }
    }

    /// Create a room and join it as admin and sole initial speaker
    #[tracing::instrument(skip(self))]
    pub async fn create_room(
        &self,
        name: &str,
        kind: RoomKind,
        require_approval: bool,
    ) -> Result<RoomId, RoomError> {
        let mut guard = self.state.lock().await;
        if !matches!(&*guard, RoomState::NotInRoom) {
            return Err(RoomError::AlreadyInRoom);
        }
        let info = self.api.create_room(name, kind, require_approval).await?;
        let room_id = info.id.clone();
        let snapshot = RoomSnapshot {
            room: info,
            speakers: vec![self.local_user.id.clone()],
            listeners: Vec::new(),
            raised_hands: Vec::new(),
        };
        self.admit(&mut guard, snapshot).await?;
        drop(guard);

        self.feedback.copy_invite_link(&format!(
            "{}/{}",
            self.config.invite_link_base, room_id
        ));
        info!(%room_id, "room created");
        Ok(room_id)
    }

    /// Join an open room (or one that already approved us)
    #[tracing::instrument(skip(self))]
    pub async fn join_room(&self, room_id: &RoomId) -> Result<(), RoomError> {
        let mut guard = self.state.lock().await;
        if !matches!(&*guard, RoomState::NotInRoom) {
            return Err(RoomError::AlreadyInRoom);
        }
        let snapshot = self.api.join_room(room_id).await?;
        self.admit(&mut guard, snapshot).await?;
        Ok(())
    }

    /// Ask to join an approval-gated room
    ///
    /// Immediate admission proceeds as a plain join. A deferred verdict
    /// parks the machine in WaitingApproval; nothing else happens until the
    /// approval, rejection, or the configured timeout.
    #[tracing::instrument(skip(self))]
    pub async fn request_to_join(&self, room_id: &RoomId) -> Result<RoomPhase, RoomError> {
        let mut guard = self.state.lock().await;
        if !matches!(&*guard, RoomState::NotInRoom) {
            return Err(RoomError::AlreadyInRoom);
        }
        match self.api.request_join(room_id).await? {
            JoinDecision::Admitted(snapshot) => {
                self.admit(&mut guard, snapshot).await?;
                Ok(RoomPhase::InRoom)
            }
            JoinDecision::Deferred => {
                let timer = self.config.join_request_timeout.map(|wait| {
                    let state = Arc::clone(&self.state);
                    let events = self.events.clone();
                    let room_id = room_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        let mut guard = state.lock().await;
                        let still_waiting = matches!(
                            &*guard,
                            RoomState::WaitingApproval { room_id: waiting, .. }
                                if *waiting == room_id
                        );
                        if still_waiting {
                            warn!(%room_id, "join request expired without a verdict");
                            *guard = RoomState::NotInRoom;
                            let _ = events.send(RoomEvent::JoinRequestTimedOut { room_id });
                        }
                    })
                });
                *guard = RoomState::WaitingApproval {
                    room_id: room_id.clone(),
                    timer,
                };
                drop(guard);
                info!(%room_id, "waiting for join approval");
                let _ = self.events.send(RoomEvent::ApprovalPending {
                    room_id: room_id.clone(),
                });
                Ok(RoomPhase::WaitingApproval)
            }
        }
    }

    /// Leave the room; an Ok no-op when not in one
    #[tracing::instrument(skip(self))]
    pub async fn leave_room(&self) -> Result<(), RoomError> {
        let mut guard = self.state.lock().await;
        match std::mem::replace(&mut *guard, RoomState::NotInRoom) {
            RoomState::NotInRoom => {
                debug!("leave_room with no active room");
                Ok(())
            }
            RoomState::WaitingApproval { timer, .. } => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                Ok(())
            }
            RoomState::InRoom(room) => {
                drop(guard);
                let room_id = room.info.id.clone();
                // Departure notices are best-effort; local teardown always runs
                if let Err(err) = self.api.leave_room(&room_id).await {
                    warn!(%room_id, error = %err, "leave notice to the API failed");
                }
                if let Err(err) = self
                    .signaling
                    .send(SignalMessage::RoomLeave {
                        room_id: room_id.clone(),
                        user_id: self.local_user.id.clone(),
                    })
                    .await
                {
                    warn!(%room_id, error = %err, "leave broadcast failed");
                }
                teardown_room(*room).await;
                info!(%room_id, "left room");
                let _ = self.events.send(RoomEvent::Left { room_id });
                Ok(())
            }
        }
    }

    /// Delete the room (admin only; checked locally first)
    #[tracing::instrument(skip(self))]
    pub async fn delete_room(&self) -> Result<(), RoomError> {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &*guard else {
            return Err(RoomError::NotInRoom);
        };
        if !room.is_admin {
            return Err(RoomError::NotAdmin);
        }
        let room_id = room.info.id.clone();
        self.api.delete_room(&room_id).await?;
        let RoomState::InRoom(room) = std::mem::replace(&mut *guard, RoomState::NotInRoom)
        else {
            return Ok(());
        };
        drop(guard);
        teardown_room(*room).await;
        info!(%room_id, "room deleted");
        let _ = self.events.send(RoomEvent::Left { room_id });
        Ok(())
    }

    /// Admit a pending requester (admin only; checked locally first)
    pub async fn approve_request(&self, user_id: &UserId) -> Result<(), RoomError> {
        let mut guard = self.state.lock().await;
        let room = require_admin(&mut guard)?;
        let room_id = room.info.id.clone();
        self.api.approve_request(&room_id, user_id).await?;
        room.pending_requests.retain(|r| &r.user.id != user_id);
        Ok(())
    }

    /// Turn a pending requester away (admin only; checked locally first)
    pub async fn reject_request(&self, user_id: &UserId) -> Result<(), RoomError> {
        let mut guard = self.state.lock().await;
        let room = require_admin(&mut guard)?;
        let room_id = room.info.id.clone();
        self.api.reject_request(&room_id, user_id).await?;
        room.pending_requests.retain(|r| &r.user.id != user_id);
        Ok(())
    }

    /// Grant the speaker role (admin only; checked locally first)
    pub async fn promote_to_speaker(&self, user_id: &UserId) -> Result<(), RoomError> {
        let mut guard = self.state.lock().await;
        let room = require_admin(&mut guard)?;
        let room_id = room.info.id.clone();
        self.api.promote(&room_id, user_id).await?;
        room.assign_role(user_id, true);
        Ok(())
    }

    /// Move a speaker to the audience (admin only; checked locally first)
    pub async fn demote_to_listener(&self, user_id: &UserId) -> Result<(), RoomError> {
        let mut guard = self.state.lock().await;
        let room = require_admin(&mut guard)?;
        let room_id = room.info.id.clone();
        self.api.demote(&room_id, user_id).await?;
        let forced_mute = self.apply_demotion(room, user_id).await;
        drop(guard);
        if forced_mute {
            let _ = self.events.send(RoomEvent::MuteChanged {
                user_id: self.local_user.id.clone(),
                is_muted: true,
            });
        }
        let _ = self.events.send(RoomEvent::Demoted {
            user_id: user_id.clone(),
        });
        Ok(())
    }

    /// Post a hand raise/lower intent; local state changes only when the
    /// server broadcast comes back (deliberately not optimistic)
    pub async fn toggle_hand(&self) -> Result<(), RoomError> {
        let guard = self.state.lock().await;
        let RoomState::InRoom(room) = &*guard else {
            return Err(RoomError::NotInRoom);
        };
        let room_id = room.info.id.clone();
        drop(guard);
        self.api.toggle_hand(&room_id).await?;
        Ok(())
    }

    /// Flip our mute flag: optimistic track toggle plus a room broadcast
    pub async fn toggle_mute(&self) -> Result<bool, RoomError> {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return Err(RoomError::NotInRoom);
        };
        room.is_muted = !room.is_muted;
        room.stream.set_audio_enabled(!room.is_muted);
        let message = SignalMessage::RoomMuteChange {
            room_id: room.info.id.clone(),
            user_id: self.local_user.id.clone(),
            is_muted: room.is_muted,
        };
        let is_muted = room.is_muted;
        drop(guard);
        if let Err(err) = self.signaling.send(message).await {
            warn!(error = %err, "mute broadcast failed");
        }
        let _ = self.events.send(RoomEvent::MuteChanged {
            user_id: self.local_user.id.clone(),
            is_muted,
        });
        Ok(is_muted)
    }

    /// Flip our camera flag: optimistic track toggle plus a room broadcast
    pub async fn toggle_video(&self) -> Result<bool, RoomError> {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return Err(RoomError::NotInRoom);
        };
        room.is_video_off = !room.is_video_off;
        room.stream.set_video_enabled(!room.is_video_off);
        let message = SignalMessage::RoomVideoChange {
            room_id: room.info.id.clone(),
            user_id: self.local_user.id.clone(),
            is_video_off: room.is_video_off,
        };
        let is_video_off = room.is_video_off;
        drop(guard);
        if let Err(err) = self.signaling.send(message).await {
            warn!(error = %err, "video broadcast failed");
        }
        let _ = self.events.send(RoomEvent::VideoChanged {
            user_id: self.local_user.id.clone(),
            is_video_off,
        });
        Ok(is_video_off)
    }

    /// Start sharing the screen: the capture's video track replaces the
    /// outgoing camera track on every live link, with no renegotiation
    #[tracing::instrument(skip(self))]
    pub async fn start_screen_share(&self) -> Result<(), RoomError> {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return Err(RoomError::NotInRoom);
        };
        if room.screen_stream.is_some() {
            return Err(RoomError::InvalidState("screen share already active"));
        }
        let display = self.media.acquire_display().await?;
        let Some(screen_track) = display.video_tracks().next().cloned() else {
            display.stop();
            return Err(RoomError::InvalidState("display capture has no video track"));
        };

        for participant in room.participants.values() {
            if let Some(link) = &participant.link {
                if let Err(err) = link.replace_video_track(Some(Arc::clone(&screen_track))).await {
                    warn!(peer = %participant.socket_id, error = %err, "screen track swap failed");
                }
            }
        }

        // Revert automatically if the capture ends outside our controls
        let mut stopped = screen_track.stopped();
        let handle = RoomHandle {
            state: Arc::clone(&self.state),
            signaling: Arc::clone(&self.signaling),
            events: self.events.clone(),
            local_user: self.local_user.clone(),
        };
        room.tasks.push(tokio::spawn(async move {
            if stopped.changed().await.is_ok() && *stopped.borrow() {
                handle.revert_screen_share().await;
            }
        }));

        room.screen_stream = Some(display);
        let message = SignalMessage::RoomScreenStart {
            room_id: room.info.id.clone(),
            user_id: self.local_user.id.clone(),
        };
        drop(guard);
        if let Err(err) = self.signaling.send(message).await {
            warn!(error = %err, "screen-start broadcast failed");
        }
        let _ = self.events.send(RoomEvent::ScreenShareStarted {
            user_id: self.local_user.id.clone(),
        });
        Ok(())
    }

    /// Stop sharing and restore the camera track on every link
    #[tracing::instrument(skip(self))]
    pub async fn stop_screen_share(&self) -> Result<(), RoomError> {
        let handle = RoomHandle {
            state: Arc::clone(&self.state),
            signaling: Arc::clone(&self.signaling),
            events: self.events.clone(),
            local_user: self.local_user.clone(),
        };
        if handle.revert_screen_share().await {
            Ok(())
        } else {
            Err(RoomError::InvalidState("no screen share active"))
        }
    }

    /// Route one inbound room-scoped message into the state machine
    pub async fn handle_signal(&self, message: SignalMessage) {
        match message {
            SignalMessage::RoomExistingUsers { room_id, users } => {
                self.on_existing_users(room_id, users).await;
            }
            SignalMessage::RoomUserJoined { socket_id, user, .. } => {
                self.on_user_joined(socket_id, user).await;
            }
            SignalMessage::RoomUserLeft {
                socket_id, user_id, ..
            } => self.on_user_left(socket_id, user_id).await,
            SignalMessage::RoomOffer {
                from_socket_id,
                from_user_id,
                payload,
                ..
            } => self.on_offer(from_socket_id, from_user_id, payload).await,
            SignalMessage::RoomAnswer {
                from_socket_id,
                payload,
                ..
            } => self.on_answer(from_socket_id, payload).await,
            SignalMessage::RoomIceCandidate {
                from_socket_id,
                payload,
                ..
            } => self.on_remote_candidate(from_socket_id, payload).await,
            SignalMessage::RoomMuteChange {
                user_id, is_muted, ..
            } => self.on_mute_change(user_id, is_muted).await,
            SignalMessage::RoomVideoChange {
                user_id,
                is_video_off,
                ..
            } => self.on_video_change(user_id, is_video_off).await,
            SignalMessage::RoomScreenStarted { user_id, .. }
            | SignalMessage::RoomScreenStart { user_id, .. } => {
                self.on_remote_screen(user_id, true).await;
            }
            SignalMessage::RoomScreenStopped { user_id, .. }
            | SignalMessage::RoomScreenStop { user_id, .. } => {
                self.on_remote_screen(user_id, false).await;
            }
            SignalMessage::RoomJoinRequest { user, .. } => self.on_join_request(user).await,
            SignalMessage::RoomRequestApproved { room_id } => {
                self.on_request_approved(room_id).await;
            }
            SignalMessage::RoomRequestRejected { room_id } => {
                self.on_request_rejected(room_id).await;
            }
            SignalMessage::RoomDeleted { room_name } => self.on_room_deleted(room_name).await,
            SignalMessage::RoomHandToggled {
                user_id,
                name,
                is_raised,
            } => self.on_hand_toggled(user_id, name, is_raised).await,
            SignalMessage::RoomUserPromoted { user_id } => self.on_promoted(user_id).await,
            SignalMessage::RoomUserDemoted { user_id } => self.on_demoted(user_id).await,
            other => {
                debug!(event = other.event_name(), "ignoring non-room message");
            }
        }
    }

    /// Seed state and join the broadcast group; shared by every admission path
    async fn admit(
        &self,
        state: &mut RoomState,
        snapshot: RoomSnapshot,
    ) -> Result<(), RoomError> {
        let stream = self
            .media
            .acquire(snapshot.room.kind.media_kind())
            .await?;
        if let Err(err) = self
            .signaling
            .send(SignalMessage::RoomJoin {
                room_id: snapshot.room.id.clone(),
                user: self.local_user.clone(),
            })
            .await
        {
            stream.stop();
            return Err(err.into());
        }

        let is_admin = snapshot.room.creator_id == self.local_user.id;
        let mut room = Box::new(ActiveRoom {
            is_admin,
            participants: HashMap::new(),
            speakers: snapshot.speakers,
            listeners: snapshot.listeners,
            raised_hands: snapshot.raised_hands,
            pending_requests: Vec::new(),
            early_candidates: HashMap::new(),
            stream,
            screen_stream: None,
            is_muted: false,
            is_video_off: false,
            tasks: Vec::new(),
            info: snapshot.room,
        });
        let local = &self.local_user.id;
        if !room.speakers.contains(local) && !room.listeners.contains(local) {
            // Live rooms are stage-gated: new joiners start in the audience
            room.assign_role(local, room.info.kind != RoomKind::Live);
        }
        let room_id = room.info.id.clone();
        *state = RoomState::InRoom(room);

        info!(%room_id, "joined room");
        let _ = self.events.send(RoomEvent::Joined { room_id });
        Ok(())
    }

    /// Demote a user; force-mutes us if we are the demoted, unmuted speaker
    async fn apply_demotion(&self, room: &mut ActiveRoom, user_id: &UserId) -> bool {
        room.assign_role(user_id, false);
        if user_id == &self.local_user.id && !room.is_muted {
            // Listeners cannot transmit: a hard invariant, not a suggestion
            room.is_muted = true;
            room.stream.set_audio_enabled(false);
            let message = SignalMessage::RoomMuteChange {
                room_id: room.info.id.clone(),
                user_id: self.local_user.id.clone(),
                is_muted: true,
            };
            if let Err(err) = self.signaling.send(message).await {
                warn!(error = %err, "forced-mute broadcast failed");
            }
            return true;
        }
        false
    }

    async fn on_existing_users(&self, room_id: RoomId, users: Vec<crate::signaling::RoomPeer>) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            debug!("existing-users with no active room");
            return;
        };
        if room.info.id != room_id {
            return;
        }
        // Joiner offers to every existing member: deterministic direction,
        // no negotiation glare
        for peer in users {
            match self.open_link(room, &peer.socket_id, &peer.user_id).await {
                Ok(link) => {
                    let offer = match link.create_offer().await {
                        Ok(offer) => offer,
                        Err(err) => {
                            warn!(peer = %peer.socket_id, error = %err, "offer failed");
                            link.close().await;
                            room.participants.remove(&peer.socket_id);
                            continue;
                        }
                    };
                    let message = SignalMessage::RoomOffer {
                        room_id: room.info.id.clone(),
                        from_socket_id: self.local_socket.clone(),
                        from_user_id: self.local_user.id.clone(),
                        target_socket_id: peer.socket_id.clone(),
                        payload: offer,
                    };
                    if let Err(err) = self.signaling.send(message).await {
                        warn!(peer = %peer.socket_id, error = %err, "offer send failed");
                    }
                }
                Err(err) => {
                    warn!(peer = %peer.socket_id, error = %err, "link creation failed");
                }
            }
        }
    }

    async fn on_user_joined(&self, socket_id: SocketId, user: UserInfo) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        // The newcomer offers to us; we only record them and wait
        let user_id = user.id.clone();
        room.participants.insert(
            socket_id.clone(),
            Participant {
                user_id: user_id.clone(),
                socket_id,
                info: Some(user.clone()),
                is_muted: false,
                is_video_off: false,
                is_screen_sharing: false,
                link: None,
            },
        );
        if !room.speakers.contains(&user_id) && !room.listeners.contains(&user_id) {
            room.assign_role(&user_id, room.info.kind != RoomKind::Live);
        }
        drop(guard);
        let _ = self.events.send(RoomEvent::ParticipantJoined { user });
    }

    async fn on_user_left(&self, socket_id: SocketId, user_id: UserId) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        let link = room
            .participants
            .remove(&socket_id)
            .and_then(|p| p.link);
        room.early_candidates.remove(&socket_id);
        room.drop_user(&user_id);
        drop(guard);
        if let Some(link) = link {
            link.close().await;
        }
        let _ = self.events.send(RoomEvent::ParticipantLeft { user_id });
    }

    async fn on_offer(
        &self,
        from_socket_id: SocketId,
        from_user_id: UserId,
        offer: SessionDescription,
    ) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            debug!("offer with no active room");
            return;
        };
        let link = match self.open_link(room, &from_socket_id, &from_user_id).await {
            Ok(link) => link,
            Err(err) => {
                warn!(peer = %from_socket_id, error = %err, "link creation failed");
                return;
            }
        };
        let negotiate = async {
            // Early candidates go through the link buffer so they apply
            // after the description, in arrival order
            link.apply_remote_description(offer).await?;
            link.create_answer().await
        };
        let answer = match negotiate.await {
            Ok(answer) => answer,
            Err(err) => {
                // Only this participant's connection drops; the mesh survives
                warn!(peer = %from_socket_id, error = %err, "inbound offer failed");
                link.close().await;
                if let Some(p) = room.participants.get_mut(&from_socket_id) {
                    p.link = None;
                }
                return;
            }
        };
        let message = SignalMessage::RoomAnswer {
            room_id: room.info.id.clone(),
            from_socket_id: self.local_socket.clone(),
            from_user_id: self.local_user.id.clone(),
            target_socket_id: from_socket_id,
            payload: answer,
        };
        drop(guard);
        if let Err(err) = self.signaling.send(message).await {
            warn!(error = %err, "answer send failed");
        }
    }

    async fn on_answer(&self, from_socket_id: SocketId, answer: SessionDescription) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        let Some(link) = room
            .participants
            .get(&from_socket_id)
            .and_then(|p| p.link.clone())
        else {
            debug!(peer = %from_socket_id, "answer for unknown link");
            return;
        };
        if let Err(err) = link.apply_remote_description(answer).await {
            warn!(peer = %from_socket_id, error = %err, "answer application failed");
            link.close().await;
            if let Some(p) = room.participants.get_mut(&from_socket_id) {
                p.link = None;
            }
        }
    }

    async fn on_remote_candidate(&self, from_socket_id: SocketId, candidate: IceCandidate) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        match room
            .participants
            .get(&from_socket_id)
            .and_then(|p| p.link.clone())
        {
            Some(link) => {
                if let Err(err) = link.add_remote_candidate(candidate).await {
                    warn!(peer = %from_socket_id, error = %err, "candidate rejected");
                }
            }
            // No link yet for this peer: hold until its negotiation starts
            None => room
                .early_candidates
                .entry(from_socket_id)
                .or_default()
                .push(candidate),
        }
    }

    async fn on_mute_change(&self, user_id: UserId, is_muted: bool) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        for p in room.participants.values_mut() {
            if p.user_id == user_id {
                p.is_muted = is_muted;
            }
        }
        drop(guard);
        let _ = self.events.send(RoomEvent::MuteChanged { user_id, is_muted });
    }

    async fn on_video_change(&self, user_id: UserId, is_video_off: bool) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        for p in room.participants.values_mut() {
            if p.user_id == user_id {
                p.is_video_off = is_video_off;
            }
        }
        drop(guard);
        let _ = self
            .events
            .send(RoomEvent::VideoChanged { user_id, is_video_off });
    }

    async fn on_remote_screen(&self, user_id: UserId, sharing: bool) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        for p in room.participants.values_mut() {
            if p.user_id == user_id {
                p.is_screen_sharing = sharing;
            }
        }
        drop(guard);
        let event = if sharing {
            RoomEvent::ScreenShareStarted { user_id }
        } else {
            RoomEvent::ScreenShareStopped { user_id }
        };
        let _ = self.events.send(event);
    }

    async fn on_join_request(&self, user: UserInfo) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        if !room.is_admin {
            debug!("join request delivered to a non-admin, ignoring");
            return;
        }
        room.pending_requests.push(JoinRequest {
            user: user.clone(),
            requested_at: Utc::now(),
        });
        drop(guard);
        self.feedback
            .notify("Join request", &format!("{} wants to join", user.name));
        let _ = self.events.send(RoomEvent::JoinRequestReceived { user });
    }

    async fn on_request_approved(&self, room_id: RoomId) {
        let mut guard = self.state.lock().await;
        let waiting = matches!(
            &*guard,
            RoomState::WaitingApproval { room_id: w, .. } if *w == room_id
        );
        if !waiting {
            debug!(%room_id, "approval for a request we are not waiting on");
            return;
        }
        if let RoomState::WaitingApproval { timer, .. } = &mut *guard {
            if let Some(timer) = timer.take() {
                timer.abort();
            }
        }
        *guard = RoomState::NotInRoom;
        let _ = self.events.send(RoomEvent::JoinApproved {
            room_id: room_id.clone(),
        });
        // Complete the join we were waiting on
        match self.api.join_room(&room_id).await {
            Ok(snapshot) => {
                if let Err(err) = self.admit(&mut guard, snapshot).await {
                    warn!(%room_id, error = %err, "join after approval failed");
                }
            }
            Err(err) => {
                warn!(%room_id, error = %err, "join after approval failed");
            }
        }
    }

    async fn on_request_rejected(&self, room_id: RoomId) {
        let mut guard = self.state.lock().await;
        let waiting = matches!(
            &*guard,
            RoomState::WaitingApproval { room_id: w, .. } if *w == room_id
        );
        if !waiting {
            return;
        }
        if let RoomState::WaitingApproval { timer, .. } = &mut *guard {
            if let Some(timer) = timer.take() {
                timer.abort();
            }
        }
        *guard = RoomState::NotInRoom;
        drop(guard);
        info!(%room_id, "join request rejected");
        let _ = self.events.send(RoomEvent::JoinRejected { room_id });
    }

    async fn on_room_deleted(&self, room_name: String) {
        let mut guard = self.state.lock().await;
        let state = std::mem::replace(&mut *guard, RoomState::NotInRoom);
        drop(guard);
        match state {
            RoomState::InRoom(room) => {
                teardown_room(*room).await;
            }
            RoomState::WaitingApproval { timer, .. } => {
                if let Some(timer) = timer {
                    timer.abort();
                }
            }
            RoomState::NotInRoom => return,
        }
        info!(room_name, "room deleted by admin");
        let _ = self.events.send(RoomEvent::RoomDeleted { room_name });
    }

    async fn on_hand_toggled(&self, user_id: UserId, name: String, is_raised: bool) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        room.raised_hands.retain(|h| h.user_id != user_id);
        if is_raised {
            room.raised_hands.push(RaisedHand {
                user_id: user_id.clone(),
                requested_at: Utc::now(),
            });
        }
        drop(guard);
        debug!(%user_id, name, is_raised, "hand toggled");
        let _ = self.events.send(RoomEvent::HandToggled { user_id, is_raised });
    }

    async fn on_promoted(&self, user_id: UserId) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        room.assign_role(&user_id, true);
        drop(guard);
        let _ = self.events.send(RoomEvent::Promoted { user_id });
    }

    async fn on_demoted(&self, user_id: UserId) {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return;
        };
        let forced_mute = self.apply_demotion(room, &user_id).await;
        drop(guard);
        if forced_mute {
            let _ = self.events.send(RoomEvent::MuteChanged {
                user_id: self.local_user.id.clone(),
                is_muted: true,
            });
        }
        let _ = self.events.send(RoomEvent::Demoted { user_id });
    }

    /// Create a link for a peer, attach our tracks, feed any early
    /// candidates, register the participant, and start candidate trickling
    async fn open_link(
        &self,
        room: &mut ActiveRoom,
        socket_id: &SocketId,
        user_id: &UserId,
    ) -> Result<Arc<PeerLink>, PeerError> {
        // A re-offer (duplicate delivery, or retry after a failed
        // negotiation) supersedes the previous connection; close it so
        // each participant holds at most one live session.
        if let Some(stale) = room
            .participants
            .get_mut(socket_id)
            .and_then(|p| p.link.take())
        {
            warn!(peer = %socket_id, "replacing existing peer link");
            stale.close().await;
        }
        let backend = self.peers.create().await?;
        let link = Arc::new(PeerLink::new(
            PeerTarget {
                socket_id: socket_id.clone(),
                user_id: user_id.clone(),
            },
            backend,
        ));
        for track in room.stream.tracks() {
            link.add_track(Arc::clone(track)).await?;
        }
        if let Some(early) = room.early_candidates.remove(socket_id) {
            for candidate in early {
                link.add_remote_candidate(candidate).await?;
            }
        }

        let mut candidates = link.local_candidates();
        let signaling = Arc::clone(&self.signaling);
        let room_id = room.info.id.clone();
        let from_socket = self.local_socket.clone();
        let target_socket = socket_id.clone();
        room.tasks.push(tokio::spawn(async move {
            loop {
                match candidates.recv().await {
                    Ok(candidate) => {
                        let message = SignalMessage::RoomIceCandidate {
                            room_id: room_id.clone(),
                            from_socket_id: from_socket.clone(),
                            target_socket_id: target_socket.clone(),
                            payload: candidate,
                        };
                        if let Err(err) = signaling.send(message).await {
                            debug!(error = %err, "candidate trickle dropped");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let entry = room
            .participants
            .entry(socket_id.clone())
            .or_insert_with(|| Participant {
                user_id: user_id.clone(),
                socket_id: socket_id.clone(),
                info: None,
                is_muted: false,
                is_video_off: false,
                is_screen_sharing: false,
                link: None,
            });
        entry.link = Some(Arc::clone(&link));
        if !room.speakers.contains(user_id) && !room.listeners.contains(user_id) {
            room.assign_role(user_id, room.info.kind != RoomKind::Live);
        }
        Ok(link)
    }
}

/// Just enough of the manager to revert a screen share from a spawned task
struct RoomHandle {
    state: Arc<Mutex<RoomState>>,
    signaling: Arc<dyn SignalSender>,
    events: broadcast::Sender<RoomEvent>,
    local_user: UserInfo,
}

impl RoomHandle {
    /// Restore the camera track and announce the stop; returns whether a
    /// share was actually active
    async fn revert_screen_share(&self) -> bool {
        let mut guard = self.state.lock().await;
        let RoomState::InRoom(room) = &mut *guard else {
            return false;
        };
        let Some(screen) = room.screen_stream.take() else {
            return false;
        };
        screen.stop();
        let camera = room.camera_track();
        for participant in room.participants.values() {
            if let Some(link) = &participant.link {
                if let Err(err) = link.replace_video_track(camera.clone()).await {
                    warn!(peer = %participant.socket_id, error = %err, "camera restore failed");
                }
            }
        }
        let message = SignalMessage::RoomScreenStop {
            room_id: room.info.id.clone(),
            user_id: self.local_user.id.clone(),
        };
        drop(guard);
        if let Err(err) = self.signaling.send(message).await {
            warn!(error = %err, "screen-stop broadcast failed");
        }
        let _ = self.events.send(RoomEvent::ScreenShareStopped {
            user_id: self.local_user.id.clone(),
        });
        true
    }
}

fn require_admin<'a>(
    state: &'a mut RoomState,
) -> Result<&'a mut ActiveRoom, RoomError> {
    let RoomState::InRoom(room) = state else {
        return Err(RoomError::NotInRoom);
    };
    if !room.is_admin {
        return Err(RoomError::NotAdmin);
    }
    Ok(room)
}

async fn teardown_room(room: ActiveRoom) {
    let links: Vec<_> = room
        .participants
        .into_values()
        .filter_map(|p| p.link)
        .collect();
    futures::future::join_all(links.iter().map(|link| link.close())).await;
    room.stream.stop();
    if let Some(screen) = &room.screen_stream {
        screen.stop();
    }
    for task in room.tasks {
        task.abort();
    }
}

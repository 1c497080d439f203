//! One-to-one call session state machine
//!
//! At most one call session exists at a time. Phases move
//! Idle -> RingingOutbound | RingingInbound -> Connected -> Idle, never
//! re-entering a phase without passing through Idle. Teardown is idempotent
//! from any non-terminal phase.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::feedback::{Cue, FeedbackSink};
use crate::media::{LocalStream, MediaError, MediaSource};
use crate::peer::{LinkState, PeerError, PeerFactory, PeerLink, PeerTarget};
use crate::signaling::{SignalMessage, SignalSender};
use crate::transport::TransportError;
use crate::types::{
    CallDirection, CallId, IceCandidate, MediaKind, SessionDescription, SocketId, UserId, UserInfo,
};

/// Errors raised by call operations
#[derive(Debug, Error)]
pub enum CallError {
    /// A session already exists; the existing session is untouched
    #[error("a call is already active")]
    AlreadyActive,

    /// The operation is not legal in the current phase
    #[error("operation not valid in the current call phase")]
    InvalidPhase,

    /// The operation needs an acquired local stream
    #[error("no local stream acquired")]
    NoStream,

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

/// Lifecycle phase of the call session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// No session
    Idle,
    /// Waiting for the callee to answer
    RingingOutbound,
    /// An invite is waiting for a local decision
    RingingInbound,
    /// Media is flowing
    Connected,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Local hangup
    Hangup,
    /// Remote hangup
    RemoteHangup,
    /// Local rejection of an inbound invite
    Rejected,
    /// The callee declined
    RemoteRejected,
    /// The media path was lost for good
    ConnectionFailed,
}

/// Call lifecycle notifications for the UI
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An invite arrived and is ringing
    Incoming {
        /// Call identifier
        call_id: CallId,
        /// Audio or video
        kind: MediaKind,
        /// Who is calling
        caller: UserInfo,
    },
    /// An outbound invite was published
    Ringing {
        /// Call identifier
        call_id: CallId,
    },
    /// Both ends reached Connected
    Connected {
        /// Call identifier
        call_id: CallId,
    },
    /// The session ended
    Ended {
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: EndReason,
    },
}

/// Call tuning knobs
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long a transient `Disconnected` may last before teardown
    pub disconnect_grace: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_secs(3),
        }
    }
}

/// Read model of the current session
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Call identifier
    pub call_id: CallId,
    /// Outbound or inbound
    pub direction: CallDirection,
    /// Audio or video
    pub kind: MediaKind,
    /// Current phase
    pub phase: CallPhase,
    /// The remote party
    pub remote_user_id: UserId,
    /// Remote display info, if known
    pub remote_info: Option<UserInfo>,
    /// Local mute flag
    pub is_muted: bool,
    /// Local camera-off flag
    pub is_video_off: bool,
}

struct ActiveCall {
    id: CallId,
    direction: CallDirection,
    kind: MediaKind,
    phase: CallPhase,
    remote_user_id: UserId,
    remote_info: Option<UserInfo>,
    stream: Option<LocalStream>,
    link: Option<Arc<PeerLink>>,
    pending_remote_offer: Option<SessionDescription>,
    // Candidates that arrived while an inbound invite was still unaccepted
    early_candidates: Vec<IceCandidate>,
    is_muted: bool,
    is_video_off: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// The call session state machine
pub struct CallManager {
    signaling: Arc<dyn SignalSender>,
    media: Arc<dyn MediaSource>,
    peers: Arc<dyn PeerFactory>,
    feedback: Arc<dyn FeedbackSink>,
    local_user: UserInfo,
    config: CallConfig,
    active: Arc<Mutex<Option<ActiveCall>>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Create a manager around the given collaborators
    #[must_use]
    pub fn new(
        signaling: Arc<dyn SignalSender>,
        media: Arc<dyn MediaSource>,
        peers: Arc<dyn PeerFactory>,
        feedback: Arc<dyn FeedbackSink>,
        local_user: UserInfo,
        config: CallConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            signaling,
            media,
            peers,
            feedback,
            local_user,
            config,
            active: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Subscribe to call lifecycle events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Current phase; `Idle` when no session exists
    pub async fn phase(&self) -> CallPhase {
        self.active
            .lock()
            .await
            .as_ref()
            .map_or(CallPhase::Idle, |call| call.phase)
    }

    /// Whether a session exists in any phase
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Read model of the current session
    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        self.active.lock().await.as_ref().map(|call| CallSnapshot {
            call_id: call.id,
            direction: call.direction,
            kind: call.kind,
            phase: call.phase,
            remote_user_id: call.remote_user_id.clone(),
            remote_info: call.remote_info.clone(),
            is_muted: call.is_muted,
            is_video_off: call.is_video_off,
        })
    }

    /// Start an outbound call
    ///
    /// Media is acquired first; on denial nothing transitions and nothing
    /// leaks. A failed invite publish tears everything back down to Idle.
    #[tracing::instrument(skip(self))]
    pub async fn initiate_call(
        &self,
        target_user_id: UserId,
        kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            return Err(CallError::AlreadyActive);
        }

        let stream = self.media.acquire(kind).await?;

        let call_id = CallId::new();
        let link = match self.build_link(&target_user_id).await {
            Ok(link) => link,
            Err(err) => {
                stream.stop();
                return Err(err.into());
            }
        };
        if let Err(err) = self.attach_tracks(&link, &stream).await {
            stream.stop();
            link.close().await;
            return Err(err.into());
        }
        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                stream.stop();
                link.close().await;
                return Err(err.into());
            }
        };

        self.feedback.play(Cue::Dialing);
        let invite = SignalMessage::CallInitiate {
            call_id,
            target_user_id: target_user_id.clone(),
            kind,
            offer,
            caller: self.local_user.clone(),
        };
        if let Err(err) = self.signaling.send(invite).await {
            self.feedback.stop(Cue::Dialing);
            stream.stop();
            link.close().await;
            return Err(err.into());
        }

        let tasks = vec![
            self.spawn_trickle(call_id, target_user_id.clone(), &link),
            self.spawn_state_watcher(&link),
        ];
        *guard = Some(ActiveCall {
            id: call_id,
            direction: CallDirection::Outbound,
            kind,
            phase: CallPhase::RingingOutbound,
            remote_user_id: target_user_id,
            remote_info: None,
            stream: Some(stream),
            link: Some(link),
            pending_remote_offer: None,
            early_candidates: Vec::new(),
            is_muted: false,
            is_video_off: false,
            tasks,
        });
        drop(guard);

        info!(%call_id, "outbound call ringing");
        let _ = self.events.send(CallEvent::Ringing { call_id });
        Ok(call_id)
    }

    /// Accept the ringing inbound invite
    ///
    /// Only now is media acquired; denial leaves the invite ringing so the
    /// user may retry or reject.
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let mut guard = self.active.lock().await;
        let call = guard.as_mut().ok_or(CallError::InvalidPhase)?;
        if call.phase != CallPhase::RingingInbound {
            return Err(CallError::InvalidPhase);
        }
        let offer = call
            .pending_remote_offer
            .clone()
            .ok_or(CallError::InvalidPhase)?;
        let call_id = call.id;
        let remote = call.remote_user_id.clone();
        let kind = call.kind;

        // Denial leaves the invite ringing; nothing has changed yet
        let stream = self.media.acquire(kind).await?;

        let early = std::mem::take(&mut call.early_candidates);
        let (link, answer) = match self.negotiate_accept(&remote, early, offer, &stream).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%call_id, error = %err, "negotiation failed on accept");
                stream.stop();
                let call = guard.take();
                drop(guard);
                self.teardown_taken(call, EndReason::ConnectionFailed).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self
            .signaling
            .send(SignalMessage::CallAnswer {
                call_id,
                target_user_id: remote.clone(),
                answer,
            })
            .await
        {
            stream.stop();
            link.close().await;
            let call = guard.take();
            drop(guard);
            self.teardown_taken(call, EndReason::ConnectionFailed).await;
            return Err(err.into());
        }

        call.tasks.push(self.spawn_trickle(call_id, remote, &link));
        call.tasks.push(self.spawn_state_watcher(&link));
        call.pending_remote_offer = None;
        call.stream = Some(stream);
        call.link = Some(link);
        call.phase = CallPhase::Connected;
        drop(guard);

        self.feedback.stop(Cue::Ringing);
        self.feedback.play(Cue::Connected);
        info!(%call_id, "inbound call connected");
        let _ = self.events.send(CallEvent::Connected { call_id });
        Ok(())
    }

    async fn negotiate_accept(
        &self,
        remote: &UserId,
        early: Vec<IceCandidate>,
        offer: SessionDescription,
        stream: &LocalStream,
    ) -> Result<(Arc<PeerLink>, SessionDescription), PeerError> {
        let link = self.build_link(remote).await?;
        self.attach_tracks(&link, stream).await?;
        // Candidates that raced ahead of acceptance go through the link's
        // buffer so they land after the description, in arrival order.
        for candidate in early {
            link.add_remote_candidate(candidate).await?;
        }
        link.apply_remote_description(offer).await?;
        let answer = link.create_answer().await?;
        Ok((link, answer))
    }

    async fn teardown_taken(&self, call: Option<ActiveCall>, reason: EndReason) {
        let Some(call) = call else { return };
        let call_id = call.id;
        let tasks = cleanup_call(call).await;
        self.feedback.stop(Cue::Dialing);
        self.feedback.stop(Cue::Ringing);
        let _ = self.events.send(CallEvent::Ended { call_id, reason });
        for task in tasks {
            task.abort();
        }
    }

    /// Decline the ringing inbound invite
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut guard = self.active.lock().await;
        let call = guard.as_ref().ok_or(CallError::InvalidPhase)?;
        if call.phase != CallPhase::RingingInbound {
            return Err(CallError::InvalidPhase);
        }
        let call_id = call.id;
        let remote = call.remote_user_id.clone();
        self.signaling
            .send(SignalMessage::CallReject {
                call_id,
                target_user_id: remote,
            })
            .await?;

        let call = guard.take();
        drop(guard);
        self.feedback.stop(Cue::Ringing);
        if let Some(call) = call {
            self.cleanup(call).await;
        }
        info!(%call_id, "inbound call rejected");
        let _ = self.events.send(CallEvent::Ended {
            call_id,
            reason: EndReason::Rejected,
        });
        Ok(())
    }

    /// Hang up; an Ok no-op when no session exists
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (call_id, remote) = {
            let guard = self.active.lock().await;
            let Some(call) = guard.as_ref() else {
                debug!("end_call with no active session");
                return Ok(());
            };
            if call.phase == CallPhase::RingingInbound {
                return Err(CallError::InvalidPhase);
            }
            (call.id, call.remote_user_id.clone())
        };
        // Teardown proceeds even if the notice cannot be delivered
        if let Err(err) = self
            .signaling
            .send(SignalMessage::CallEnd {
                call_id,
                target_user_id: remote,
            })
            .await
        {
            warn!(%call_id, error = %err, "end notice undeliverable");
        }
        self.finish(EndReason::Hangup).await;
        Ok(())
    }

    /// Flip the local mute flag; track-level only, no signaling
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let mut guard = self.active.lock().await;
        let call = guard.as_mut().ok_or(CallError::InvalidPhase)?;
        let stream = call.stream.as_ref().ok_or(CallError::NoStream)?;
        call.is_muted = !call.is_muted;
        stream.set_audio_enabled(!call.is_muted);
        Ok(call.is_muted)
    }

    /// Flip the local camera flag; track-level only, no signaling
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let mut guard = self.active.lock().await;
        let call = guard.as_mut().ok_or(CallError::InvalidPhase)?;
        let stream = call.stream.as_ref().ok_or(CallError::NoStream)?;
        call.is_video_off = !call.is_video_off;
        stream.set_video_enabled(!call.is_video_off);
        Ok(call.is_video_off)
    }

    /// Route one inbound call-scoped message into the state machine
    pub async fn handle_signal(&self, message: SignalMessage) {
        match message {
            SignalMessage::CallIncoming {
                call_id,
                caller_id,
                kind,
                offer,
                caller,
            } => self.on_incoming(call_id, caller_id, kind, offer, caller).await,
            SignalMessage::CallAnswer {
                call_id, answer, ..
            } => self.on_answer(call_id, answer).await,
            SignalMessage::CallIceCandidate {
                call_id, candidate, ..
            } => self.on_remote_candidate(call_id, candidate).await,
            SignalMessage::CallEnded { call_id, .. } | SignalMessage::CallEnd { call_id, .. } => {
                self.on_remote_teardown(call_id, EndReason::RemoteHangup).await;
            }
            SignalMessage::CallRejected { call_id, .. }
            | SignalMessage::CallReject { call_id, .. } => {
                self.on_remote_teardown(call_id, EndReason::RemoteRejected).await;
            }
            other => {
                debug!(event = other.event_name(), "ignoring non-call message");
            }
        }
    }

    async fn on_incoming(
        &self,
        call_id: CallId,
        caller_id: UserId,
        kind: MediaKind,
        offer: SessionDescription,
        caller: UserInfo,
    ) {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            // Busy: the active session is never disturbed by a new invite
            warn!(%call_id, %caller_id, "invite ignored, session already active");
            return;
        }
        *guard = Some(ActiveCall {
            id: call_id,
            direction: CallDirection::Inbound,
            kind,
            phase: CallPhase::RingingInbound,
            remote_user_id: caller_id,
            remote_info: Some(caller.clone()),
            stream: None,
            link: None,
            pending_remote_offer: Some(offer),
            early_candidates: Vec::new(),
            is_muted: false,
            is_video_off: false,
            tasks: Vec::new(),
        });
        drop(guard);

        self.feedback.play(Cue::Ringing);
        self.feedback.notify("Incoming call", &caller.name);
        info!(%call_id, "inbound call ringing");
        let _ = self.events.send(CallEvent::Incoming {
            call_id,
            kind,
            caller,
        });
    }

    async fn on_answer(&self, call_id: CallId, answer: SessionDescription) {
        let mut guard = self.active.lock().await;
        let Some(call) = guard.as_mut() else {
            debug!(%call_id, "answer for no session");
            return;
        };
        if call.id != call_id || call.phase != CallPhase::RingingOutbound {
            debug!(%call_id, phase = ?call.phase, "answer ignored");
            return;
        }
        let Some(link) = call.link.clone() else {
            return;
        };
        if let Err(err) = link.apply_remote_description(answer).await {
            warn!(%call_id, error = %err, "answer application failed");
            drop(guard);
            self.finish(EndReason::ConnectionFailed).await;
            return;
        }
        call.phase = CallPhase::Connected;
        drop(guard);

        self.feedback.stop(Cue::Dialing);
        self.feedback.play(Cue::Connected);
        info!(%call_id, "outbound call connected");
        let _ = self.events.send(CallEvent::Connected { call_id });
    }

    async fn on_remote_candidate(&self, call_id: CallId, candidate: IceCandidate) {
        let mut guard = self.active.lock().await;
        let Some(call) = guard.as_mut() else {
            debug!(%call_id, "candidate for no session");
            return;
        };
        if call.id != call_id {
            return;
        }
        match call.link.clone() {
            Some(link) => {
                if let Err(err) = link.add_remote_candidate(candidate).await {
                    warn!(%call_id, error = %err, "candidate rejected");
                }
            }
            // Pre-accept: hold until the link exists
            None => call.early_candidates.push(candidate),
        }
    }

    async fn on_remote_teardown(&self, call_id: CallId, reason: EndReason) {
        let matches = self
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|call| call.id == call_id);
        if matches {
            self.finish(reason).await;
        }
    }

    async fn build_link(&self, remote: &UserId) -> Result<Arc<PeerLink>, PeerError> {
        let backend = self.peers.create().await?;
        Ok(Arc::new(PeerLink::new(
            PeerTarget {
                // 1:1 calls are routed by user id; no socket id is exchanged
                socket_id: SocketId::new(remote.as_str()),
                user_id: remote.clone(),
            },
            backend,
        )))
    }

    async fn attach_tracks(
        &self,
        link: &Arc<PeerLink>,
        stream: &LocalStream,
    ) -> Result<(), PeerError> {
        for track in stream.tracks() {
            link.add_track(Arc::clone(track)).await?;
        }
        Ok(())
    }

    fn spawn_trickle(
        &self,
        call_id: CallId,
        target: UserId,
        link: &Arc<PeerLink>,
    ) -> JoinHandle<()> {
        let mut candidates = link.local_candidates();
        let signaling = Arc::clone(&self.signaling);
        tokio::spawn(async move {
            loop {
                match candidates.recv().await {
                    Ok(candidate) => {
                        let message = SignalMessage::CallIceCandidate {
                            call_id,
                            target_user_id: target.clone(),
                            candidate,
                        };
                        if let Err(err) = signaling.send(message).await {
                            debug!(%call_id, error = %err, "candidate trickle dropped");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_state_watcher(&self, link: &Arc<PeerLink>) -> JoinHandle<()> {
        let mut states = link.state_changes();
        let manager = self.weak_handle();
        let grace = self.config.disconnect_grace;
        tokio::spawn(async move {
            loop {
                let state = match states.recv().await {
                    Ok(state) => state,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match state {
                    LinkState::Failed => {
                        manager.finish(EndReason::ConnectionFailed).await;
                        break;
                    }
                    LinkState::Disconnected => {
                        // Possibly transient; tear down only if it lasts
                        let mut recovered = false;
                        let deadline = tokio::time::Instant::now() + grace;
                        loop {
                            match tokio::time::timeout_at(deadline, states.recv()).await {
                                Ok(Ok(LinkState::Connected | LinkState::Connecting)) => {
                                    recovered = true;
                                    break;
                                }
                                Ok(Ok(LinkState::Failed)) | Err(_) => break,
                                Ok(Ok(_)) => continue,
                                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                                Ok(Err(broadcast::error::RecvError::Closed)) => return,
                            }
                        }
                        if !recovered {
                            manager.finish(EndReason::ConnectionFailed).await;
                            break;
                        }
                    }
                    LinkState::Closed => break,
                    _ => {}
                }
            }
        })
    }

    fn weak_handle(&self) -> TeardownHandle {
        TeardownHandle {
            active: Arc::clone(&self.active),
            feedback: Arc::clone(&self.feedback),
            events: self.events.clone(),
        }
    }

    /// Tear the session down exactly once and return to Idle
    async fn finish(&self, reason: EndReason) {
        self.weak_handle().finish(reason).await;
    }

    async fn cleanup(&self, call: ActiveCall) {
        cleanup_call(call).await;
    }
}

/// Just enough of the manager to tear a session down from a spawned task
struct TeardownHandle {
    active: Arc<Mutex<Option<ActiveCall>>>,
    feedback: Arc<dyn FeedbackSink>,
    events: broadcast::Sender<CallEvent>,
}

impl TeardownHandle {
    async fn finish(&self, reason: EndReason) {
        let Some(call) = self.active.lock().await.take() else {
            return;
        };
        let call_id = call.id;
        let was_ringing = matches!(
            call.phase,
            CallPhase::RingingInbound | CallPhase::RingingOutbound
        );
        let tasks = cleanup_call(call).await;

        self.feedback.stop(Cue::Dialing);
        self.feedback.stop(Cue::Ringing);
        if !was_ringing || reason == EndReason::Hangup {
            self.feedback.play(Cue::Ended);
        }
        info!(%call_id, ?reason, "call ended");
        let _ = self.events.send(CallEvent::Ended { call_id, reason });

        // Aborting last: finish may run inside one of these tasks, and
        // nothing awaits after this point.
        for task in tasks {
            task.abort();
        }
    }
}

async fn cleanup_call(call: ActiveCall) -> Vec<JoinHandle<()>> {
    if let Some(stream) = &call.stream {
        stream.stop();
    }
    if let Some(link) = &call.link {
        link.close().await;
    }
    call.tasks
}

//! Shared test doubles for the integration suites

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use huddle_rtc::{
    ApiError, IceCandidate, JoinDecision, LinkState, LocalStream, LocalTrack, MediaError,
    MediaKind, PeerBackend, PeerError, PeerFactory, RaisedHand, RoomApi, RoomId, RoomInfo,
    RoomKind, RoomSnapshot, SessionDescription, SignalMessage, SignalSender, TransportError,
    UserId,
};

/// Wire the test binary into tracing; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Signal sender that queues outbound messages for the test to relay
pub struct QueueSignal {
    queue: Mutex<VecDeque<SignalMessage>>,
}

impl QueueSignal {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Drain everything published so far
    pub fn drain(&self) -> Vec<SignalMessage> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Peek without draining
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl SignalSender for QueueSignal {
    async fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        self.queue.lock().unwrap().push_back(message);
        Ok(())
    }
}

/// What the server does to a call message while relaying it
pub fn relay(message: SignalMessage) -> SignalMessage {
    match message {
        SignalMessage::CallInitiate {
            call_id,
            kind,
            offer,
            caller,
            ..
        } => SignalMessage::CallIncoming {
            call_id,
            caller_id: caller.id.clone(),
            kind,
            offer,
            caller,
        },
        SignalMessage::CallEnd {
            call_id,
            target_user_id,
        } => SignalMessage::CallEnded {
            call_id,
            target_user_id,
        },
        SignalMessage::CallReject {
            call_id,
            target_user_id,
        } => SignalMessage::CallRejected {
            call_id,
            target_user_id,
        },
        other => other,
    }
}

/// One recorded backend operation
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOp {
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    AddTrack(String),
    ReplaceVideo(Option<String>),
    Close,
}

/// Negotiation backend that records operations and answers with canned SDP
pub struct MockBackend {
    ops: Mutex<Vec<BackendOp>>,
    state_tx: broadcast::Sender<LinkState>,
    candidate_tx: broadcast::Sender<IceCandidate>,
}

impl MockBackend {
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(32);
        let (candidate_tx, _) = broadcast::channel(32);
        Self {
            ops: Mutex::new(Vec::new()),
            state_tx,
            candidate_tx,
        }
    }

    pub fn ops(&self) -> Vec<BackendOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Drive the observed connection state from the test
    pub fn push_state(&self, state: LinkState) {
        let _ = self.state_tx.send(state);
    }

    /// Trickle a locally discovered candidate from the test
    pub fn push_candidate(&self, candidate: IceCandidate) {
        let _ = self.candidate_tx.send(candidate);
    }

    fn record(&self, op: BackendOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl PeerBackend for MockBackend {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record(BackendOp::CreateOffer);
        Ok(SessionDescription::offer("mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record(BackendOp::CreateAnswer);
        Ok(SessionDescription::answer("mock-answer"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(BackendOp::SetRemote(desc));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record(BackendOp::AddCandidate(candidate));
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        self.record(BackendOp::AddTrack(track.id().to_string()));
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), PeerError> {
        self.record(BackendOp::ReplaceVideo(track.map(|t| t.id().to_string())));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(BackendOp::Close);
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

/// Factory keeping a handle to every backend it created
pub struct MockFactory {
    backends: Mutex<Vec<Arc<MockBackend>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            backends: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<Arc<MockBackend>> {
        self.backends.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerFactory for MockFactory {
    async fn create(&self) -> Result<Arc<dyn PeerBackend>, PeerError> {
        let backend = Arc::new(MockBackend::new());
        self.backends.lock().unwrap().push(Arc::clone(&backend));
        Ok(backend)
    }
}

/// Media source that counts acquisitions and remembers the last display track
pub struct CountingMediaSource {
    inner: huddle_rtc::SyntheticMediaSource,
    acquisitions: AtomicU32,
    last_display_track: Mutex<Option<Arc<LocalTrack>>>,
}

impl CountingMediaSource {
    pub fn new() -> Self {
        Self {
            inner: huddle_rtc::SyntheticMediaSource::new(),
            acquisitions: AtomicU32::new(0),
            last_display_track: Mutex::new(None),
        }
    }

    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn last_display_track(&self) -> Option<Arc<LocalTrack>> {
        self.last_display_track.lock().unwrap().clone()
    }
}

#[async_trait]
impl huddle_rtc::MediaSource for CountingMediaSource {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(kind).await
    }

    async fn acquire_display(&self) -> Result<LocalStream, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let stream = self.inner.acquire_display().await?;
        *self.last_display_track.lock().unwrap() =
            stream.video_tracks().next().cloned();
        Ok(stream)
    }
}

/// Room API scripted per test: room "open" admits immediately, room
/// "gated" defers; the admin of served rooms is configurable
pub struct ScriptedRoomApi {
    pub admin: UserId,
    pub kind: RoomKind,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRoomApi {
    pub fn new(admin: &str, kind: RoomKind) -> Self {
        Self {
            admin: UserId::new(admin),
            kind,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn snapshot(&self, room_id: &RoomId) -> RoomSnapshot {
        RoomSnapshot {
            room: RoomInfo {
                id: room_id.clone(),
                name: "scripted room".into(),
                kind: self.kind,
                require_approval: room_id.as_str() == "gated",
                creator_id: self.admin.clone(),
            },
            speakers: vec![self.admin.clone()],
            listeners: Vec::new(),
            raised_hands: Vec::<RaisedHand>::new(),
        }
    }
}

#[async_trait]
impl RoomApi for ScriptedRoomApi {
    async fn create_room(
        &self,
        name: &str,
        kind: RoomKind,
        require_approval: bool,
    ) -> Result<RoomInfo, ApiError> {
        self.record("create_room");
        Ok(RoomInfo {
            id: RoomId::new("created"),
            name: name.to_string(),
            kind,
            require_approval,
            creator_id: self.admin.clone(),
        })
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<RoomSnapshot, ApiError> {
        self.record("join_room");
        Ok(self.snapshot(room_id))
    }

    async fn request_join(&self, room_id: &RoomId) -> Result<JoinDecision, ApiError> {
        self.record("request_join");
        if room_id.as_str() == "gated" {
            Ok(JoinDecision::Deferred)
        } else {
            Ok(JoinDecision::Admitted(self.snapshot(room_id)))
        }
    }

    async fn approve_request(&self, _: &RoomId, _: &UserId) -> Result<(), ApiError> {
        self.record("approve_request");
        Ok(())
    }

    async fn reject_request(&self, _: &RoomId, _: &UserId) -> Result<(), ApiError> {
        self.record("reject_request");
        Ok(())
    }

    async fn toggle_hand(&self, _: &RoomId) -> Result<(), ApiError> {
        self.record("toggle_hand");
        Ok(())
    }

    async fn promote(&self, _: &RoomId, _: &UserId) -> Result<(), ApiError> {
        self.record("promote");
        Ok(())
    }

    async fn demote(&self, _: &RoomId, _: &UserId) -> Result<(), ApiError> {
        self.record("demote");
        Ok(())
    }

    async fn leave_room(&self, _: &RoomId) -> Result<(), ApiError> {
        self.record("leave_room");
        Ok(())
    }

    async fn delete_room(&self, _: &RoomId) -> Result<(), ApiError> {
        self.record("delete_room");
        Ok(())
    }
}

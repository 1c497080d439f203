//! End-to-end room flows over mock collaborators

mod common;

use std::sync::Arc;

use common::{BackendOp, CountingMediaSource, MockFactory, QueueSignal, ScriptedRoomApi};
use huddle_rtc::{
    FeedbackSink, IceCandidate, MediaSource, NullFeedback, PeerFactory, RoomApi, RoomConfig,
    RoomId, RoomKind, RoomManager, RoomPeer, RoomPhase, SessionDescription, SignalMessage,
    SignalSender, SocketId, UserId, UserInfo,
};

struct Endpoint {
    rooms: Arc<RoomManager>,
    out: Arc<QueueSignal>,
    factory: Arc<MockFactory>,
    media: Arc<CountingMediaSource>,
    api: Arc<ScriptedRoomApi>,
}

fn endpoint(name: &str, socket: &str, api: Arc<ScriptedRoomApi>) -> Endpoint {
    common::init_tracing();
    let out = Arc::new(QueueSignal::new());
    let factory = Arc::new(MockFactory::new());
    let media = Arc::new(CountingMediaSource::new());
    let rooms = Arc::new(RoomManager::new(
        Arc::clone(&api) as Arc<dyn RoomApi>,
        Arc::clone(&out) as Arc<dyn SignalSender>,
        Arc::clone(&media) as Arc<dyn MediaSource>,
        Arc::clone(&factory) as Arc<dyn PeerFactory>,
        Arc::new(NullFeedback) as Arc<dyn FeedbackSink>,
        UserInfo::new(name, name),
        SocketId::new(socket),
        RoomConfig::default(),
    ));
    Endpoint {
        rooms,
        out,
        factory,
        media,
        api,
    }
}

fn assert_roles_exclusive(view: &huddle_rtc::RoomView) {
    for speaker in &view.speakers {
        assert!(
            !view.listeners.contains(speaker),
            "{speaker} is in both role sets"
        );
    }
}

#[tokio::test]
async fn test_scenario_approval_gated_join() {
    let room_id = RoomId::new("gated");
    let a = endpoint("a", "sock-a", Arc::new(ScriptedRoomApi::new("a", RoomKind::Voice)));
    let b = endpoint("b", "sock-b", Arc::new(ScriptedRoomApi::new("a", RoomKind::Voice)));

    // A owns an approval-gated room
    a.rooms
        .create_room("gated room", RoomKind::Voice, true)
        .await
        .unwrap();
    assert!(a.rooms.view().await.unwrap().is_admin);

    // B asks to join; the server defers to the admin
    let phase = b.rooms.request_to_join(&room_id).await.unwrap();
    assert_eq!(phase, RoomPhase::WaitingApproval);
    // No media, no participants entry, nothing on the wire while waiting
    assert_eq!(b.media.acquisitions(), 0);
    assert!(b.out.sent().is_empty());

    // A sees the request and approves it
    a.rooms
        .handle_signal(SignalMessage::RoomJoinRequest {
            room_id: RoomId::new("created"),
            user: UserInfo::new("b", "b"),
        })
        .await;
    assert_eq!(a.rooms.view().await.unwrap().pending_requests.len(), 1);
    a.rooms.approve_request(&UserId::new("b")).await.unwrap();
    assert!(a.api.calls().contains(&"approve_request".to_string()));
    assert!(a.rooms.view().await.unwrap().pending_requests.is_empty());

    // B hears the approval and completes the join
    b.rooms
        .handle_signal(SignalMessage::RoomRequestApproved {
            room_id: room_id.clone(),
        })
        .await;
    assert_eq!(b.rooms.phase().await, RoomPhase::InRoom);
    assert_eq!(b.media.acquisitions(), 1);

    // The server lists A as the existing member; B offers to A
    b.rooms
        .handle_signal(SignalMessage::RoomExistingUsers {
            room_id: room_id.clone(),
            users: vec![RoomPeer {
                user_id: UserId::new("a"),
                socket_id: SocketId::new("sock-a"),
            }],
        })
        .await;
    let b_sent = b.out.drain();
    let offer = b_sent
        .iter()
        .find_map(|m| match m {
            SignalMessage::RoomOffer {
                target_socket_id,
                payload,
                ..
            } => Some((target_socket_id.clone(), payload.clone())),
            _ => None,
        })
        .expect("joiner must offer to the existing member");
    assert_eq!(offer.0, SocketId::new("sock-a"));

    // A answers; B applies it
    a.rooms
        .handle_signal(SignalMessage::RoomOffer {
            room_id: RoomId::new("created"),
            from_socket_id: SocketId::new("sock-b"),
            from_user_id: UserId::new("b"),
            target_socket_id: SocketId::new("sock-a"),
            payload: offer.1,
        })
        .await;
    let answer = a
        .out
        .drain()
        .into_iter()
        .find_map(|m| match m {
            SignalMessage::RoomAnswer { payload, .. } => Some(payload),
            _ => None,
        })
        .expect("existing member must answer");
    b.rooms
        .handle_signal(SignalMessage::RoomAnswer {
            room_id: room_id.clone(),
            from_socket_id: SocketId::new("sock-a"),
            from_user_id: UserId::new("a"),
            target_socket_id: SocketId::new("sock-b"),
            payload: answer,
        })
        .await;

    // Both ends hold one negotiated connection to the other
    let a_view = a.rooms.view().await.unwrap();
    let b_view = b.rooms.view().await.unwrap();
    assert!(a_view.participants.iter().any(|p| p.connected));
    assert!(b_view.participants.iter().any(|p| p.connected));
    assert_roles_exclusive(&a_view);
    assert_roles_exclusive(&b_view);
}

#[tokio::test]
async fn test_rejected_request_reverts_without_media() {
    let b = endpoint("b", "sock-b", Arc::new(ScriptedRoomApi::new("a", RoomKind::Voice)));
    let room_id = RoomId::new("gated");

    b.rooms.request_to_join(&room_id).await.unwrap();
    b.rooms
        .handle_signal(SignalMessage::RoomRequestRejected {
            room_id: room_id.clone(),
        })
        .await;

    assert_eq!(b.rooms.phase().await, RoomPhase::NotInRoom);
    assert_eq!(b.media.acquisitions(), 0);
    // A late approval changes nothing
    b.rooms
        .handle_signal(SignalMessage::RoomRequestApproved { room_id })
        .await;
    assert_eq!(b.rooms.phase().await, RoomPhase::NotInRoom);
}

#[tokio::test]
async fn test_scenario_demotion_forces_mute_on_demoted_speaker() {
    let s = endpoint("s", "sock-s", Arc::new(ScriptedRoomApi::new("admin", RoomKind::Voice)));
    s.rooms.join_room(&RoomId::new("open")).await.unwrap();
    s.out.drain();

    // S is an unmuted speaker
    let view = s.rooms.view().await.unwrap();
    assert!(view.speakers.contains(&UserId::new("s")));
    assert!(!view.is_muted);

    // The admin demotes S
    s.rooms
        .handle_signal(SignalMessage::RoomUserDemoted {
            user_id: UserId::new("s"),
        })
        .await;

    let view = s.rooms.view().await.unwrap();
    assert!(view.is_muted, "demotion must force-mute");
    assert!(!view.speakers.contains(&UserId::new("s")));
    assert_eq!(
        view.listeners
            .iter()
            .filter(|u| **u == UserId::new("s"))
            .count(),
        1
    );
    assert_roles_exclusive(&view);
    // Remote UIs converge through the usual mute broadcast
    assert!(s.out.drain().iter().any(|m| matches!(
        m,
        SignalMessage::RoomMuteChange { is_muted: true, .. }
    )));
}

#[tokio::test]
async fn test_existing_members_wait_for_the_newcomer() {
    let a = endpoint("a", "sock-a", Arc::new(ScriptedRoomApi::new("a", RoomKind::Voice)));
    a.rooms
        .create_room("room", RoomKind::Voice, false)
        .await
        .unwrap();
    a.out.drain();

    a.rooms
        .handle_signal(SignalMessage::RoomUserJoined {
            room_id: RoomId::new("created"),
            socket_id: SocketId::new("sock-c"),
            user: UserInfo::new("c", "c"),
        })
        .await;

    // The existing member records the newcomer and initiates nothing
    let view = a.rooms.view().await.unwrap();
    assert_eq!(view.participants.len(), 1);
    assert!(!view.participants[0].connected);
    assert!(a.out.drain().is_empty());
    assert!(a.factory.created().is_empty());
}

#[tokio::test]
async fn test_candidates_ahead_of_offer_apply_after_description() {
    let a = endpoint("a", "sock-a", Arc::new(ScriptedRoomApi::new("a", RoomKind::Voice)));
    a.rooms
        .create_room("room", RoomKind::Voice, false)
        .await
        .unwrap();

    // Candidates from a peer whose negotiation has not started yet
    for name in ["c1", "c2"] {
        a.rooms
            .handle_signal(SignalMessage::RoomIceCandidate {
                room_id: RoomId::new("created"),
                from_socket_id: SocketId::new("sock-c"),
                target_socket_id: SocketId::new("sock-a"),
                payload: IceCandidate::new(name),
            })
            .await;
    }
    assert!(a.factory.created().is_empty());

    // Their offer arrives
    a.rooms
        .handle_signal(SignalMessage::RoomOffer {
            room_id: RoomId::new("created"),
            from_socket_id: SocketId::new("sock-c"),
            from_user_id: UserId::new("c"),
            target_socket_id: SocketId::new("sock-a"),
            payload: SessionDescription::offer("c-offer"),
        })
        .await;

    let ops = a.factory.created()[0].ops();
    let desc_pos = ops
        .iter()
        .position(|op| matches!(op, BackendOp::SetRemote(_)))
        .unwrap();
    let applied: Vec<(usize, String)> = ops
        .iter()
        .enumerate()
        .filter_map(|(i, op)| match op {
            BackendOp::AddCandidate(c) => Some((i, c.candidate.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        applied.iter().map(|(_, c)| c.as_str()).collect::<Vec<_>>(),
        vec!["c1", "c2"]
    );
    assert!(applied.iter().all(|(i, _)| *i > desc_pos));
}

#[tokio::test]
async fn test_screen_share_replaces_and_restores_tracks() {
    let a = endpoint("a", "sock-a", Arc::new(ScriptedRoomApi::new("a", RoomKind::Video)));
    a.rooms
        .create_room("room", RoomKind::Video, false)
        .await
        .unwrap();

    // One negotiated peer in the mesh
    a.rooms
        .handle_signal(SignalMessage::RoomOffer {
            room_id: RoomId::new("created"),
            from_socket_id: SocketId::new("sock-c"),
            from_user_id: UserId::new("c"),
            target_socket_id: SocketId::new("sock-a"),
            payload: SessionDescription::offer("c-offer"),
        })
        .await;
    a.out.drain();

    a.rooms.start_screen_share().await.unwrap();
    assert!(a.rooms.view().await.unwrap().is_screen_sharing);
    assert!(a.out.drain().iter().any(|m| matches!(
        m,
        SignalMessage::RoomScreenStart { .. }
    )));
    let backend = &a.factory.created()[0];
    let swapped_to_screen = backend.ops().iter().any(|op| {
        matches!(op, BackendOp::ReplaceVideo(Some(id)) if id.starts_with("screen"))
    });
    assert!(swapped_to_screen, "screen track must replace the camera track");
    // Starting twice is refused
    assert!(a.rooms.start_screen_share().await.is_err());

    a.rooms.stop_screen_share().await.unwrap();
    assert!(!a.rooms.view().await.unwrap().is_screen_sharing);
    let restored_camera = backend.ops().iter().any(|op| {
        matches!(op, BackendOp::ReplaceVideo(Some(id)) if id.starts_with("cam"))
    });
    assert!(restored_camera, "camera track must come back");
    assert!(a.out.drain().iter().any(|m| matches!(
        m,
        SignalMessage::RoomScreenStop { .. }
    )));
    // Stopping again is refused
    assert!(a.rooms.stop_screen_share().await.is_err());
}

#[tokio::test]
async fn test_externally_ended_capture_reverts_automatically() {
    let a = endpoint("a", "sock-a", Arc::new(ScriptedRoomApi::new("a", RoomKind::Video)));
    a.rooms
        .create_room("room", RoomKind::Video, false)
        .await
        .unwrap();
    a.rooms.start_screen_share().await.unwrap();
    a.out.drain();

    // The user ends the share at the platform level, outside our controls
    a.media.last_display_track().unwrap().stop();

    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while a.rooms.view().await.unwrap().is_screen_sharing {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("share must revert on its own");
    assert!(a.out.drain().iter().any(|m| matches!(
        m,
        SignalMessage::RoomScreenStop { .. }
    )));
}

#[tokio::test]
async fn test_repeated_offer_closes_the_superseded_link() {
    let a = endpoint("a", "sock-a", Arc::new(ScriptedRoomApi::new("a", RoomKind::Voice)));
    a.rooms
        .create_room("room", RoomKind::Voice, false)
        .await
        .unwrap();

    for sdp in ["c-offer", "c-offer-retry"] {
        a.rooms
            .handle_signal(SignalMessage::RoomOffer {
                room_id: RoomId::new("created"),
                from_socket_id: SocketId::new("sock-c"),
                from_user_id: UserId::new("c"),
                target_socket_id: SocketId::new("sock-a"),
                payload: SessionDescription::offer(sdp),
            })
            .await;
    }

    // The first connection is closed before the replacement goes live
    let backends = a.factory.created();
    assert_eq!(backends.len(), 2);
    assert!(backends[0]
        .ops()
        .iter()
        .any(|op| matches!(op, BackendOp::Close)));
    assert!(!backends[1]
        .ops()
        .iter()
        .any(|op| matches!(op, BackendOp::Close)));
    // Still exactly one participant, still connected, answered both times
    let view = a.rooms.view().await.unwrap();
    assert_eq!(view.participants.len(), 1);
    assert!(view.participants[0].connected);
    let answers = a
        .out
        .drain()
        .into_iter()
        .filter(|m| matches!(m, SignalMessage::RoomAnswer { .. }))
        .count();
    assert_eq!(answers, 2);
}

#[tokio::test]
async fn test_participant_departure_cleans_up() {
    let a = endpoint("a", "sock-a", Arc::new(ScriptedRoomApi::new("a", RoomKind::Voice)));
    a.rooms
        .create_room("room", RoomKind::Voice, false)
        .await
        .unwrap();
    a.rooms
        .handle_signal(SignalMessage::RoomOffer {
            room_id: RoomId::new("created"),
            from_socket_id: SocketId::new("sock-c"),
            from_user_id: UserId::new("c"),
            target_socket_id: SocketId::new("sock-a"),
            payload: SessionDescription::offer("c-offer"),
        })
        .await;
    assert_eq!(a.rooms.view().await.unwrap().participants.len(), 1);

    a.rooms
        .handle_signal(SignalMessage::RoomUserLeft {
            room_id: RoomId::new("created"),
            socket_id: SocketId::new("sock-c"),
            user_id: UserId::new("c"),
        })
        .await;

    let view = a.rooms.view().await.unwrap();
    assert!(view.participants.is_empty());
    assert!(!view.speakers.contains(&UserId::new("c")));
    assert!(!view.listeners.contains(&UserId::new("c")));
    let closes = a.factory.created()[0]
        .ops()
        .into_iter()
        .filter(|op| matches!(op, BackendOp::Close))
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_leave_closes_every_mesh_connection() {
    let a = endpoint("a", "sock-a", Arc::new(ScriptedRoomApi::new("a", RoomKind::Voice)));
    a.rooms
        .create_room("room", RoomKind::Voice, false)
        .await
        .unwrap();
    for socket in ["sock-c", "sock-d"] {
        a.rooms
            .handle_signal(SignalMessage::RoomOffer {
                room_id: RoomId::new("created"),
                from_socket_id: SocketId::new(socket),
                from_user_id: UserId::new(socket),
                target_socket_id: SocketId::new("sock-a"),
                payload: SessionDescription::offer("offer"),
            })
            .await;
    }

    a.rooms.leave_room().await.unwrap();
    assert_eq!(a.rooms.phase().await, RoomPhase::NotInRoom);
    assert!(a.api.calls().contains(&"leave_room".to_string()));
    for backend in a.factory.created() {
        assert!(backend
            .ops()
            .iter()
            .any(|op| matches!(op, BackendOp::Close)));
    }
}

#[tokio::test]
async fn test_live_room_joiners_enter_as_listeners() {
    let b = endpoint("b", "sock-b", Arc::new(ScriptedRoomApi::new("admin", RoomKind::Live)));
    b.rooms.join_room(&RoomId::new("open")).await.unwrap();
    let view = b.rooms.view().await.unwrap();
    assert!(view.listeners.contains(&UserId::new("b")));
    assert!(!view.speakers.contains(&UserId::new("b")));
    assert_roles_exclusive(&view);
}

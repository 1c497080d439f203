//! End-to-end call flows over a relayed pair of managers

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{relay, BackendOp, MockFactory, QueueSignal};
use huddle_rtc::{
    CallConfig, CallError, CallEvent, CallManager, CallPhase, FeedbackSink, IceCandidate,
    LinkState, MediaKind, NullFeedback, PeerFactory, SignalMessage, SignalSender,
    SyntheticMediaSource, UserId, UserInfo,
};

fn endpoint(name: &str, config: CallConfig) -> (Arc<CallManager>, Arc<QueueSignal>, Arc<MockFactory>) {
    common::init_tracing();
    let signal = Arc::new(QueueSignal::new());
    let factory = Arc::new(MockFactory::new());
    let manager = Arc::new(CallManager::new(
        Arc::clone(&signal) as Arc<dyn SignalSender>,
        Arc::new(SyntheticMediaSource::new()),
        Arc::clone(&factory) as Arc<dyn PeerFactory>,
        Arc::new(NullFeedback) as Arc<dyn FeedbackSink>,
        UserInfo::new(name, name),
        config,
    ));
    (manager, signal, factory)
}

/// Deliver everything one side published to the other, as the server would
async fn pump(from: &QueueSignal, to: &CallManager) {
    for message in from.drain() {
        to.handle_signal(relay(message)).await;
    }
}

#[tokio::test]
async fn test_scenario_video_call_connects_both_ends() {
    let (x, x_out, x_factory) = endpoint("x", CallConfig::default());
    let (y, y_out, y_factory) = endpoint("y", CallConfig::default());

    // X calls Y with video
    let call_id = x
        .initiate_call(UserId::new("y"), MediaKind::Video)
        .await
        .unwrap();
    assert_eq!(x.phase().await, CallPhase::RingingOutbound);

    pump(&x_out, &y).await;
    assert_eq!(y.phase().await, CallPhase::RingingInbound);
    let y_snapshot = y.snapshot().await.unwrap();
    assert_eq!(y_snapshot.call_id, call_id);
    assert_eq!(y_snapshot.kind, MediaKind::Video);

    // Y accepts; its answer is queued but not yet delivered
    y.accept_call().await.unwrap();
    assert_eq!(y.phase().await, CallPhase::Connected);

    // Three of Y's candidates race ahead of the answer
    for name in ["yc1", "yc2", "yc3"] {
        x.handle_signal(SignalMessage::CallIceCandidate {
            call_id,
            target_user_id: UserId::new("x"),
            candidate: IceCandidate::new(name),
        })
        .await;
    }

    // Now the answer lands
    pump(&y_out, &x).await;
    assert_eq!(x.phase().await, CallPhase::Connected);

    // Exactly one peer connection per end
    assert_eq!(x_factory.created().len(), 1);
    assert_eq!(y_factory.created().len(), 1);

    // No candidate lost: all three applied, after the answer, in order
    let ops = x_factory.created()[0].ops();
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
        vec!["yc1", "yc2", "yc3"]
    );
    assert!(applied.iter().all(|(i, _)| *i > desc_pos));
}

#[tokio::test]
async fn test_single_active_call_is_enforced() {
    let (x, x_out, _) = endpoint("x", CallConfig::default());
    let (y, _, _) = endpoint("y", CallConfig::default());

    let first = x
        .initiate_call(UserId::new("y"), MediaKind::Audio)
        .await
        .unwrap();
    pump(&x_out, &y).await;

    // While ringing outbound
    assert!(matches!(
        x.initiate_call(UserId::new("z"), MediaKind::Audio)
            .await
            .unwrap_err(),
        CallError::AlreadyActive
    ));
    // While ringing inbound
    assert!(matches!(
        y.initiate_call(UserId::new("z"), MediaKind::Audio)
            .await
            .unwrap_err(),
        CallError::AlreadyActive
    ));
    // The existing sessions are untouched
    assert_eq!(x.snapshot().await.unwrap().call_id, first);
    assert_eq!(y.snapshot().await.unwrap().call_id, first);
}

#[tokio::test]
async fn test_teardown_is_idempotent_after_remote_end() {
    let (x, x_out, x_factory) = endpoint("x", CallConfig::default());
    let (y, y_out, _) = endpoint("y", CallConfig::default());

    x.initiate_call(UserId::new("y"), MediaKind::Audio)
        .await
        .unwrap();
    pump(&x_out, &y).await;
    y.accept_call().await.unwrap();
    pump(&y_out, &x).await;
    assert_eq!(x.phase().await, CallPhase::Connected);

    // Y hangs up; X learns of it
    y.end_call().await.unwrap();
    pump(&y_out, &x).await;
    assert_eq!(x.phase().await, CallPhase::Idle);

    // Ending again, repeatedly, stays a quiet no-op
    x.end_call().await.unwrap();
    x.end_call().await.unwrap();

    // The peer connection was closed exactly once
    let closes = x_factory.created()[0]
        .ops()
        .into_iter()
        .filter(|op| matches!(op, BackendOp::Close))
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_mute_toggle_leaves_descriptions_untouched() {
    let (x, x_out, x_factory) = endpoint("x", CallConfig::default());
    let (y, y_out, _) = endpoint("y", CallConfig::default());

    x.initiate_call(UserId::new("y"), MediaKind::Video)
        .await
        .unwrap();
    pump(&x_out, &y).await;
    y.accept_call().await.unwrap();
    pump(&y_out, &x).await;

    let ops_before = x_factory.created()[0].ops();
    assert!(x.toggle_mute().await.unwrap());
    assert!(x.toggle_video().await.unwrap());
    assert!(!x.toggle_mute().await.unwrap());
    // No renegotiation: the backend saw nothing at all
    assert_eq!(x_factory.created()[0].ops(), ops_before);
    // And no signaling traffic either, for a 1:1 call
    assert!(x_out.sent().is_empty());
}

#[tokio::test]
async fn test_reject_notifies_caller() {
    let (x, x_out, _) = endpoint("x", CallConfig::default());
    let (y, y_out, y_factory) = endpoint("y", CallConfig::default());

    x.initiate_call(UserId::new("y"), MediaKind::Audio)
        .await
        .unwrap();
    pump(&x_out, &y).await;
    y.reject_call().await.unwrap();
    assert_eq!(y.phase().await, CallPhase::Idle);
    // The callee never touched media or negotiation
    assert!(y_factory.created().is_empty());

    pump(&y_out, &x).await;
    assert_eq!(x.phase().await, CallPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_transient_disconnect_recovers_within_grace() {
    let config = CallConfig {
        disconnect_grace: Duration::from_secs(2),
    };
    let (x, x_out, x_factory) = endpoint("x", config.clone());
    let (y, y_out, _) = endpoint("y", config);

    x.initiate_call(UserId::new("y"), MediaKind::Audio)
        .await
        .unwrap();
    pump(&x_out, &y).await;
    y.accept_call().await.unwrap();
    pump(&y_out, &x).await;
    assert_eq!(x.phase().await, CallPhase::Connected);

    let backend = &x_factory.created()[0];
    backend.push_state(LinkState::Disconnected);
    tokio::time::sleep(Duration::from_millis(500)).await;
    backend.push_state(LinkState::Connected);
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Recovered inside the grace window: no teardown
    assert_eq!(x.phase().await, CallPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_lasting_disconnect_tears_down_exactly_once() {
    let config = CallConfig {
        disconnect_grace: Duration::from_secs(2),
    };
    let (x, x_out, x_factory) = endpoint("x", config.clone());
    let (y, y_out, _) = endpoint("y", config);

    x.initiate_call(UserId::new("y"), MediaKind::Audio)
        .await
        .unwrap();
    pump(&x_out, &y).await;
    y.accept_call().await.unwrap();
    pump(&y_out, &x).await;

    let mut events = x.subscribe_events();
    let backend = &x_factory.created()[0];
    backend.push_state(LinkState::Disconnected);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(x.phase().await, CallPhase::Idle);
    let mut ended = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CallEvent::Ended { .. }) {
            ended += 1;
        }
    }
    assert_eq!(ended, 1);
}

#[tokio::test]
async fn test_failed_link_tears_down_immediately() {
    let (x, x_out, x_factory) = endpoint("x", CallConfig::default());
    let (y, y_out, _) = endpoint("y", CallConfig::default());

    x.initiate_call(UserId::new("y"), MediaKind::Audio)
        .await
        .unwrap();
    pump(&x_out, &y).await;
    y.accept_call().await.unwrap();
    pump(&y_out, &x).await;

    x_factory.created()[0].push_state(LinkState::Failed);
    // Give the watcher a moment to run
    tokio::time::timeout(Duration::from_secs(1), async {
        while x.phase().await != CallPhase::Idle {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(x.phase().await, CallPhase::Idle);
}

#[tokio::test]
async fn test_local_candidates_trickle_to_remote() {
    let (x, x_out, x_factory) = endpoint("x", CallConfig::default());

    let call_id = x
        .initiate_call(UserId::new("y"), MediaKind::Audio)
        .await
        .unwrap();
    x_out.drain();
    x_factory.created()[0].push_candidate(IceCandidate::new("local-1"));
    // The trickle task forwards asynchronously
    tokio::time::timeout(Duration::from_secs(1), async {
        while x_out.sent().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let sent = x_out.drain();
    assert!(sent.iter().any(|m| matches!(
        m,
        SignalMessage::CallIceCandidate { call_id: c, candidate, .. }
            if *c == call_id && candidate.candidate == "local-1"
    )));
}

//! End-to-end private calls between room members

mod common;

use common::{private_state, Room};
use pretty_assertions::assert_eq;
use roomcall_core::prelude::*;
use roomcall_core::{CallDirection, TransportRole, TransportState};
use std::time::Duration;

#[tokio::test]
async fn test_private_call_connects_both_sides() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let mut bob = room.join("bob");

    let call_id = alice.service.start_private_call("bob").await.unwrap();
    alice
        .wait_status(CallStatus::Calling {
            name: "bob".to_string(),
        })
        .await;

    let incoming = bob
        .wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    match incoming {
        CallEvent::IncomingCall { caller, .. } => assert_eq!(caller, alice.participant),
        other => unreachable!("unexpected {other:?}"),
    }
    bob.service.accept_call().await.unwrap();

    alice.wait_status(CallStatus::Connected).await;
    bob.wait_status(CallStatus::Connected).await;

    let caller_view = alice
        .wait_snapshot(|s| s.transports().iter().any(|t| t.remote_tracks == 1))
        .await;
    match caller_view {
        CallSnapshot::Private {
            call_id: id,
            state,
            direction,
            partner_id,
            transport: Some(transport),
            ..
        } => {
            assert_eq!(id, call_id);
            assert_eq!(state, CallState::Active);
            assert_eq!(direction, CallDirection::Outgoing);
            assert_eq!(partner_id.as_ref(), Some(bob.id()));
            assert_eq!(transport.role, TransportRole::Offerer);
            assert_eq!(transport.state, TransportState::Connected);
        }
        other => unreachable!("unexpected {other:?}"),
    }

    let callee_view = bob
        .wait_snapshot(|s| s.transports().iter().any(|t| t.remote_tracks == 1))
        .await;
    match callee_view.transports().as_slice() {
        [t] => {
            assert_eq!(t.role, TransportRole::Answerer);
            assert_eq!(&t.peer, alice.id());
        }
        other => unreachable!("unexpected {other:?}"),
    }
    assert_eq!(room.network.open_links(), 2);
}

#[tokio::test]
async fn test_hangup_releases_everything_on_both_sides() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let mut bob = room.join("bob");

    alice.service.start_private_call("bob").await.unwrap();
    bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    bob.service.accept_call().await.unwrap();
    alice.wait_status(CallStatus::Connected).await;

    alice.service.end_call().await.unwrap();
    alice.service.end_call().await.unwrap();

    let ended = bob
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));
    alice
        .wait_for(|e| {
            matches!(
                e,
                CallEvent::CallEnded {
                    reason: EndReason::LocalHangup,
                    ..
                }
            )
        })
        .await;

    alice.wait_snapshot(|s| *s == CallSnapshot::Idle).await;
    bob.wait_snapshot(|s| *s == CallSnapshot::Idle).await;
    assert_eq!(room.network.open_links(), 0);
    assert_eq!(alice.devices.live_captures(), 0);
    assert_eq!(bob.devices.live_captures(), 0);
}

#[tokio::test]
async fn test_second_hangup_emits_nothing() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let _bob = room.join("bob");

    alice.service.start_private_call("bob").await.unwrap();
    alice.service.end_call().await.unwrap();
    alice
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;

    alice.service.end_call().await.unwrap();
    alice.wait_status(CallStatus::Cleared).await;
    while let Ok(event) = alice.events.try_recv() {
        assert!(
            !matches!(event, CallEvent::CallEnded { .. }),
            "call ended twice"
        );
    }
}

#[tokio::test]
async fn test_rejected_call_never_builds_a_transport() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let mut bob = room.join("bob");

    alice.service.start_private_call("bob").await.unwrap();
    bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    bob.service.reject_call().await.unwrap();

    alice.wait_status(CallStatus::Rejected).await;
    let ended = alice
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded {
            reason: EndReason::Rejected,
            duration_secs: None,
            ..
        }
    ));

    assert_eq!(bob.snapshot().await, CallSnapshot::Idle);
    assert_eq!(bob.devices.captures(), 0);
    assert_eq!(alice.devices.live_captures(), 0);
    assert_eq!(room.network.open_links(), 0);
    alice.wait_snapshot(|s| *s == CallSnapshot::Idle).await;
}

#[tokio::test]
async fn test_calling_absent_member_reports_unavailable() {
    let room = Room::new();
    let mut alice = room.join("alice");

    alice.service.start_private_call("nobody").await.unwrap();

    alice
        .wait_status(CallStatus::Unavailable {
            name: "nobody".to_string(),
        })
        .await;
    alice.wait_snapshot(|s| *s == CallSnapshot::Idle).await;
    assert_eq!(alice.devices.live_captures(), 0);
}

#[tokio::test]
async fn test_busy_callee_auto_rejects() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let mut bob = room.join("bob");
    let mut carol = room.join("carol");

    alice.service.start_private_call("bob").await.unwrap();
    bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;

    carol.service.start_private_call("bob").await.unwrap();
    carol.wait_status(CallStatus::Rejected).await;

    match bob.snapshot().await {
        CallSnapshot::Private { partner, state, .. } => {
            assert_eq!(partner, "alice");
            assert_eq!(state, CallState::Ringing);
        }
        other => unreachable!("unexpected {other:?}"),
    }
    bob.service.accept_call().await.unwrap();
    alice.wait_status(CallStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_path_fails_after_connect_timeout() {
    let room = Room::new();
    room.network.stall_connections(true);
    let mut alice = room.join("alice");
    let patient = CallConfig {
        connect_timeout_ms: 120_000,
        ..room.config.clone()
    };
    let mut bob = room.join_with_config("bob", patient);

    alice.service.start_private_call("bob").await.unwrap();
    bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    bob.service.accept_call().await.unwrap();

    let started = tokio::time::Instant::now();
    alice
        .wait_for_within(Duration::from_secs(60), |e| {
            matches!(e, CallEvent::Status(CallStatus::Failed))
        })
        .await;
    assert!(started.elapsed() >= Duration::from_secs(29));

    let ended = alice
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded {
            reason: EndReason::Failed(_),
            ..
        }
    ));
    assert_eq!(private_state(&alice.snapshot().await), Some(CallState::Failed));
    alice.wait_snapshot(|s| *s == CallSnapshot::Idle).await;
    assert_eq!(room.network.open_links_of(alice.id()), 0);

    let ended = bob
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));
}

#[tokio::test]
async fn test_mute_toggles_during_call() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let mut bob = room.join("bob");

    assert!(alice.service.toggle_mute().await.is_err());

    alice.service.start_private_call("bob").await.unwrap();
    bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    bob.service.accept_call().await.unwrap();
    alice.wait_status(CallStatus::Connected).await;

    assert!(alice.service.toggle_mute().await.unwrap());
    alice
        .wait_for(|e| matches!(e, CallEvent::MuteChanged { muted: true }))
        .await;
    assert!(!alice.service.toggle_mute().await.unwrap());
}

#[tokio::test]
async fn test_late_answer_from_abandoned_callee_is_refused() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let mut bob = room.join("bob");
    let mut carol = room.join("carol");

    alice.service.start_private_call("carol").await.unwrap();
    carol
        .wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    alice.service.end_call().await.unwrap();

    alice.service.start_private_call("bob").await.unwrap();
    bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;

    carol.service.accept_call().await.unwrap();
    carol
        .wait_for(|e| {
            matches!(
                e,
                CallEvent::CallEnded {
                    reason: EndReason::RemoteHangup,
                    ..
                }
            )
        })
        .await;

    match alice.snapshot().await {
        CallSnapshot::Private {
            state,
            partner,
            partner_id,
            transport,
            ..
        } => {
            assert_eq!(state, CallState::Requesting);
            assert_eq!(partner, "bob");
            assert_eq!(partner_id, None);
            assert!(transport.is_none());
        }
        other => unreachable!("unexpected {other:?}"),
    }

    bob.service.accept_call().await.unwrap();
    alice.wait_status(CallStatus::Connected).await;
    let view = alice
        .wait_snapshot(|s| matches!(s, CallSnapshot::Private { state: CallState::Active, .. }))
        .await;
    match view {
        CallSnapshot::Private { partner_id, .. } => assert_eq!(partner_id.as_ref(), Some(bob.id())),
        other => unreachable!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_late_reject_from_abandoned_callee_is_ignored() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let mut bob = room.join("bob");
    let mut carol = room.join("carol");

    alice.service.start_private_call("carol").await.unwrap();
    carol
        .wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    alice.service.end_call().await.unwrap();

    alice.service.start_private_call("bob").await.unwrap();
    bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;

    carol.service.reject_call().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        private_state(&alice.snapshot().await),
        Some(CallState::Requesting)
    );
    bob.service.accept_call().await.unwrap();
    alice.wait_status(CallStatus::Connected).await;
}

//! Misbehaving relay peers must not disturb calls in progress

mod common;

use common::Room;
use pretty_assertions::assert_eq;
use roomcall_core::prelude::*;
use roomcall_core::{IceCandidate, SessionDescription};
use std::time::Duration;

#[tokio::test]
async fn test_foreign_messages_leave_active_call_untouched() {
    let room = Room::new();
    let mut alice = room.join("alice");
    let mut bob = room.join("bob");
    let (mallory, _mallory_inbox) = room.relay.connect(Participant::new("mallory-1", "mallory"));

    alice.service.start_private_call("bob").await.unwrap();
    bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    bob.service.accept_call().await.unwrap();
    alice.wait_status(CallStatus::Connected).await;

    let junk = [
        OutboundSignal::SdpAnswer {
            description: SessionDescription::answer("v=0\r\n"),
            target_id: alice.id().clone(),
        },
        OutboundSignal::SdpOffer {
            description: SessionDescription::offer(""),
            target_id: alice.id().clone(),
        },
        OutboundSignal::IceCandidate {
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.9 9 typ host"),
            target_id: alice.id().clone(),
        },
        OutboundSignal::CallEnded {
            peer_id: alice.id().clone(),
        },
        OutboundSignal::CallAccept {
            peer_id: alice.id().clone(),
        },
    ];
    for signal in junk {
        mallory.send(signal).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.service.toggle_mute().await.unwrap();
    match alice.snapshot().await {
        CallSnapshot::Private {
            state,
            partner,
            transport: Some(transport),
            ..
        } => {
            assert_eq!(state, CallState::Active);
            assert_eq!(partner, "bob");
            assert_eq!(&transport.peer, bob.id());
        }
        other => unreachable!("unexpected {other:?}"),
    }
    assert_eq!(
        room.network.candidates_received(alice.id(), &SessionId::new("mallory-1")),
        0
    );
}

#[tokio::test]
async fn test_unexpected_answer_while_idle_is_ignored() {
    let room = Room::new();
    let alice = room.join("alice");
    let (mallory, _inbox) = room.relay.connect(Participant::new("mallory-1", "mallory"));

    mallory
        .send(OutboundSignal::SdpAnswer {
            description: SessionDescription::answer("v=0\r\n"),
            target_id: alice.id().clone(),
        })
        .await
        .unwrap();
    mallory
        .send(OutboundSignal::CallReject {
            peer_id: alice.id().clone(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(alice.snapshot().await, CallSnapshot::Idle);
    alice.service.start_group_call().await.unwrap();
}

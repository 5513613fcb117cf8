//! Call signaling protocol
//!
//! Message contract carried by the room's signaling relay. Outbound messages
//! name their addressee (display name, session id, or the relay itself);
//! the relay delivers them as inbound messages that name the sender instead.
//! The relay never interprets payloads.

use crate::identity::SessionId;
use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Maximum SDP length accepted from the relay
const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate length accepted from the relay
const MAX_CANDIDATE_LENGTH: usize = 4 * 1024;

/// Maximum session id / display name length
const MAX_ID_LENGTH: usize = 256;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Relay could not resolve the addressee
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Connection to the relay is gone
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// Malformed or oversized message
    #[error("Invalid signaling message: {0}")]
    Invalid(String),
}

/// Addressee of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// User by display name
    Name(&'a str),
    /// Client by session id
    Peer(&'a SessionId),
    /// The relay itself (fan-out or roster bookkeeping)
    Relay,
}

/// Client-originated message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundSignal {
    /// Request a private call
    CallRequest {
        /// Callee display name
        target_name: String,
    },
    /// Accept an incoming call
    CallAccept {
        /// Caller session id
        peer_id: SessionId,
    },
    /// Decline an incoming call
    CallReject {
        /// Caller session id
        peer_id: SessionId,
    },
    /// Terminate the call with a peer
    CallEnded {
        /// Peer session id
        peer_id: SessionId,
    },
    /// Announce a group call to the room
    GroupCallStart,
    /// Join an announced group call
    GroupCallJoin {
        /// Initiator session id
        initiator_id: SessionId,
    },
    /// Leave a group call roster
    GroupCallLeave {
        /// Initiator session id
        initiator_id: SessionId,
    },
    /// Offer description
    SdpOffer {
        /// The offer
        description: SessionDescription,
        /// Answerer session id
        target_id: SessionId,
    },
    /// Answer description
    SdpAnswer {
        /// The answer
        description: SessionDescription,
        /// Offerer session id
        target_id: SessionId,
    },
    /// Local ICE candidate
    IceCandidate {
        /// The candidate
        candidate: IceCandidate,
        /// Remote peer session id
        target_id: SessionId,
    },
}

impl OutboundSignal {
    /// Who the relay must deliver this message to
    #[must_use]
    pub fn target(&self) -> Target<'_> {
        match self {
            Self::CallRequest { target_name } => Target::Name(target_name),
            Self::CallAccept { peer_id }
            | Self::CallReject { peer_id }
            | Self::CallEnded { peer_id } => Target::Peer(peer_id),
            Self::GroupCallStart | Self::GroupCallLeave { .. } => Target::Relay,
            Self::GroupCallJoin { initiator_id } => Target::Peer(initiator_id),
            Self::SdpOffer { target_id, .. }
            | Self::SdpAnswer { target_id, .. }
            | Self::IceCandidate { target_id, .. } => Target::Peer(target_id),
        }
    }

    /// Message type name for tracing
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => "call-request",
            Self::CallAccept { .. } => "call-accept",
            Self::CallReject { .. } => "call-reject",
            Self::CallEnded { .. } => "call-ended",
            Self::GroupCallStart => "group-call-start",
            Self::GroupCallJoin { .. } => "group-call-join",
            Self::GroupCallLeave { .. } => "group-call-leave",
            Self::SdpOffer { .. } => "sdp-offer",
            Self::SdpAnswer { .. } => "sdp-answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Relay-delivered message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InboundSignal {
    /// Someone requested a private call with us
    IncomingCall {
        /// Caller session id
        caller_id: SessionId,
        /// Caller display name
        caller_name: String,
    },
    /// Callee accepted
    CallAccept {
        /// Accepter session id
        peer_id: SessionId,
        /// Accepter display name
        name: String,
    },
    /// Callee declined
    CallReject {
        /// Decliner session id
        peer_id: SessionId,
        /// Decliner display name
        name: String,
    },
    /// Peer hung up
    CallEnded {
        /// Peer session id
        peer_id: SessionId,
    },
    /// A group call was announced
    GroupCallAvailable {
        /// Initiator session id
        initiator_id: SessionId,
        /// Initiator display name
        initiator_name: String,
    },
    /// A member joined the group call we are in
    ParticipantJoined {
        /// Joiner session id
        peer_id: SessionId,
        /// Joiner display name
        name: String,
    },
    /// Offer from a peer
    SdpOffer {
        /// The offer
        description: SessionDescription,
        /// Offerer session id
        sender_id: SessionId,
    },
    /// Answer from a peer
    SdpAnswer {
        /// The answer
        description: SessionDescription,
        /// Answerer session id
        sender_id: SessionId,
    },
    /// Remote ICE candidate
    IceCandidate {
        /// The candidate
        candidate: IceCandidate,
        /// Sender session id
        sender_id: SessionId,
    },
    /// Relay could not deliver one of our messages
    PeerUnreachable {
        /// Name or session id that could not be resolved
        target: String,
    },
}

impl InboundSignal {
    /// Message type name for tracing
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallAccept { .. } => "call-accept",
            Self::CallReject { .. } => "call-reject",
            Self::CallEnded { .. } => "call-ended",
            Self::GroupCallAvailable { .. } => "group-call-available",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::SdpOffer { .. } => "sdp-offer",
            Self::SdpAnswer { .. } => "sdp-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::PeerUnreachable { .. } => "peer-unreachable",
        }
    }

    /// Session id of the client this message concerns, if any
    #[must_use]
    pub fn peer(&self) -> Option<&SessionId> {
        match self {
            Self::IncomingCall { caller_id, .. } => Some(caller_id),
            Self::CallAccept { peer_id, .. }
            | Self::CallReject { peer_id, .. }
            | Self::CallEnded { peer_id }
            | Self::ParticipantJoined { peer_id, .. } => Some(peer_id),
            Self::GroupCallAvailable { initiator_id, .. } => Some(initiator_id),
            Self::SdpOffer { sender_id, .. }
            | Self::SdpAnswer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. } => Some(sender_id),
            Self::PeerUnreachable { .. } => None,
        }
    }

    /// Reject empty identifiers and oversized payloads
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Invalid` describing the offending field
    pub fn validate(&self) -> Result<(), SignalingError> {
        if let Some(peer) = self.peer() {
            check_id("session id", peer.as_str())?;
        }
        match self {
            Self::IncomingCall { caller_name, .. } => check_id("caller name", caller_name),
            Self::GroupCallAvailable { initiator_name, .. } => {
                check_id("initiator name", initiator_name)
            }
            Self::ParticipantJoined { name, .. }
            | Self::CallAccept { name, .. }
            | Self::CallReject { name, .. } => check_id("participant name", name),
            Self::SdpOffer { description, .. } | Self::SdpAnswer { description, .. } => {
                if description.sdp.trim().is_empty() {
                    return Err(SignalingError::Invalid("empty SDP".to_string()));
                }
                if description.sdp.len() > MAX_SDP_LENGTH {
                    return Err(SignalingError::Invalid(format!(
                        "SDP too large: {} bytes (max {})",
                        description.sdp.len(),
                        MAX_SDP_LENGTH
                    )));
                }
                Ok(())
            }
            Self::IceCandidate { candidate, .. } => {
                if candidate.candidate.len() > MAX_CANDIDATE_LENGTH {
                    return Err(SignalingError::Invalid(format!(
                        "candidate too large: {} bytes (max {})",
                        candidate.candidate.len(),
                        MAX_CANDIDATE_LENGTH
                    )));
                }
                Ok(())
            }
            Self::PeerUnreachable { target } => check_id("target", target),
            Self::CallEnded { .. } => Ok(()),
        }
    }
}

fn check_id(field: &str, value: &str) -> Result<(), SignalingError> {
    if value.is_empty() {
        return Err(SignalingError::Invalid(format!("{field} is empty")));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(SignalingError::Invalid(format!(
            "{field} too long: {} bytes (max {MAX_ID_LENGTH})",
            value.len()
        )));
    }
    Ok(())
}

/// Signaling channel trait
///
/// Implement this for the room's message relay (websocket, socket.io bridge,
/// in-process relay). Inbound messages are fed to the engine separately; the
/// channel only needs to deliver outbound messages in order per addressee.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Hand a message to the relay
    ///
    /// # Errors
    ///
    /// Returns `PeerUnreachable` if the relay knows synchronously that the
    /// addressee is absent, `ChannelClosed` if the relay connection is gone
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError>;
}

/// Outbound signaling with tracing and a sent-message counter
#[derive(Clone)]
pub struct SignalingHandler {
    channel: Arc<dyn SignalingChannel>,
    sent: Arc<AtomicU64>,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            channel,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if the channel rejects the message
    #[tracing::instrument(skip(self, signal), fields(message_type = signal.message_type()))]
    pub async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        tracing::trace!(addressee = ?signal.target(), "Sending signaling message");
        match self.channel.send(signal).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Signaling send failed");
                Err(e)
            }
        }
    }

    /// Number of messages handed to the channel
    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct MockChannel {
        sent: Mutex<Vec<OutboundSignal>>,
        fail: bool,
    }

    #[async_trait]
    impl SignalingChannel for MockChannel {
        async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
            if self.fail {
                return Err(SignalingError::ChannelClosed);
            }
            self.sent.lock().unwrap().push(signal);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_counts_successful_sends() {
        let channel = Arc::new(MockChannel {
            sent: Mutex::new(Vec::new()),
            fail: false,
        });
        let handler = SignalingHandler::new(channel.clone());

        handler
            .send(OutboundSignal::CallRequest {
                target_name: "bob".to_string(),
            })
            .await
            .unwrap();
        handler.send(OutboundSignal::GroupCallStart).await.unwrap();

        assert_eq!(handler.sent_count(), 2);
        assert_eq!(channel.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_handler_does_not_count_failures() {
        let handler = SignalingHandler::new(Arc::new(MockChannel {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }));
        let res = handler.send(OutboundSignal::GroupCallStart).await;
        assert_eq!(res, Err(SignalingError::ChannelClosed));
        assert_eq!(handler.sent_count(), 0);
    }

    #[test]
    fn test_outbound_wire_format() {
        let msg = OutboundSignal::SdpOffer {
            description: SessionDescription::offer("v=0"),
            target_id: SessionId::new("sock-2"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sdp-offer");
        assert_eq!(json["targetId"], "sock-2");
        assert_eq!(json["description"]["type"], "offer");

        let start = serde_json::to_value(&OutboundSignal::GroupCallStart).unwrap();
        assert_eq!(start, serde_json::json!({"type": "group-call-start"}));

        let request = serde_json::to_value(&OutboundSignal::CallRequest {
            target_name: "bob".to_string(),
        })
        .unwrap();
        assert_eq!(
            request,
            serde_json::json!({"type": "call-request", "targetName": "bob"})
        );
    }

    #[test]
    fn test_inbound_parses_relay_json() {
        let json = r#"{"type":"incoming-call","callerId":"sock-1","callerName":"alice"}"#;
        let msg: InboundSignal = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            InboundSignal::IncomingCall {
                caller_id: SessionId::new("sock-1"),
                caller_name: "alice".to_string(),
            }
        );
        assert_eq!(msg.message_type(), "incoming-call");
        assert_eq!(msg.peer(), Some(&SessionId::new("sock-1")));
    }

    #[test]
    fn test_inbound_accept_carries_name() {
        let json = r#"{"type":"call-accept","peerId":"sock-2","name":"bob"}"#;
        let msg: InboundSignal = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            InboundSignal::CallAccept {
                peer_id: SessionId::new("sock-2"),
                name: "bob".to_string(),
            }
        );
        let nameless = InboundSignal::CallReject {
            peer_id: SessionId::new("sock-2"),
            name: String::new(),
        };
        assert!(nameless.validate().is_err());
    }

    #[test]
    fn test_targets() {
        let by_name = OutboundSignal::CallRequest {
            target_name: "bob".to_string(),
        };
        assert_eq!(by_name.target(), Target::Name("bob"));

        let id = SessionId::new("sock-7");
        let join = OutboundSignal::GroupCallJoin {
            initiator_id: id.clone(),
        };
        assert_eq!(join.target(), Target::Peer(&id));
        assert_eq!(OutboundSignal::GroupCallStart.target(), Target::Relay);
    }

    #[test]
    fn test_validate_rejects_oversized_sdp() {
        let msg = InboundSignal::SdpOffer {
            description: SessionDescription::offer("a".repeat(MAX_SDP_LENGTH + 1)),
            sender_id: SessionId::new("sock-1"),
        };
        assert!(matches!(msg.validate(), Err(SignalingError::Invalid(ref m)) if m.contains("too large")));
    }

    #[test]
    fn test_validate_rejects_empty_sdp_and_ids() {
        let empty_sdp = InboundSignal::SdpAnswer {
            description: SessionDescription::answer("  "),
            sender_id: SessionId::new("sock-1"),
        };
        assert!(empty_sdp.validate().is_err());

        let empty_id = InboundSignal::CallEnded {
            peer_id: SessionId::new(""),
        };
        assert!(empty_id.validate().is_err());

        let long_name = InboundSignal::ParticipantJoined {
            peer_id: SessionId::new("sock-1"),
            name: "x".repeat(MAX_ID_LENGTH + 1),
        };
        assert!(long_name.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_normal_candidate() {
        let msg = InboundSignal::IceCandidate {
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
            sender_id: SessionId::new("sock-1"),
        };
        assert!(msg.validate().is_ok());
    }
}

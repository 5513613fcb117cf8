//! Call types and data structures

use crate::identity::{Participant, SessionId};
use crate::media::RemoteTrack;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call, used to correlate events and timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Whether a call involves one remote peer or the whole room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMode {
    /// One-to-one call addressed by display name
    Private,
    /// Mesh call announced to the whole room
    Group,
}

/// Which side created the call intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Local user initiated
    Outgoing,
    /// Remote user initiated
    Incoming,
}

/// Call intent, fixed when a call is initiated or received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallIntent {
    /// Private or group
    pub mode: CallMode,
    /// Outgoing or incoming
    pub direction: CallDirection,
}

impl CallIntent {
    /// Outgoing private call
    pub fn outgoing_private() -> Self {
        Self {
            mode: CallMode::Private,
            direction: CallDirection::Outgoing,
        }
    }

    /// Incoming private call
    pub fn incoming_private() -> Self {
        Self {
            mode: CallMode::Private,
            direction: CallDirection::Incoming,
        }
    }
}

/// Private call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call in progress
    Idle,
    /// Call request sent, waiting for the callee
    Requesting,
    /// Incoming request, waiting for the local user
    Ringing,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Media transport established
    Active,
    /// Call finished normally
    Ended,
    /// Callee declined
    Rejected,
    /// Media, negotiation or transport failure
    Failed,
}

impl CallState {
    /// Whether the call has reached a terminal state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Failed)
    }
}

/// Group call coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCallState {
    /// Not part of a group call
    Idle,
    /// Acquiring media and broadcasting the announcement
    Announcing,
    /// Invitation received, waiting for the local user to join or decline
    AwaitingDecision,
    /// In the call, possibly still waiting for participants
    Active,
}

/// Negotiation role of a transport session, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportRole {
    /// Produces the offer
    Offerer,
    /// Answers the remote offer
    Answerer,
}

/// Transport session state
///
/// ```text
/// New ──► Negotiating ──► Connected ──► Disconnected ──► Connected
///  │           │              │               │
///  │           ▼              ▼               ▼
///  └──────► Failed ─────────► Ended ◄─────────┘
///
/// any live state ── close() ──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Created, local tracks attached
    New,
    /// Descriptions being exchanged
    Negotiating,
    /// Media path established
    Connected,
    /// Path lost, may recover
    Disconnected,
    /// Timed out or failed; waiting for cleanup
    Failed,
    /// Closed while live
    Closed,
    /// Closed after failure or disconnection
    Ended,
}

impl TransportState {
    /// Whether the session no longer participates in the call
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Ended)
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer from the offerer
    Offer,
    /// Answer from the answerer
    Answer,
}

/// Session description, serialized like a browser `RTCSessionDescriptionInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, serialized like a browser `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media id
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media line information
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// User-visible call status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// Waiting for the callee
    Calling {
        /// Callee display name
        name: String,
    },
    /// Transport negotiating
    Connecting,
    /// Path discovery running
    EstablishingConnection,
    /// Media flowing
    Connected,
    /// Connected path lost, waiting for recovery
    Reconnecting,
    /// Group call active with no peers yet
    WaitingForParticipants,
    /// Group call connection summary
    GroupConnected {
        /// Transports in `Connected` state
        connected: usize,
        /// Known participants
        participants: usize,
    },
    /// Callee declined
    Rejected,
    /// Call ended
    Ended,
    /// Call failed
    Failed,
    /// Callee not present in the room
    Unavailable {
        /// Name or id that could not be reached
        name: String,
    },
    /// Status line reset after the grace delay
    Cleared,
}

impl CallStatus {
    /// Short class name for styling the status line
    #[must_use]
    pub fn class(&self) -> &'static str {
        match self {
            Self::Calling { .. } => "calling",
            Self::Connecting | Self::EstablishingConnection | Self::Reconnecting => "connecting",
            Self::Connected | Self::GroupConnected { .. } => "connected",
            Self::WaitingForParticipants => "waiting",
            Self::Rejected => "rejected",
            Self::Ended | Self::Unavailable { .. } => "ended",
            Self::Failed => "failed",
            Self::Cleared => "",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calling { name } => write!(f, "Calling {name}..."),
            Self::Connecting => write!(f, "Connecting..."),
            Self::EstablishingConnection => write!(f, "Establishing connection..."),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting..."),
            Self::WaitingForParticipants => write!(f, "Waiting for participants..."),
            Self::GroupConnected {
                connected,
                participants,
            } => write!(f, "Connected to {connected} of {participants}"),
            Self::Rejected => write!(f, "Call rejected"),
            Self::Ended => write!(f, "Call ended"),
            Self::Failed => write!(f, "Connection failed"),
            Self::Unavailable { name } => write!(f, "{name} is unavailable"),
            Self::Cleared => Ok(()),
        }
    }
}

/// Why a call or peer session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up or left
    LocalHangup,
    /// Remote side hung up
    RemoteHangup,
    /// Remote side declined
    Rejected,
    /// Relay could not deliver to the peer
    PeerUnreachable,
    /// Transport or negotiation failure
    Failed(String),
}

/// Notifications for the surrounding UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// Incoming private call waiting for accept/reject
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Caller
        caller: Participant,
    },
    /// Someone started a group call in the room
    GroupCallAvailable {
        /// Group call initiator
        initiator: Participant,
    },
    /// Status line changed
    Status(CallStatus),
    /// Private call state changed
    CallStateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        old: CallState,
        /// New state
        new: CallState,
    },
    /// Group coordinator state changed
    GroupStateChanged {
        /// Previous state
        old: GroupCallState,
        /// New state
        new: GroupCallState,
    },
    /// Transport to a peer changed state
    TransportStateChanged {
        /// Remote peer
        peer: SessionId,
        /// New state
        state: TransportState,
    },
    /// Participant added to the group call
    ParticipantJoined {
        /// The participant
        participant: Participant,
    },
    /// Participant removed from the group call
    ParticipantLeft {
        /// The participant's session id
        peer: SessionId,
        /// Why
        reason: EndReason,
    },
    /// Group connection count changed
    GroupConnections {
        /// Transports in `Connected` state
        connected: usize,
        /// Known participants
        participants: usize,
    },
    /// Inbound track ready for playback
    RemoteTrackAdded {
        /// Sending peer
        peer: SessionId,
        /// The track
        track: RemoteTrack,
    },
    /// Inbound tracks from a peer must be detached from playback
    RemoteMediaReleased {
        /// Peer whose tracks were released
        peer: SessionId,
    },
    /// Local audio muted or unmuted
    MuteChanged {
        /// New mute state
        muted: bool,
    },
    /// Private call finished
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
        /// Seconds spent in `Active`, if it got there
        duration_secs: Option<i64>,
    },
}

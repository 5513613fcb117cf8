//! Roomcall - call signaling and peer sessions for chat-room audio/video calls
//!
//! This library drives one-to-one and full-mesh group calls between members
//! of a chat room. Call-control messages travel over a relay that only knows
//! session ids; media flows over per-peer transports negotiated by
//! offer/answer and path-candidate exchange. It features:
//!
//! - **Private calls**: request, ring, accept/reject, hang-up
//! - **Group calls**: room-wide announcement and a full mesh of transports
//! - **Liveness timers**: connection and path-discovery timeouts per transport
//! - **Mode exclusivity**: at most one call of either kind per client
//! - **Pluggable media**: capture devices and transports behind traits, with
//!   an in-process loopback and an optional `webrtc` crate backend
//!
//! # Examples
//!
//! ```rust,no_run
//! use roomcall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = LocalRelay::new();
//! let network = LoopbackNetwork::new();
//! let alice = Participant::new("s-alice", "alice");
//! let (endpoint, inbound) = relay.connect(alice.clone());
//!
//! let service = CallService::builder(alice.clone())
//!     .with_signaling(Arc::new(endpoint), inbound)
//!     .with_devices(Arc::new(LoopbackDevices::new()))
//!     .with_engine(Arc::new(network.engine(alice.id.clone())))
//!     .build()?;
//!
//! let mut events = service.subscribe_events();
//! service.start_private_call("bob").await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and events
pub mod types;

/// Room participant identity
pub mod identity;

/// Call and media configuration
pub mod config;

/// Local capture and remote tracks
pub mod media;

/// Call-control message contract and relay channel
pub mod signaling;

/// Per-peer transport sessions
pub mod transport;

/// Private call state machine
pub mod call;

/// Group call mesh coordination
pub mod group;

/// Mode exclusivity and message routing
pub mod controller;

/// Service task owning the controller
pub mod service;

/// In-process signaling relay
pub mod relay;

/// In-process media transport and capture
pub mod loopback;

/// Media engine backed by the `webrtc` crate
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

pub use call::{CallError, CallSession};
pub use config::{CallConfig, IceServer, MediaConstraints};
pub use controller::{CallContext, CallController, CallSnapshot, TransportSnapshot};
pub use group::GroupCallCoordinator;
pub use identity::{Participant, SessionId};
pub use loopback::{LoopbackDevices, LoopbackEngine, LoopbackNetwork};
pub use media::{LocalMedia, LocalTrack, MediaDevices, MediaError, RemoteTrack};
pub use relay::{LocalRelay, RecordingChannel, RelayEndpoint};
#[cfg(feature = "webrtc-backend")]
pub use rtc::RtcEngine;
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use signaling::{
    InboundSignal, OutboundSignal, SignalingChannel, SignalingError, SignalingHandler,
};
pub use transport::{
    MediaEngine, PeerLink, TransportError, TransportId, TransportSession, TransportUpdate,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::CallError;
    pub use crate::config::CallConfig;
    pub use crate::controller::CallSnapshot;
    pub use crate::identity::{Participant, SessionId};
    pub use crate::loopback::{LoopbackDevices, LoopbackNetwork};
    pub use crate::relay::LocalRelay;
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{InboundSignal, OutboundSignal, SignalingChannel};
    pub use crate::types::{
        CallEvent, CallId, CallMode, CallState, CallStatus, EndReason, GroupCallState,
        MediaKind,
    };
}

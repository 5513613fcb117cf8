//! Transport sessions
//!
//! A [`TransportSession`] drives one offer/answer negotiation with exactly one
//! remote peer over a [`PeerLink`], the media transport primitive supplied by
//! a [`MediaEngine`]. The session never talks to the signaling relay itself:
//! it returns descriptions and surfaces local candidates as
//! [`TransportUpdate`]s, and its owner forwards them.
//!
//! Asynchronous notifications (link callbacks, timer expiry) are posted to
//! the engine queue as [`EngineEvent`]s and fed back to the owning session on
//! the engine's single task, so session state is only ever touched from one
//! place.

use crate::config::{CallConfig, IceServer};
use crate::identity::SessionId;
use crate::media::{LocalMedia, LocalTrack, RemoteTrack};
use crate::types::{CallId, IceCandidate, SdpKind, SessionDescription, TransportRole, TransportState};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Description or candidate applied out of sequence
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Underlying media transport failure
    #[error("Link error: {0}")]
    Link(String),

    /// Session already closed
    #[error("Transport closed")]
    Closed,

    /// Liveness timer fired
    #[error("Transport timeout: {0:?}")]
    Timeout(TimerKind),
}

/// Unique identifier of one transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(pub Uuid);

impl TransportId {
    /// Create a new random transport ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state reported by the media transport primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Connectivity checks running
    Connecting,
    /// Media path established
    Connected,
    /// Path temporarily lost
    Disconnected,
    /// Path permanently lost
    Failed,
    /// Closed underneath us
    Closed,
}

/// Callback from the media transport primitive
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Local candidate discovered; must be forwarded to the peer
    LocalCandidate(IceCandidate),
    /// Path discovery finished
    GatheringComplete,
    /// Connection state changed
    StateChanged(LinkState),
    /// Remote track arrived
    RemoteTrack(RemoteTrack),
}

/// Liveness timers guarding a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Connection establishment
    Connect,
    /// Path discovery
    IceGathering,
    /// Recovery after disconnection
    Disconnected,
}

/// Event delivered to the engine's single task
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Media transport callback
    Link {
        /// Transport the callback belongs to
        transport: TransportId,
        /// Remote peer of that transport
        peer: SessionId,
        /// The callback
        event: LinkEvent,
    },
    /// Transport timer fired
    Timer {
        /// Transport the timer belongs to
        transport: TransportId,
        /// Remote peer of that transport
        peer: SessionId,
        /// Which timer
        kind: TimerKind,
        /// Arm sequence number, to detect stale firings
        seq: u64,
    },
    /// Grace delay after a private call reached a terminal state
    CallGrace {
        /// The finished call
        call_id: CallId,
    },
    /// Grace delay after a group peer failed
    PeerGrace {
        /// The failed transport
        transport: TransportId,
        /// Its peer
        peer: SessionId,
    },
    /// Grace delay after the group call was left
    GroupGrace {
        /// Group epoch that finished
        epoch: u64,
    },
}

/// Sender half of the engine queue
pub type EngineSender = mpsc::UnboundedSender<EngineEvent>;

/// Where a media engine posts callbacks for one link
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    transport: TransportId,
    peer: SessionId,
    tx: EngineSender,
}

impl LinkEventSink {
    /// Create a sink tagging events with the given transport and peer
    pub fn new(transport: TransportId, peer: SessionId, tx: EngineSender) -> Self {
        Self {
            transport,
            peer,
            tx,
        }
    }

    /// Transport this sink belongs to
    pub fn transport(&self) -> TransportId {
        self.transport
    }

    /// Remote peer of the transport
    pub fn peer(&self) -> &SessionId {
        &self.peer
    }

    /// Post a callback; returns `false` if the engine is gone
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(EngineEvent::Link {
                transport: self.transport,
                peer: self.peer.clone(),
                event,
            })
            .is_ok()
    }
}

/// Media transport primitive for one remote peer
///
/// Mirrors the browser `RTCPeerConnection` surface the engine relies on.
/// Callbacks (candidates, state changes, remote tracks) go to the
/// [`LinkEventSink`] the link was created with.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track
    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), TransportError>;

    /// Produce an offer
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply our own description; starts path discovery
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Apply the peer's description
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Tear down the link
    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for [`PeerLink`]s
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a link that discovers paths through `ice_servers` and reports
    /// to `events`
    async fn create_link(
        &self,
        ice_servers: &[IceServer],
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, TransportError>;
}

/// What the owner must act on after feeding an event to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUpdate {
    /// Forward this candidate to the peer
    LocalCandidate(IceCandidate),
    /// Session changed state
    StateChanged {
        /// Previous state
        old: TransportState,
        /// New state
        new: TransportState,
    },
    /// Attach this track to playback
    RemoteTrack(RemoteTrack),
}

/// Result of offering a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Handed to the link
    Applied,
    /// Discarded (no remote description yet, or session closed)
    Dropped,
}

/// Armed timer; aborted when dropped
#[derive(Debug)]
struct Timer {
    seq: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    fn start(after: Duration, tx: EngineSender, event: EngineEvent, seq: u64) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        });
        Self { seq, handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    connect: Duration,
    ice_gathering: Duration,
    disconnected: Duration,
}

/// One negotiation with one remote peer
pub struct TransportSession {
    id: TransportId,
    peer_id: SessionId,
    role: TransportRole,
    state: TransportState,
    link: Box<dyn PeerLink>,
    local_media: Option<LocalMedia>,
    local_description_set: bool,
    remote_description_set: bool,
    remote_tracks: Vec<RemoteTrack>,
    dropped_candidates: usize,
    connect_timer: Option<Timer>,
    ice_timer: Option<Timer>,
    disconnect_timer: Option<Timer>,
    timer_seq: u64,
    timeouts: Timeouts,
    engine_tx: EngineSender,
    last_error: Option<TransportError>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote_tracks", &self.remote_tracks.len())
            .finish()
    }
}

impl TransportSession {
    /// Create a session in `New` state
    ///
    /// # Errors
    ///
    /// Returns error if the media engine cannot create a link
    pub async fn create(
        engine: &dyn MediaEngine,
        peer_id: SessionId,
        role: TransportRole,
        config: &CallConfig,
        engine_tx: EngineSender,
    ) -> Result<Self, TransportError> {
        let id = TransportId::new();
        let sink = LinkEventSink::new(id, peer_id.clone(), engine_tx.clone());
        let link = engine.create_link(&config.ice_servers, sink).await?;

        tracing::debug!(transport = %id, peer = %peer_id, role = ?role, "Transport session created");

        Ok(Self {
            id,
            peer_id,
            role,
            state: TransportState::New,
            link,
            local_media: None,
            local_description_set: false,
            remote_description_set: false,
            remote_tracks: Vec::new(),
            dropped_candidates: 0,
            connect_timer: None,
            ice_timer: None,
            disconnect_timer: None,
            timer_seq: 0,
            timeouts: Timeouts {
                connect: config.connect_timeout(),
                ice_gathering: config.ice_gathering_timeout(),
                disconnected: config.disconnected_timeout(),
            },
            engine_tx,
            last_error: None,
        })
    }

    /// Transport identifier
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Remote peer
    pub fn peer_id(&self) -> &SessionId {
        &self.peer_id
    }

    /// Negotiation role
    pub fn role(&self) -> TransportRole {
        self.role
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Whether media is flowing
    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    /// Whether the peer's description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Tracks received from the peer
    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    /// Candidates discarded by the drop policy
    pub fn dropped_candidates(&self) -> usize {
        self.dropped_candidates
    }

    /// Error that moved the session to `Failed`
    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// Attach local tracks and arm the liveness timers
    ///
    /// Both the connect and the path-discovery timer start here, when the
    /// session is opened, not when the local description is applied; an
    /// answerer whose offer never arrives still times out.
    ///
    /// # Errors
    ///
    /// Returns error if the session was already opened, the media was
    /// stopped, or the link rejects a track
    pub async fn open(&mut self, local_media: &LocalMedia) -> Result<(), TransportError> {
        if self.state != TransportState::New || self.local_media.is_some() {
            return Err(TransportError::Negotiation(format!(
                "open in state {:?}",
                self.state
            )));
        }
        if local_media.is_stopped() {
            return Err(TransportError::Link("local media stopped".to_string()));
        }

        for track in local_media.tracks() {
            self.link.add_track(track, &local_media.stream_id).await?;
        }
        self.local_media = Some(local_media.clone());

        self.connect_timer = Some(self.arm(TimerKind::Connect, self.timeouts.connect));
        self.ice_timer = Some(self.arm(TimerKind::IceGathering, self.timeouts.ice_gathering));

        tracing::debug!(
            transport = %self.id,
            peer = %self.peer_id,
            tracks = local_media.tracks().len(),
            "Transport session opened"
        );
        Ok(())
    }

    /// Produce the offer; the caller forwards it to the peer
    ///
    /// # Errors
    ///
    /// Returns `Negotiation` if this session is not a fresh offerer
    #[tracing::instrument(skip(self), fields(peer = %self.peer_id))]
    pub async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        self.ensure_live()?;
        if self.role != TransportRole::Offerer || self.local_description_set {
            return self.negotiation_failure(format!(
                "cannot create offer as {:?} in state {:?}",
                self.role, self.state
            ));
        }

        let offer = self.link.create_offer().await?;
        self.link.set_local_description(offer.clone()).await?;
        self.local_description_set = true;
        self.transition(TransportState::Negotiating);

        tracing::debug!(sdp_len = offer.sdp.len(), "SDP offer created");
        Ok(offer)
    }

    /// Apply the remote offer and produce the answer; the caller forwards it
    ///
    /// # Errors
    ///
    /// Returns `Negotiation` if this session is not a fresh answerer or the
    /// description is not an offer
    #[tracing::instrument(skip(self, remote_offer), fields(peer = %self.peer_id))]
    pub async fn create_answer(
        &mut self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        if remote_offer.kind != SdpKind::Offer {
            return self.negotiation_failure("expected an offer".to_string());
        }
        self.apply_remote_description(remote_offer).await?;

        let answer = self.link.create_answer().await?;
        self.link.set_local_description(answer.clone()).await?;
        self.local_description_set = true;

        tracing::debug!(sdp_len = answer.sdp.len(), "SDP answer created");
        Ok(answer)
    }

    /// Apply the peer's description
    ///
    /// An answer is only valid on an offerer whose offer went out; an offer is
    /// only valid on an answerer that has not seen one yet. Anything else moves
    /// the session to `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `Negotiation` when the description arrives out of order
    pub async fn apply_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_live()?;

        let in_order = match desc.kind {
            SdpKind::Offer => self.role == TransportRole::Answerer && !self.remote_description_set,
            SdpKind::Answer => {
                self.role == TransportRole::Offerer
                    && self.local_description_set
                    && !self.remote_description_set
            }
        };
        if !in_order {
            return self.negotiation_failure(format!(
                "{:?} received out of order (role {:?}, offer sent: {}, remote applied: {})",
                desc.kind, self.role, self.local_description_set, self.remote_description_set
            ));
        }

        if let Err(e) = self.link.set_remote_description(desc).await {
            return self.negotiation_failure(e.to_string());
        }
        self.remote_description_set = true;
        if self.state == TransportState::New {
            self.transition(TransportState::Negotiating);
        }
        Ok(())
    }

    /// Offer a remote candidate to the link
    ///
    /// Candidates that arrive before the remote description are dropped with
    /// a warning; the peer keeps gathering and the link only needs one
    /// working pair.
    ///
    /// # Errors
    ///
    /// Returns error if the link rejects the candidate
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, TransportError> {
        if self.state.is_terminal() || self.state == TransportState::Failed {
            tracing::debug!(peer = %self.peer_id, state = ?self.state, "Ignoring candidate for finished transport");
            return Ok(CandidateOutcome::Dropped);
        }
        if !self.remote_description_set {
            self.dropped_candidates += 1;
            tracing::warn!(
                peer = %self.peer_id,
                dropped = self.dropped_candidates,
                "Dropping ICE candidate received before remote description"
            );
            return Ok(CandidateOutcome::Dropped);
        }

        self.link.add_ice_candidate(candidate).await?;
        tracing::trace!(peer = %self.peer_id, "Remote ICE candidate applied");
        Ok(CandidateOutcome::Applied)
    }

    /// Feed a link callback
    pub fn handle_link_event(&mut self, event: LinkEvent) -> Option<TransportUpdate> {
        if self.state.is_terminal() {
            tracing::trace!(peer = %self.peer_id, ?event, "Link event after close ignored");
            return None;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if self.state == TransportState::Failed {
                    return None;
                }
                Some(TransportUpdate::LocalCandidate(candidate))
            }
            LinkEvent::GatheringComplete => {
                if self.ice_timer.take().is_some() {
                    tracing::debug!(peer = %self.peer_id, "Path discovery complete");
                }
                None
            }
            LinkEvent::RemoteTrack(track) => {
                if self.state == TransportState::Failed {
                    return None;
                }
                tracing::debug!(peer = %self.peer_id, track_id = %track.id, kind = ?track.kind, "Remote track received");
                self.remote_tracks.push(track.clone());
                Some(TransportUpdate::RemoteTrack(track))
            }
            LinkEvent::StateChanged(link_state) => self.handle_link_state(link_state),
        }
    }

    fn handle_link_state(&mut self, link_state: LinkState) -> Option<TransportUpdate> {
        let old = self.state;
        match (old, link_state) {
            (TransportState::Failed, _) => None,
            (_, LinkState::Connecting) => None,
            (
                TransportState::New | TransportState::Negotiating | TransportState::Disconnected,
                LinkState::Connected,
            ) => {
                self.connect_timer = None;
                self.ice_timer = None;
                self.disconnect_timer = None;
                self.transition(TransportState::Connected);
                tracing::info!(peer = %self.peer_id, "Transport connected");
                Some(TransportUpdate::StateChanged {
                    old,
                    new: TransportState::Connected,
                })
            }
            (TransportState::Connected, LinkState::Disconnected) => {
                self.disconnect_timer =
                    Some(self.arm(TimerKind::Disconnected, self.timeouts.disconnected));
                self.transition(TransportState::Disconnected);
                Some(TransportUpdate::StateChanged {
                    old,
                    new: TransportState::Disconnected,
                })
            }
            (_, LinkState::Failed | LinkState::Closed) => {
                self.fail(TransportError::Link(format!("link reported {link_state:?}")));
                Some(TransportUpdate::StateChanged {
                    old,
                    new: TransportState::Failed,
                })
            }
            _ => None,
        }
    }

    /// Feed a timer expiry; stale or already-satisfied timers are ignored
    pub async fn handle_timer(&mut self, kind: TimerKind, seq: u64) -> Option<TransportUpdate> {
        let slot = match kind {
            TimerKind::Connect => &mut self.connect_timer,
            TimerKind::IceGathering => &mut self.ice_timer,
            TimerKind::Disconnected => &mut self.disconnect_timer,
        };
        if slot.as_ref().map(|t| t.seq) != Some(seq) {
            tracing::trace!(peer = %self.peer_id, ?kind, seq, "Stale timer ignored");
            return None;
        }
        *slot = None;

        let old = self.state;
        match (kind, old) {
            (TimerKind::Connect | TimerKind::IceGathering, TransportState::New)
            | (TimerKind::Connect | TimerKind::IceGathering, TransportState::Negotiating) => {
                tracing::warn!(peer = %self.peer_id, ?kind, "Transport timed out");
                self.fail(TransportError::Timeout(kind));
                Some(TransportUpdate::StateChanged {
                    old,
                    new: TransportState::Failed,
                })
            }
            (TimerKind::Disconnected, TransportState::Disconnected) => {
                tracing::warn!(peer = %self.peer_id, "Transport did not recover from disconnection");
                self.last_error = Some(TransportError::Timeout(kind));
                self.release().await;
                self.transition(TransportState::Ended);
                Some(TransportUpdate::StateChanged {
                    old,
                    new: TransportState::Ended,
                })
            }
            _ => None,
        }
    }

    /// Close the session; safe to call repeatedly
    ///
    /// Returns `true` if this call performed the close. A failed or
    /// disconnected session ends in `Ended`, a live one in `Closed`.
    pub async fn close(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.release().await;
        let terminal = match self.state {
            TransportState::Failed | TransportState::Disconnected => TransportState::Ended,
            _ => TransportState::Closed,
        };
        self.transition(terminal);
        true
    }

    async fn release(&mut self) {
        self.connect_timer = None;
        self.ice_timer = None;
        self.disconnect_timer = None;
        if let Err(e) = self.link.close().await {
            tracing::warn!(peer = %self.peer_id, error = %e, "Failed to close link");
        }
        self.remote_tracks.clear();
        self.local_media = None;
    }

    fn fail(&mut self, error: TransportError) {
        tracing::warn!(peer = %self.peer_id, error = %error, "Transport failed");
        self.connect_timer = None;
        self.ice_timer = None;
        self.disconnect_timer = None;
        self.last_error = Some(error);
        self.transition(TransportState::Failed);
    }

    fn negotiation_failure<T>(&mut self, reason: String) -> Result<T, TransportError> {
        let error = TransportError::Negotiation(reason);
        if !self.state.is_terminal() && self.state != TransportState::Failed {
            self.fail(error.clone());
        }
        Err(error)
    }

    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.state.is_terminal() || self.state == TransportState::Failed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) -> Timer {
        self.timer_seq += 1;
        let event = EngineEvent::Timer {
            transport: self.id,
            peer: self.peer_id.clone(),
            kind,
            seq: self.timer_seq,
        };
        Timer::start(after, self.engine_tx.clone(), event, self.timer_seq)
    }

    fn transition(&mut self, new_state: TransportState) {
        let old_state = self.state;
        if old_state != new_state {
            self.state = new_state;
            tracing::debug!(
                transport = %self.id,
                peer = %self.peer_id,
                old_state = ?old_state,
                new_state = ?new_state,
                "Transport state transition"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MediaConstraints;
    use crate::loopback::{LoopbackDevices, LoopbackNetwork};
    use crate::media::MediaDevices;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Side {
        session: TransportSession,
        rx: UnboundedReceiver<EngineEvent>,
        media: LocalMedia,
    }

    async fn side(
        network: &LoopbackNetwork,
        local: &str,
        remote: &str,
        role: TransportRole,
        constraints: MediaConstraints,
    ) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = network.engine(SessionId::new(local));
        let media = LoopbackDevices::new()
            .acquire(&constraints)
            .await
            .unwrap();
        let mut session = TransportSession::create(
            &engine,
            SessionId::new(remote),
            role,
            &CallConfig::default(),
            tx,
        )
        .await
        .unwrap();
        session.open(&media).await.unwrap();
        Side { session, rx, media }
    }

    /// Feed queued link events; returns forwarded candidates
    fn pump(side: &mut Side) -> Vec<IceCandidate> {
        let mut candidates = Vec::new();
        while let Ok(event) = side.rx.try_recv() {
            if let EngineEvent::Link { event, .. } = event {
                if let Some(TransportUpdate::LocalCandidate(c)) =
                    side.session.handle_link_event(event)
                {
                    candidates.push(c);
                }
            }
        }
        candidates
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides_with_peer_tracks() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::video_call()).await;
        let mut bob = side(&network, "b", "a", TransportRole::Answerer, MediaConstraints::audio_only()).await;

        let offer = alice.session.create_offer().await.unwrap();
        assert_eq!(alice.session.state(), TransportState::Negotiating);

        let answer = bob.session.create_answer(offer).await.unwrap();
        assert_eq!(bob.session.state(), TransportState::Negotiating);

        alice.session.apply_remote_description(answer).await.unwrap();

        for c in pump(&mut alice) {
            bob.session.add_remote_candidate(c).await.unwrap();
        }
        for c in pump(&mut bob) {
            alice.session.add_remote_candidate(c).await.unwrap();
        }
        pump(&mut alice);
        pump(&mut bob);

        assert_eq!(alice.session.state(), TransportState::Connected);
        assert_eq!(bob.session.state(), TransportState::Connected);

        let mut from_bob: Vec<_> = alice.session.remote_tracks().iter().map(|t| t.id.clone()).collect();
        let mut bob_tracks: Vec<_> = bob.media.tracks().iter().map(|t| t.id.clone()).collect();
        from_bob.sort();
        bob_tracks.sort();
        assert_eq!(from_bob, bob_tracks);

        let mut from_alice: Vec<_> = bob.session.remote_tracks().iter().map(|t| t.id.clone()).collect();
        let mut alice_tracks: Vec<_> = alice.media.tracks().iter().map(|t| t.id.clone()).collect();
        from_alice.sort();
        alice_tracks.sort();
        assert_eq!(from_alice, alice_tracks);
        assert_eq!(from_alice.len(), 2);
    }

    #[tokio::test]
    async fn test_answer_before_offer_is_negotiation_error() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::audio_only()).await;

        let res = alice
            .session
            .apply_remote_description(SessionDescription::answer("v=0"))
            .await;
        assert!(matches!(res, Err(TransportError::Negotiation(_))));
        assert_eq!(alice.session.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_offer_on_offerer_is_negotiation_error() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::audio_only()).await;
        let mut carol = side(&network, "c", "a", TransportRole::Offerer, MediaConstraints::audio_only()).await;

        let offer = carol.session.create_offer().await.unwrap();
        let res = alice.session.create_answer(offer).await;
        assert!(matches!(res, Err(TransportError::Negotiation(_))));
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_dropped() {
        let network = LoopbackNetwork::new();
        let mut bob = side(&network, "b", "a", TransportRole::Answerer, MediaConstraints::audio_only()).await;

        let outcome = bob
            .session
            .add_remote_candidate(IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host"))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Dropped);
        assert_eq!(bob.session.dropped_candidates(), 1);
        assert_eq!(bob.session.state(), TransportState::New);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fails_then_close_ends() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::audio_only()).await;
        alice.session.create_offer().await.unwrap();
        pump(&mut alice);

        tokio::time::sleep(Duration::from_secs(31)).await;

        let mut update = None;
        while let Ok(event) = alice.rx.try_recv() {
            if let EngineEvent::Timer { kind, seq, .. } = event {
                assert_eq!(kind, TimerKind::Connect);
                update = alice.session.handle_timer(kind, seq).await;
            }
        }
        assert_eq!(
            update,
            Some(TransportUpdate::StateChanged {
                old: TransportState::Negotiating,
                new: TransportState::Failed
            })
        );
        assert_eq!(
            alice.session.last_error(),
            Some(&TransportError::Timeout(TimerKind::Connect))
        );

        assert!(alice.session.close().await);
        assert_eq!(alice.session.state(), TransportState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ice_gathering_timeout_fails_when_discovery_stalls() {
        let network = LoopbackNetwork::new();
        network.stall_gathering(true);
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::audio_only()).await;
        alice.session.create_offer().await.unwrap();
        pump(&mut alice);

        tokio::time::sleep(Duration::from_secs(16)).await;

        let event = alice.rx.recv().await.unwrap();
        let EngineEvent::Timer { kind, seq, .. } = event else {
            unreachable!("expected timer event, got {event:?}");
        };
        assert_eq!(kind, TimerKind::IceGathering);
        alice.session.handle_timer(kind, seq).await;
        assert_eq!(alice.session.state(), TransportState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_timer_runs_from_open() {
        let network = LoopbackNetwork::new();
        let mut bob = side(&network, "b", "a", TransportRole::Answerer, MediaConstraints::audio_only()).await;

        tokio::time::sleep(Duration::from_secs(16)).await;

        let event = bob.rx.recv().await.unwrap();
        let EngineEvent::Timer { kind, seq, .. } = event else {
            unreachable!("expected timer event, got {event:?}");
        };
        assert_eq!(kind, TimerKind::IceGathering);
        assert_eq!(
            bob.session.handle_timer(kind, seq).await,
            Some(TransportUpdate::StateChanged {
                old: TransportState::New,
                new: TransportState::Failed,
            })
        );
        assert_eq!(
            bob.session.last_error(),
            Some(&TransportError::Timeout(TimerKind::IceGathering))
        );
    }

    #[tokio::test]
    async fn test_stale_timer_is_noop() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::audio_only()).await;

        assert_eq!(alice.session.handle_timer(TimerKind::Connect, 999).await, None);
        assert_eq!(alice.session.state(), TransportState::New);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::audio_only()).await;

        assert!(alice.session.close().await);
        assert_eq!(alice.session.state(), TransportState::Closed);
        assert!(!alice.session.close().await);
        assert_eq!(alice.session.state(), TransportState::Closed);
        assert!(matches!(
            alice.session.create_offer().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::audio_only()).await;
        let media = alice.media.clone();
        assert!(alice.session.open(&media).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_then_recover() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "a", "b", TransportRole::Offerer, MediaConstraints::audio_only()).await;
        let mut bob = side(&network, "b", "a", TransportRole::Answerer, MediaConstraints::audio_only()).await;
        let offer = alice.session.create_offer().await.unwrap();
        let answer = bob.session.create_answer(offer).await.unwrap();
        alice.session.apply_remote_description(answer).await.unwrap();
        pump(&mut alice);
        pump(&mut bob);
        assert!(alice.session.is_connected());

        network.interrupt(&SessionId::new("a"), &SessionId::new("b"));
        pump(&mut alice);
        assert_eq!(alice.session.state(), TransportState::Disconnected);

        network.restore(&SessionId::new("a"), &SessionId::new("b"));
        pump(&mut alice);
        assert_eq!(alice.session.state(), TransportState::Connected);
    }
}

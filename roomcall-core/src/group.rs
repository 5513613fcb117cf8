//! Group call coordination
//!
//! The coordinator keeps one [`TransportSession`] per remote participant,
//! keyed by session id. Whoever is already in the call when a
//! `participant-joined` arrives offers to the newcomer; the newcomer answers
//! every offer it receives. With the initiator present from the start this
//! yields a full mesh where each pair negotiates once and the initiator
//! offers towards everybody.

use crate::call::CallError;
use crate::controller::CallContext;
use crate::identity::{Participant, SessionId};
use crate::media::LocalMedia;
use crate::signaling::OutboundSignal;
use crate::transport::{
    EngineEvent, LinkEvent, TimerKind, TransportId, TransportSession, TransportUpdate,
};
use crate::types::{
    CallEvent, CallStatus, EndReason, GroupCallState, IceCandidate, SessionDescription,
    TransportRole, TransportState,
};
use std::collections::{BTreeMap, HashMap};

/// Mesh of transports for one group call
#[derive(Debug)]
pub struct GroupCallCoordinator {
    state: GroupCallState,
    is_initiator: bool,
    initiator: Option<Participant>,
    participants: BTreeMap<SessionId, Participant>,
    transports: HashMap<SessionId, TransportSession>,
    local_media: Option<LocalMedia>,
    reported: Option<(usize, usize)>,
}

impl Default for GroupCallCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupCallCoordinator {
    /// Idle coordinator
    pub fn new() -> Self {
        Self {
            state: GroupCallState::Idle,
            is_initiator: false,
            initiator: None,
            participants: BTreeMap::new(),
            transports: HashMap::new(),
            local_media: None,
            reported: None,
        }
    }

    /// Current state
    pub fn state(&self) -> GroupCallState {
        self.state
    }

    /// Whether this client started the call
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Who started the call
    pub fn initiator(&self) -> Option<&Participant> {
        self.initiator.as_ref()
    }

    /// Remote participants, ordered by session id
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Transport towards `peer`
    pub fn transport(&self, peer: &SessionId) -> Option<&TransportSession> {
        self.transports.get(peer)
    }

    /// All transports
    pub fn transports(&self) -> impl Iterator<Item = &TransportSession> {
        self.transports.values()
    }

    /// Local capture held by the call
    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    /// Transports currently in `Connected`
    pub fn connected_count(&self) -> usize {
        self.transports.values().filter(|t| t.is_connected()).count()
    }

    /// Whether the call occupies the client
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            GroupCallState::Announcing | GroupCallState::Active
        )
    }

    /// Start a group call and announce it to the room
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless idle, `MediaUnavailable` if capture
    /// fails, or the signaling error if the announcement cannot be sent
    #[tracing::instrument(skip(self, ctx), fields(local = %ctx.local().id))]
    pub async fn start(&mut self, ctx: &CallContext) -> Result<(), CallError> {
        if self.state != GroupCallState::Idle {
            return Err(CallError::InvalidState(format!(
                "cannot start group call in state {:?}",
                self.state
            )));
        }
        let media = ctx.acquire_media().await?;
        self.local_media = Some(media);
        self.is_initiator = true;
        self.initiator = Some(ctx.local().clone());
        self.transition(ctx, GroupCallState::Announcing);

        if let Err(e) = ctx.send(OutboundSignal::GroupCallStart).await {
            self.reset(ctx).await;
            return Err(e);
        }

        self.transition(ctx, GroupCallState::Active);
        tracing::info!("Group call started");
        self.report(ctx);
        Ok(())
    }

    /// A group call was announced; returns `false` if it was our own
    /// announcement or we are not idle
    pub fn handle_available(&mut self, ctx: &CallContext, initiator: Participant) -> bool {
        if ctx.local().is(&initiator.id) {
            tracing::trace!("Ignoring own group call announcement");
            return false;
        }
        if self.state != GroupCallState::Idle {
            tracing::debug!(initiator = %initiator, state = ?self.state, "Group call announcement ignored");
            return false;
        }
        tracing::info!(initiator = %initiator, "Group call available");
        self.initiator = Some(initiator.clone());
        self.transition(ctx, GroupCallState::AwaitingDecision);
        ctx.emit(CallEvent::GroupCallAvailable { initiator });
        true
    }

    /// Join the announced call; transports are created as offers arrive
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless an invitation is pending,
    /// `MediaUnavailable` if capture fails
    #[tracing::instrument(skip(self, ctx), fields(local = %ctx.local().id))]
    pub async fn join(&mut self, ctx: &CallContext) -> Result<(), CallError> {
        if self.state != GroupCallState::AwaitingDecision {
            return Err(CallError::InvalidState(format!(
                "cannot join in state {:?}",
                self.state
            )));
        }
        let Some(initiator) = self.initiator.clone() else {
            return Err(CallError::InvalidState("no initiator".to_string()));
        };

        let media = match ctx.acquire_media().await {
            Ok(media) => media,
            Err(e) => {
                self.reset(ctx).await;
                return Err(e);
            }
        };
        self.local_media = Some(media);

        if let Err(e) = ctx
            .send(OutboundSignal::GroupCallJoin {
                initiator_id: initiator.id.clone(),
            })
            .await
        {
            self.reset(ctx).await;
            return Err(e);
        }

        self.participants.insert(initiator.id.clone(), initiator);
        self.transition(ctx, GroupCallState::Active);
        ctx.status(CallStatus::Connecting);
        tracing::info!("Joined group call");
        Ok(())
    }

    /// Dismiss a pending invitation
    pub fn decline(&mut self, ctx: &CallContext) -> bool {
        if self.state != GroupCallState::AwaitingDecision {
            return false;
        }
        self.initiator = None;
        self.transition(ctx, GroupCallState::Idle);
        true
    }

    /// A member joined; offer to them
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if we are not in the call or already hold
    /// a transport to the joiner
    #[tracing::instrument(skip(self, ctx, joiner), fields(peer = %joiner.id))]
    pub async fn handle_participant_joined(
        &mut self,
        ctx: &CallContext,
        joiner: Participant,
    ) -> Result<(), CallError> {
        if ctx.local().is(&joiner.id) {
            tracing::trace!("Ignoring own participant-joined");
            return Ok(());
        }
        if self.state != GroupCallState::Active {
            return Err(CallError::ProtocolViolation(format!(
                "participant-joined in state {:?}",
                self.state
            )));
        }
        if self.transports.contains_key(&joiner.id) {
            return Err(CallError::ProtocolViolation(format!(
                "already negotiating with {}",
                joiner.id
            )));
        }
        let Some(media) = self.local_media.clone() else {
            return Err(CallError::InvalidState("no local media".to_string()));
        };

        self.add_participant(ctx, joiner.clone());
        let mut transport = match ctx
            .open_transport(joiner.id.clone(), TransportRole::Offerer, &media)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.remove_peer(ctx, &joiner.id, EndReason::Failed(e.to_string()))
                    .await;
                return Err(e);
            }
        };
        let offer = transport.create_offer().await;
        self.transports.insert(joiner.id.clone(), transport);

        match offer {
            Ok(offer) => {
                if let Err(e) = ctx
                    .send(OutboundSignal::SdpOffer {
                        description: offer,
                        target_id: joiner.id.clone(),
                    })
                    .await
                {
                    self.remove_peer(ctx, &joiner.id, EndReason::Failed(e.to_string()))
                        .await;
                    return Err(e);
                }
                self.report(ctx);
                Ok(())
            }
            Err(e) => {
                let e = CallError::from(e);
                self.remove_peer(ctx, &joiner.id, EndReason::Failed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Offer from a member; an unknown sender gets an answerer transport
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` unless in the call, or the negotiation
    /// error that failed that peer
    pub async fn handle_remote_offer(
        &mut self,
        ctx: &CallContext,
        from: &SessionId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        if self.state != GroupCallState::Active {
            return Err(CallError::ProtocolViolation(format!(
                "sdp-offer in state {:?}",
                self.state
            )));
        }
        if !self.transports.contains_key(from) {
            let Some(media) = self.local_media.clone() else {
                return Err(CallError::InvalidState("no local media".to_string()));
            };
            let name = self
                .participants
                .get(from)
                .map_or_else(|| from.to_string(), |p| p.display_name.clone());
            self.add_participant(ctx, Participant::new(from.clone(), name));
            match ctx
                .open_transport(from.clone(), TransportRole::Answerer, &media)
                .await
            {
                Ok(t) => {
                    self.transports.insert(from.clone(), t);
                }
                Err(e) => {
                    self.remove_peer(ctx, from, EndReason::Failed(e.to_string()))
                        .await;
                    return Err(e);
                }
            }
        }

        let answer = match self.transports.get_mut(from) {
            Some(t) => t.create_answer(offer).await,
            None => return Ok(()),
        };
        match answer {
            Ok(answer) => {
                if let Err(e) = ctx
                    .send(OutboundSignal::SdpAnswer {
                        description: answer,
                        target_id: from.clone(),
                    })
                    .await
                {
                    self.remove_peer(ctx, from, EndReason::Failed(e.to_string()))
                        .await;
                    return Err(e);
                }
                self.report(ctx);
                Ok(())
            }
            Err(e) => {
                let e = CallError::from(e);
                self.peer_failed(ctx, from).await;
                Err(e)
            }
        }
    }

    /// Answer from a member we offered to
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` without a transport for `from`, or the
    /// negotiation error that failed that peer
    pub async fn handle_remote_answer(
        &mut self,
        ctx: &CallContext,
        from: &SessionId,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let Some(transport) = self.transports.get_mut(from) else {
            return Err(CallError::ProtocolViolation(format!(
                "sdp-answer from {from} without a transport"
            )));
        };
        if let Err(e) = transport.apply_remote_description(answer).await {
            self.peer_failed(ctx, from).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Candidate from a member
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` without a transport for `from`
    pub async fn handle_remote_candidate(
        &mut self,
        from: &SessionId,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let Some(transport) = self.transports.get_mut(from) else {
            return Err(CallError::ProtocolViolation(format!(
                "ice-candidate from {from} without a transport"
            )));
        };
        if let Err(e) = transport.add_remote_candidate(candidate).await {
            tracing::warn!(peer = %from, error = %e, "Remote candidate rejected by link");
        }
        Ok(())
    }

    /// A member hung up or could not be reached; only that peer is dropped
    ///
    /// Returns `true` if a joiner was left with nobody and the call ended.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if `peer` is not part of the call
    pub async fn handle_peer_ended(
        &mut self,
        ctx: &CallContext,
        peer: &SessionId,
        reason: EndReason,
    ) -> Result<bool, CallError> {
        if !self.participants.contains_key(peer) && !self.transports.contains_key(peer) {
            return Err(CallError::ProtocolViolation(format!(
                "call-ended from {peer}, who is not in the group call"
            )));
        }
        tracing::info!(peer = %peer, reason = ?reason, "Participant left group call");
        Ok(self.peer_left(ctx, peer, reason).await)
    }

    /// The relay could not reach `target`
    ///
    /// Returns `true` if the call itself is over: the initiator is gone
    /// before anyone connected, or the last peer of a joiner is gone.
    pub async fn handle_unreachable(&mut self, ctx: &CallContext, target: &str) -> bool {
        let peer = SessionId::new(target);
        let initiator_gone = self
            .initiator
            .as_ref()
            .is_some_and(|i| i.id == peer && !self.is_initiator);

        if initiator_gone && self.transports.is_empty() {
            tracing::info!(initiator = %peer, "Group call no longer exists");
            let name = self
                .initiator
                .as_ref()
                .map_or_else(|| target.to_string(), |i| i.display_name.clone());
            self.leave_quietly(ctx).await;
            ctx.status(CallStatus::Unavailable { name });
            return true;
        }
        if self.participants.contains_key(&peer) || self.transports.contains_key(&peer) {
            return self
                .peer_left(ctx, &peer, EndReason::PeerUnreachable)
                .await;
        }
        false
    }

    /// Feed a link callback
    pub async fn handle_link_event(
        &mut self,
        ctx: &CallContext,
        transport: TransportId,
        peer: &SessionId,
        event: LinkEvent,
    ) {
        let update = match self.transports.get_mut(peer) {
            Some(t) if t.id() == transport => t.handle_link_event(event),
            _ => {
                tracing::trace!(peer = %peer, "Link event for unknown transport ignored");
                return;
            }
        };
        if let Some(update) = update {
            self.apply_update(ctx, peer, update).await;
        }
    }

    /// Feed a timer expiry
    pub async fn handle_timer(
        &mut self,
        ctx: &CallContext,
        transport: TransportId,
        peer: &SessionId,
        kind: TimerKind,
        seq: u64,
    ) {
        let update = match self.transports.get_mut(peer) {
            Some(t) if t.id() == transport => t.handle_timer(kind, seq).await,
            _ => return,
        };
        if let Some(update) = update {
            self.apply_update(ctx, peer, update).await;
        }
    }

    /// Grace delay for a failed peer elapsed; drop it if still failed
    ///
    /// Returns `true` if dropping it ended the call.
    pub async fn handle_peer_grace(
        &mut self,
        ctx: &CallContext,
        transport: TransportId,
        peer: &SessionId,
    ) -> bool {
        let still_failed = self.transports.get(peer).is_some_and(|t| {
            t.id() == transport && matches!(t.state(), TransportState::Failed | TransportState::Ended)
        });
        if still_failed {
            let reason = self
                .transports
                .get(peer)
                .and_then(|t| t.last_error().cloned())
                .map_or_else(
                    || EndReason::Failed("connection lost".to_string()),
                    |e| EndReason::Failed(e.to_string()),
                );
            return self.peer_left(ctx, peer, reason).await;
        }
        false
    }

    async fn apply_update(&mut self, ctx: &CallContext, peer: &SessionId, update: TransportUpdate) {
        match update {
            TransportUpdate::LocalCandidate(candidate) => {
                if let Err(e) = ctx
                    .send(OutboundSignal::IceCandidate {
                        candidate,
                        target_id: peer.clone(),
                    })
                    .await
                {
                    tracing::warn!(peer = %peer, error = %e, "Failed to forward candidate");
                }
            }
            TransportUpdate::RemoteTrack(track) => {
                ctx.emit(CallEvent::RemoteTrackAdded {
                    peer: peer.clone(),
                    track,
                });
            }
            TransportUpdate::StateChanged { new, .. } => {
                ctx.emit(CallEvent::TransportStateChanged {
                    peer: peer.clone(),
                    state: new,
                });
                match new {
                    TransportState::Connected => {
                        tracing::info!(peer = %peer, "Group peer connected");
                    }
                    TransportState::Failed | TransportState::Ended => {
                        self.peer_failed(ctx, peer).await;
                    }
                    _ => {}
                }
                self.report(ctx);
            }
        }
    }

    /// Keep a failed peer listed (not connected) until the grace delay ends
    async fn peer_failed(&mut self, ctx: &CallContext, peer: &SessionId) {
        let Some(transport) = self.transports.get(peer) else {
            return;
        };
        tracing::warn!(peer = %peer, state = ?transport.state(), "Group peer transport lost");
        ctx.schedule(
            ctx.config().status_grace(),
            EngineEvent::PeerGrace {
                transport: transport.id(),
                peer: peer.clone(),
            },
        );
        self.report(ctx);
    }

    /// Leave the call: tell every peer and the relay, close everything
    ///
    /// Returns `false` if there was nothing to leave.
    #[tracing::instrument(skip(self, ctx), fields(local = %ctx.local().id))]
    pub async fn leave(&mut self, ctx: &CallContext) -> bool {
        match self.state {
            GroupCallState::Idle => false,
            GroupCallState::AwaitingDecision => self.decline(ctx),
            GroupCallState::Announcing | GroupCallState::Active => {
                let mut peers: Vec<SessionId> = self.transports.keys().cloned().collect();
                peers.sort();
                for peer in peers {
                    if let Err(e) = ctx.send(OutboundSignal::CallEnded { peer_id: peer }).await {
                        tracing::warn!(error = %e, "Failed to notify group peer");
                    }
                }
                if let Some(initiator) = self.initiator.as_ref() {
                    if let Err(e) = ctx
                        .send(OutboundSignal::GroupCallLeave {
                            initiator_id: initiator.id.clone(),
                        })
                        .await
                    {
                        tracing::warn!(error = %e, "Failed to leave group roster");
                    }
                }
                self.leave_quietly(ctx).await;
                ctx.status(CallStatus::Ended);
                tracing::info!("Left group call");
                true
            }
        }
    }

    async fn leave_quietly(&mut self, ctx: &CallContext) {
        let peers: Vec<SessionId> = self.transports.keys().cloned().collect();
        for peer in peers {
            self.close_transport(ctx, &peer).await;
        }
        self.reset(ctx).await;
    }

    /// Stop media and return to `Idle`; all transports must be closed first
    async fn reset(&mut self, ctx: &CallContext) {
        for peer in self.transports.keys().cloned().collect::<Vec<_>>() {
            self.close_transport(ctx, &peer).await;
        }
        if let Some(media) = self.local_media.take() {
            media.stop();
        }
        self.participants.clear();
        self.initiator = None;
        self.is_initiator = false;
        self.reported = None;
        self.transition(ctx, GroupCallState::Idle);
    }

    fn add_participant(&mut self, ctx: &CallContext, participant: Participant) {
        if self.participants.contains_key(&participant.id) {
            return;
        }
        tracing::debug!(participant = %participant, "Participant added");
        self.participants
            .insert(participant.id.clone(), participant.clone());
        ctx.emit(CallEvent::ParticipantJoined { participant });
    }

    async fn remove_peer(&mut self, ctx: &CallContext, peer: &SessionId, reason: EndReason) {
        self.forget_peer(ctx, peer, reason).await;
        self.report(ctx);
    }

    /// A peer left the call; returns `true` if that left a joiner alone
    /// and it left too
    async fn peer_left(&mut self, ctx: &CallContext, peer: &SessionId, reason: EndReason) -> bool {
        self.forget_peer(ctx, peer, reason).await;
        if !self.is_initiator
            && self.state == GroupCallState::Active
            && self.participants.is_empty()
            && self.transports.is_empty()
        {
            tracing::info!("Last peer gone, leaving group call");
            return self.leave(ctx).await;
        }
        self.report(ctx);
        false
    }

    async fn forget_peer(&mut self, ctx: &CallContext, peer: &SessionId, reason: EndReason) {
        self.close_transport(ctx, peer).await;
        if self.participants.remove(peer).is_some() {
            ctx.emit(CallEvent::ParticipantLeft {
                peer: peer.clone(),
                reason,
            });
        }
    }

    async fn close_transport(&mut self, ctx: &CallContext, peer: &SessionId) {
        if let Some(mut transport) = self.transports.remove(peer) {
            let had_tracks = !transport.remote_tracks().is_empty();
            transport.close().await;
            if had_tracks {
                ctx.emit(CallEvent::RemoteMediaReleased { peer: peer.clone() });
            }
            ctx.emit(CallEvent::TransportStateChanged {
                peer: peer.clone(),
                state: transport.state(),
            });
        }
    }

    /// Emit the connection summary if it changed
    fn report(&mut self, ctx: &CallContext) {
        if self.state != GroupCallState::Active {
            return;
        }
        let counts = (self.connected_count(), self.participants.len());
        if self.reported == Some(counts) {
            return;
        }
        self.reported = Some(counts);
        let (connected, participants) = counts;
        ctx.emit(CallEvent::GroupConnections {
            connected,
            participants,
        });
        if participants == 0 {
            ctx.status(CallStatus::WaitingForParticipants);
        } else {
            ctx.status(CallStatus::GroupConnected {
                connected,
                participants,
            });
        }
    }

    fn transition(&mut self, ctx: &CallContext, new_state: GroupCallState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        self.state = new_state;
        tracing::debug!(
            old_state = ?old_state,
            new_state = ?new_state,
            "Group call state transition"
        );
        ctx.emit(CallEvent::GroupStateChanged {
            old: old_state,
            new: new_state,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::CallConfig;
    use crate::loopback::{LoopbackDevices, LoopbackNetwork};
    use crate::relay::RecordingChannel;
    use crate::signaling::SignalingHandler;
    use std::sync::Arc;

    struct Fixture {
        ctx: CallContext,
        channel: RecordingChannel,
        devices: LoopbackDevices,
    }

    fn fixture(id: &str) -> Fixture {
        let channel = RecordingChannel::new();
        let devices = LoopbackDevices::new();
        let local = Participant::new(id, format!("user-{id}"));
        let (engine_tx, _engine_rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = CallContext::new(
            local.clone(),
            SignalingHandler::new(Arc::new(channel.clone())),
            Arc::new(devices.clone()),
            Arc::new(LoopbackNetwork::new().engine(local.id)),
            CallConfig::default(),
            engine_tx,
        );
        Fixture {
            ctx,
            channel,
            devices,
        }
    }

    #[tokio::test]
    async fn test_start_is_active_with_no_participants() {
        let f = fixture("i");
        let mut group = GroupCallCoordinator::new();
        group.start(&f.ctx).await.unwrap();

        assert_eq!(group.state(), GroupCallState::Active);
        assert!(group.is_initiator());
        assert_eq!(group.participants().count(), 0);
        assert_eq!(f.channel.sent(), vec![OutboundSignal::GroupCallStart]);
    }

    #[tokio::test]
    async fn test_own_announcement_is_ignored() {
        let f = fixture("i");
        let mut group = GroupCallCoordinator::new();
        assert!(!group.handle_available(&f.ctx, Participant::new("i", "user-i")));
        assert_eq!(group.state(), GroupCallState::Idle);
    }

    #[tokio::test]
    async fn test_self_join_creates_no_transport() {
        let f = fixture("i");
        let mut group = GroupCallCoordinator::new();
        group.start(&f.ctx).await.unwrap();

        group
            .handle_participant_joined(&f.ctx, Participant::new("i", "user-i"))
            .await
            .unwrap();
        assert_eq!(group.transports().count(), 0);
        assert_eq!(f.channel.count("sdp-offer"), 0);
    }

    #[tokio::test]
    async fn test_participant_joined_offers() {
        let f = fixture("i");
        let mut group = GroupCallCoordinator::new();
        group.start(&f.ctx).await.unwrap();

        group
            .handle_participant_joined(&f.ctx, Participant::new("a", "ann"))
            .await
            .unwrap();

        let transport = group.transport(&SessionId::new("a")).unwrap();
        assert_eq!(transport.role(), TransportRole::Offerer);
        assert_eq!(f.channel.count("sdp-offer"), 1);

        let dup = group
            .handle_participant_joined(&f.ctx, Participant::new("a", "ann"))
            .await;
        assert!(matches!(dup, Err(CallError::ProtocolViolation(_))));
        assert_eq!(f.channel.count("sdp-offer"), 1);
    }

    #[tokio::test]
    async fn test_join_creates_no_transport_until_offer() {
        let f = fixture("a");
        let mut group = GroupCallCoordinator::new();
        assert!(group.handle_available(&f.ctx, Participant::new("i", "ivan")));
        assert_eq!(group.state(), GroupCallState::AwaitingDecision);

        group.join(&f.ctx).await.unwrap();
        assert_eq!(group.state(), GroupCallState::Active);
        assert_eq!(group.transports().count(), 0);
        assert_eq!(
            f.channel.sent(),
            vec![OutboundSignal::GroupCallJoin {
                initiator_id: SessionId::new("i")
            }]
        );
    }

    #[tokio::test]
    async fn test_answer_from_stranger_is_protocol_violation() {
        let f = fixture("i");
        let mut group = GroupCallCoordinator::new();
        group.start(&f.ctx).await.unwrap();

        let res = group
            .handle_remote_answer(&f.ctx, &SessionId::new("x"), SessionDescription::answer("v=0"))
            .await;
        assert!(matches!(res, Err(CallError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_leave_notifies_peers_and_releases_media() {
        let f = fixture("i");
        let mut group = GroupCallCoordinator::new();
        group.start(&f.ctx).await.unwrap();
        for (id, name) in [("a", "ann"), ("b", "ben")] {
            group
                .handle_participant_joined(&f.ctx, Participant::new(id, name))
                .await
                .unwrap();
        }

        assert!(group.leave(&f.ctx).await);
        assert!(!group.leave(&f.ctx).await);

        assert_eq!(group.state(), GroupCallState::Idle);
        assert_eq!(group.transports().count(), 0);
        assert_eq!(f.channel.count("call-ended"), 2);
        assert_eq!(f.channel.count("group-call-leave"), 1);
        assert_eq!(f.devices.live_captures(), 0);
    }

    #[tokio::test]
    async fn test_peer_ended_drops_only_that_peer() {
        let f = fixture("i");
        let mut group = GroupCallCoordinator::new();
        group.start(&f.ctx).await.unwrap();
        for (id, name) in [("a", "ann"), ("b", "ben")] {
            group
                .handle_participant_joined(&f.ctx, Participant::new(id, name))
                .await
                .unwrap();
        }

        group
            .handle_peer_ended(&f.ctx, &SessionId::new("a"), EndReason::RemoteHangup)
            .await
            .unwrap();

        assert!(group.transport(&SessionId::new("a")).is_none());
        assert!(group.transport(&SessionId::new("b")).is_some());
        assert_eq!(group.state(), GroupCallState::Active);
    }

    #[tokio::test]
    async fn test_joiner_left_alone_leaves_the_call() {
        let f = fixture("a");
        let mut group = GroupCallCoordinator::new();
        group.handle_available(&f.ctx, Participant::new("i", "ivan"));
        group.join(&f.ctx).await.unwrap();
        group
            .handle_participant_joined(&f.ctx, Participant::new("b", "ben"))
            .await
            .unwrap();

        let over = group
            .handle_peer_ended(&f.ctx, &SessionId::new("b"), EndReason::RemoteHangup)
            .await
            .unwrap();

        assert!(over);
        assert_eq!(group.state(), GroupCallState::Idle);
        assert_eq!(group.transports().count(), 0);
        assert_eq!(f.channel.count("group-call-leave"), 1);
        assert_eq!(f.devices.live_captures(), 0);
    }

    #[tokio::test]
    async fn test_initiator_left_alone_keeps_waiting() {
        let f = fixture("i");
        let mut group = GroupCallCoordinator::new();
        group.start(&f.ctx).await.unwrap();
        group
            .handle_participant_joined(&f.ctx, Participant::new("a", "ann"))
            .await
            .unwrap();

        let over = group
            .handle_peer_ended(&f.ctx, &SessionId::new("a"), EndReason::RemoteHangup)
            .await
            .unwrap();

        assert!(!over);
        assert_eq!(group.state(), GroupCallState::Active);
        assert_eq!(f.devices.live_captures(), 1);
    }

    #[tokio::test]
    async fn test_denied_media_on_join_returns_to_idle() {
        let f = fixture("a");
        f.devices.deny(true);
        let mut group = GroupCallCoordinator::new();
        group.handle_available(&f.ctx, Participant::new("i", "ivan"));

        let res = group.join(&f.ctx).await;
        assert!(matches!(res, Err(CallError::MediaUnavailable(_))));
        assert_eq!(group.state(), GroupCallState::Idle);
        assert!(f.channel.sent().is_empty());
    }
}

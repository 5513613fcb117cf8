//! Private call sessions
//!
//! A [`CallSession`] is one 1:1 call intent, outgoing or incoming. It owns
//! the local capture for the call and at most one [`TransportSession`]
//! towards the partner. Every terminal path (hangup, rejection, transport
//! failure, timeout) runs through the same cleanup: transport closed, media
//! stopped, terminal status emitted, grace timer armed.

use crate::controller::CallContext;
use crate::identity::{Participant, SessionId};
use crate::media::{LocalMedia, MediaError};
use crate::signaling::{OutboundSignal, SignalingError};
use crate::transport::{
    EngineEvent, LinkEvent, TimerKind, TransportError, TransportId, TransportSession,
    TransportUpdate,
};
use crate::types::{
    CallDirection, CallEvent, CallId, CallIntent, CallState, CallStatus, EndReason, IceCandidate,
    SessionDescription, TransportRole, TransportState,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Call-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Capture device denied or absent
    #[error("Media unavailable: {0}")]
    MediaUnavailable(MediaError),

    /// Description or candidate applied out of sequence
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// Connection or path-discovery timer fired
    #[error("Transport timeout: {0:?}")]
    TransportTimeout(TimerKind),

    /// Relay could not deliver to the peer
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Message for an unknown or closed session, or a forbidden mode change
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Relay connection failure
    #[error("Signaling error: {0}")]
    Signaling(SignalingError),

    /// The call service task is gone
    #[error("Call service stopped")]
    ServiceStopped,
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        Self::MediaUnavailable(e)
    }
}

impl From<SignalingError> for CallError {
    fn from(e: SignalingError) -> Self {
        match e {
            SignalingError::PeerUnreachable(peer) => Self::PeerUnreachable(peer),
            other => Self::Signaling(other),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Negotiation(reason) => Self::NegotiationError(reason),
            TransportError::Link(reason) => Self::NegotiationError(format!("link: {reason}")),
            TransportError::Timeout(kind) => Self::TransportTimeout(kind),
            TransportError::Closed => Self::ProtocolViolation("transport closed".to_string()),
        }
    }
}

/// One private call
#[derive(Debug)]
pub struct CallSession {
    id: CallId,
    intent: CallIntent,
    state: CallState,
    partner_name: String,
    partner_id: Option<SessionId>,
    local_media: Option<LocalMedia>,
    transport: Option<TransportSession>,
    created_at: DateTime<Utc>,
    active_since: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
}

impl CallSession {
    fn new(intent: CallIntent, partner_name: String, partner_id: Option<SessionId>) -> Self {
        Self {
            id: CallId::new(),
            intent,
            state: CallState::Idle,
            partner_name,
            partner_id,
            local_media: None,
            transport: None,
            created_at: Utc::now(),
            active_since: None,
            end_reason: None,
        }
    }

    /// Call a user by display name
    ///
    /// Local capture must succeed before anything is sent.
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` if capture fails, or the signaling error if
    /// the request cannot be sent
    pub async fn initiate(ctx: &CallContext, partner_name: &str) -> Result<Self, CallError> {
        if partner_name.trim().is_empty() {
            return Err(CallError::InvalidState("empty callee name".to_string()));
        }

        let media = ctx.acquire_media().await?;
        let mut session = Self::new(
            CallIntent::outgoing_private(),
            partner_name.to_string(),
            None,
        );
        session.local_media = Some(media);

        if let Err(e) = ctx
            .send(OutboundSignal::CallRequest {
                target_name: partner_name.to_string(),
            })
            .await
        {
            session.release_media();
            return Err(e);
        }

        session.transition(ctx, CallState::Requesting);
        ctx.status(CallStatus::Calling {
            name: partner_name.to_string(),
        });
        tracing::info!(call_id = %session.id, callee = %partner_name, "Outgoing call requested");
        Ok(session)
    }

    /// Incoming call request; the session rings until accepted or rejected
    pub fn incoming(ctx: &CallContext, caller: Participant) -> Self {
        let mut session = Self::new(
            CallIntent::incoming_private(),
            caller.display_name.clone(),
            Some(caller.id.clone()),
        );
        session.transition(ctx, CallState::Ringing);
        tracing::info!(call_id = %session.id, caller = %caller, "Incoming call");
        ctx.emit(CallEvent::IncomingCall {
            call_id: session.id,
            caller,
        });
        session
    }

    /// Call identifier
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Mode and direction
    pub fn intent(&self) -> CallIntent {
        self.intent
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Partner's display name
    pub fn partner_name(&self) -> &str {
        &self.partner_name
    }

    /// Partner's session id, once known
    pub fn partner_id(&self) -> Option<&SessionId> {
        self.partner_id.as_ref()
    }

    /// Partner, once the session id is known
    pub fn partner(&self) -> Option<Participant> {
        self.partner_id
            .as_ref()
            .map(|id| Participant::new(id.clone(), self.partner_name.clone()))
    }

    /// Transport towards the partner
    pub fn transport(&self) -> Option<&TransportSession> {
        self.transport.as_ref()
    }

    /// Local capture held by this call
    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    /// Why the call ended
    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    /// When the session was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the call still occupies the client
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal() && self.state != CallState::Idle
    }

    /// Accept a ringing call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless ringing; `MediaUnavailable` if capture
    /// fails, in which case the caller is sent a rejection and the session
    /// fails
    #[tracing::instrument(skip(self, ctx), fields(call_id = %self.id))]
    pub async fn accept(&mut self, ctx: &CallContext) -> Result<(), CallError> {
        if self.state != CallState::Ringing {
            return Err(CallError::InvalidState(format!(
                "cannot accept in state {:?}",
                self.state
            )));
        }
        let Some(peer) = self.partner_id.clone() else {
            return Err(CallError::InvalidState("caller unknown".to_string()));
        };

        let media = match ctx.acquire_media().await {
            Ok(media) => media,
            Err(e) => {
                self.abort_incoming(ctx, &peer, &e).await;
                return Err(e);
            }
        };
        self.local_media = Some(media.clone());

        let transport = match ctx
            .open_transport(peer.clone(), TransportRole::Answerer, &media)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.abort_incoming(ctx, &peer, &e).await;
                return Err(e);
            }
        };
        self.transport = Some(transport);

        if let Err(e) = ctx
            .send(OutboundSignal::CallAccept {
                peer_id: peer.clone(),
            })
            .await
        {
            self.finish(ctx, CallState::Failed, EndReason::Failed(e.to_string()), CallStatus::Failed)
                .await;
            return Err(e);
        }

        self.transition(ctx, CallState::Negotiating);
        ctx.status(CallStatus::Connecting);
        Ok(())
    }

    async fn abort_incoming(&mut self, ctx: &CallContext, peer: &SessionId, error: &CallError) {
        tracing::warn!(call_id = %self.id, error = %error, "Cannot accept call");
        let _ = ctx
            .send(OutboundSignal::CallReject {
                peer_id: peer.clone(),
            })
            .await;
        self.finish(
            ctx,
            CallState::Failed,
            EndReason::Failed(error.to_string()),
            CallStatus::Failed,
        )
        .await;
    }

    /// Decline a ringing call; no transport is ever created
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless ringing
    pub async fn reject(&mut self, ctx: &CallContext) -> Result<(), CallError> {
        if self.state != CallState::Ringing {
            return Err(CallError::InvalidState(format!(
                "cannot reject in state {:?}",
                self.state
            )));
        }
        if let Some(peer) = self.partner_id.clone() {
            if let Err(e) = ctx.send(OutboundSignal::CallReject { peer_id: peer }).await {
                tracing::warn!(call_id = %self.id, error = %e, "Failed to send rejection");
            }
        }
        self.end_reason = Some(EndReason::Rejected);
        self.transition(ctx, CallState::Idle);
        ctx.emit(CallEvent::CallEnded {
            call_id: self.id,
            reason: EndReason::Rejected,
            duration_secs: None,
        });
        tracing::info!(call_id = %self.id, "Incoming call rejected");
        Ok(())
    }

    /// The callee accepted; negotiate as offerer
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` unless an outgoing request to `name` is
    /// pending, or the negotiation error that failed the call
    #[tracing::instrument(skip(self, ctx), fields(call_id = %self.id))]
    pub async fn handle_accepted(
        &mut self,
        ctx: &CallContext,
        accepter: SessionId,
        name: &str,
    ) -> Result<(), CallError> {
        if self.state != CallState::Requesting || self.intent.direction != CallDirection::Outgoing {
            return Err(CallError::ProtocolViolation(format!(
                "call-accept in state {:?}",
                self.state
            )));
        }
        self.check_callee(name, "call-accept")?;
        let Some(media) = self.local_media.clone() else {
            return Err(CallError::InvalidState("no local media".to_string()));
        };
        self.partner_id = Some(accepter.clone());

        let mut transport = match ctx
            .open_transport(accepter.clone(), TransportRole::Offerer, &media)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.fail(ctx, &e).await;
                return Err(e);
            }
        };
        let offer = transport.create_offer().await;
        self.transport = Some(transport);
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                let e = CallError::from(e);
                self.fail(ctx, &e).await;
                return Err(e);
            }
        };

        self.transition(ctx, CallState::Negotiating);
        ctx.status(CallStatus::Connecting);

        if let Err(e) = ctx
            .send(OutboundSignal::SdpOffer {
                description: offer,
                target_id: accepter,
            })
            .await
        {
            self.fail(ctx, &e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Replies to a request are matched by the name it was addressed to
    fn check_callee(&self, name: &str, what: &str) -> Result<(), CallError> {
        if name != self.partner_name {
            return Err(CallError::ProtocolViolation(format!(
                "{what} from {name}, but {} was called",
                self.partner_name
            )));
        }
        Ok(())
    }

    fn check_partner(&self, from: &SessionId, what: &str) -> Result<(), CallError> {
        if self.partner_id.as_ref() != Some(from) {
            return Err(CallError::ProtocolViolation(format!(
                "{what} from {from}, who is not the call partner"
            )));
        }
        Ok(())
    }

    fn live_transport(&mut self, what: &str) -> Result<&mut TransportSession, CallError> {
        if self.state.is_terminal() {
            return Err(CallError::ProtocolViolation(format!(
                "{what} for finished call"
            )));
        }
        self.transport
            .as_mut()
            .ok_or_else(|| CallError::ProtocolViolation(format!("{what} without a transport")))
    }

    /// Offer from the partner; reply with an answer
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` without a matching transport, or the
    /// negotiation error that failed the call
    pub async fn handle_remote_offer(
        &mut self,
        ctx: &CallContext,
        from: &SessionId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        self.check_partner(from, "sdp-offer")?;
        let transport = self.live_transport("sdp-offer")?;
        match transport.create_answer(offer).await {
            Ok(answer) => {
                ctx.status(CallStatus::EstablishingConnection);
                if let Err(e) = ctx
                    .send(OutboundSignal::SdpAnswer {
                        description: answer,
                        target_id: from.clone(),
                    })
                    .await
                {
                    self.fail(ctx, &e).await;
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => {
                let e = CallError::from(e);
                self.fail(ctx, &e).await;
                Err(e)
            }
        }
    }

    /// Answer from the partner
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` without a matching transport, or the
    /// negotiation error that failed the call
    pub async fn handle_remote_answer(
        &mut self,
        ctx: &CallContext,
        from: &SessionId,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        self.check_partner(from, "sdp-answer")?;
        let transport = self.live_transport("sdp-answer")?;
        if let Err(e) = transport.apply_remote_description(answer).await {
            let e = CallError::from(e);
            self.fail(ctx, &e).await;
            return Err(e);
        }
        ctx.status(CallStatus::EstablishingConnection);
        Ok(())
    }

    /// Candidate from the partner
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` without a matching transport
    pub async fn handle_remote_candidate(
        &mut self,
        from: &SessionId,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        self.check_partner(from, "ice-candidate")?;
        let transport = self.live_transport("ice-candidate")?;
        if let Err(e) = transport.add_remote_candidate(candidate).await {
            tracing::warn!(peer = %from, error = %e, "Remote candidate rejected by link");
        }
        Ok(())
    }

    /// Hang up; a no-op once the call is over
    ///
    /// Returns `true` if this call ended the session.
    ///
    /// # Errors
    ///
    /// Never fails today; signaling failures are logged
    #[tracing::instrument(skip(self, ctx), fields(call_id = %self.id))]
    pub async fn end(&mut self, ctx: &CallContext) -> Result<bool, CallError> {
        match self.state {
            CallState::Idle | CallState::Ended | CallState::Rejected | CallState::Failed => {
                Ok(false)
            }
            CallState::Ringing => {
                self.reject(ctx).await?;
                Ok(true)
            }
            CallState::Requesting => {
                // The callee's id is unknown until it accepts; a late accept is
                // answered with call-ended by the controller.
                self.finish(ctx, CallState::Ended, EndReason::LocalHangup, CallStatus::Ended)
                    .await;
                Ok(true)
            }
            CallState::Negotiating | CallState::Active => {
                if let Some(peer) = self.partner_id.clone() {
                    if let Err(e) = ctx.send(OutboundSignal::CallEnded { peer_id: peer }).await {
                        tracing::warn!(call_id = %self.id, error = %e, "Failed to notify partner");
                    }
                }
                self.finish(ctx, CallState::Ended, EndReason::LocalHangup, CallStatus::Ended)
                    .await;
                Ok(true)
            }
        }
    }

    /// Partner hung up
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if `from` is not the partner
    pub async fn handle_remote_ended(
        &mut self,
        ctx: &CallContext,
        from: &SessionId,
    ) -> Result<(), CallError> {
        self.check_partner(from, "call-ended")?;
        if !self.is_live() {
            return Ok(());
        }
        tracing::info!(call_id = %self.id, peer = %from, "Partner ended the call");
        self.finish(ctx, CallState::Ended, EndReason::RemoteHangup, CallStatus::Ended)
            .await;
        Ok(())
    }

    /// Callee declined
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` unless an outgoing request to `name` is
    /// pending
    pub async fn handle_remote_rejected(
        &mut self,
        ctx: &CallContext,
        from: &SessionId,
        name: &str,
    ) -> Result<(), CallError> {
        if self.state != CallState::Requesting {
            return Err(CallError::ProtocolViolation(format!(
                "call-reject in state {:?}",
                self.state
            )));
        }
        self.check_callee(name, "call-reject")?;
        self.partner_id = Some(from.clone());
        tracing::info!(call_id = %self.id, peer = %from, "Call rejected");
        self.finish(ctx, CallState::Rejected, EndReason::Rejected, CallStatus::Rejected)
            .await;
        Ok(())
    }

    /// The relay could not deliver to `target`
    ///
    /// Returns `true` if `target` was this call's partner.
    pub async fn handle_unreachable(&mut self, ctx: &CallContext, target: &str) -> bool {
        let matches = self.partner_name == target
            || self.partner_id.as_ref().is_some_and(|id| id.as_str() == target);
        if !matches || !self.is_live() {
            return false;
        }
        let terminal = self.failure_state();
        self.finish(
            ctx,
            terminal,
            EndReason::PeerUnreachable,
            CallStatus::Unavailable {
                name: self.partner_name.clone(),
            },
        )
        .await;
        true
    }

    /// Feed a link callback for this call's transport
    pub async fn handle_link_event(
        &mut self,
        ctx: &CallContext,
        transport: TransportId,
        event: LinkEvent,
    ) {
        let update = match self.transport.as_mut() {
            Some(t) if t.id() == transport => t.handle_link_event(event),
            _ => {
                tracing::trace!(call_id = %self.id, "Link event for foreign transport ignored");
                return;
            }
        };
        if let Some(update) = update {
            self.apply_update(ctx, update).await;
        }
    }

    /// Feed a timer expiry for this call's transport
    pub async fn handle_timer(
        &mut self,
        ctx: &CallContext,
        transport: TransportId,
        kind: TimerKind,
        seq: u64,
    ) {
        let update = match self.transport.as_mut() {
            Some(t) if t.id() == transport => t.handle_timer(kind, seq).await,
            _ => return,
        };
        if let Some(update) = update {
            self.apply_update(ctx, update).await;
        }
    }

    async fn apply_update(&mut self, ctx: &CallContext, update: TransportUpdate) {
        let Some(peer) = self.partner_id.clone() else {
            return;
        };
        match update {
            TransportUpdate::LocalCandidate(candidate) => {
                if let Err(e) = ctx
                    .send(OutboundSignal::IceCandidate {
                        candidate,
                        target_id: peer,
                    })
                    .await
                {
                    tracing::warn!(call_id = %self.id, error = %e, "Failed to forward candidate");
                }
            }
            TransportUpdate::RemoteTrack(track) => {
                ctx.emit(CallEvent::RemoteTrackAdded { peer, track });
            }
            TransportUpdate::StateChanged { new, .. } => {
                ctx.emit(CallEvent::TransportStateChanged {
                    peer,
                    state: new,
                });
                match new {
                    TransportState::Connected => {
                        if self.state == CallState::Negotiating {
                            self.active_since = Some(Utc::now());
                            self.transition(ctx, CallState::Active);
                            tracing::info!(call_id = %self.id, partner = %self.partner_name, "Call connected");
                        }
                        ctx.status(CallStatus::Connected);
                    }
                    TransportState::Disconnected => ctx.status(CallStatus::Reconnecting),
                    TransportState::Failed | TransportState::Ended => {
                        let error = self
                            .transport
                            .as_ref()
                            .and_then(|t| t.last_error().cloned())
                            .map_or_else(
                                || CallError::NegotiationError("connection lost".to_string()),
                                CallError::from,
                            );
                        self.fail(ctx, &error).await;
                    }
                    _ => {}
                }
            }
        }
    }

    fn failure_state(&self) -> CallState {
        if self.state == CallState::Active {
            CallState::Ended
        } else {
            CallState::Failed
        }
    }

    /// Fail the call, telling the partner if one is known
    async fn fail(&mut self, ctx: &CallContext, error: &CallError) {
        if !self.is_live() {
            return;
        }
        tracing::warn!(call_id = %self.id, error = %error, "Call failed");
        if let Some(peer) = self.partner_id.clone() {
            let _ = ctx.send(OutboundSignal::CallEnded { peer_id: peer }).await;
        }
        let terminal = self.failure_state();
        self.finish(
            ctx,
            terminal,
            EndReason::Failed(error.to_string()),
            CallStatus::Failed,
        )
        .await;
    }

    async fn finish(
        &mut self,
        ctx: &CallContext,
        terminal: CallState,
        reason: EndReason,
        status: CallStatus,
    ) {
        if self.state.is_terminal() {
            return;
        }

        if let Some(mut transport) = self.transport.take() {
            let had_tracks = !transport.remote_tracks().is_empty();
            if transport.close().await {
                let peer = transport.peer_id().clone();
                if had_tracks {
                    ctx.emit(CallEvent::RemoteMediaReleased { peer: peer.clone() });
                }
                ctx.emit(CallEvent::TransportStateChanged {
                    peer,
                    state: transport.state(),
                });
            }
        }
        self.release_media();

        self.transition(ctx, terminal);
        self.end_reason = Some(reason.clone());
        let duration_secs = self
            .active_since
            .map(|since| (Utc::now() - since).num_seconds());

        tracing::info!(call_id = %self.id, state = ?terminal, reason = ?reason, "Call finished");
        ctx.status(status);
        ctx.emit(CallEvent::CallEnded {
            call_id: self.id,
            reason,
            duration_secs,
        });
        ctx.schedule(
            ctx.config().status_grace(),
            EngineEvent::CallGrace { call_id: self.id },
        );
    }

    fn release_media(&mut self) {
        if let Some(media) = self.local_media.take() {
            media.stop();
        }
    }

    fn transition(&mut self, ctx: &CallContext, new_state: CallState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        self.state = new_state;
        tracing::debug!(
            call_id = %self.id,
            old_state = ?old_state,
            new_state = ?new_state,
            "Call state transition"
        );
        ctx.emit(CallEvent::CallStateChanged {
            call_id: self.id,
            old: old_state,
            new: new_state,
        });
    }
}

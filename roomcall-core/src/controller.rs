//! Call controller
//!
//! [`CallController`] is the façade the UI talks to. It holds at most one
//! private [`CallSession`] or one [`GroupCallCoordinator`] at a time and
//! routes every inbound signal and engine event to it. A call that reached
//! a terminal state stays in place (so the UI can show the final status)
//! until its grace delay elapses or a new call replaces it.

use crate::call::{CallError, CallSession};
use crate::config::CallConfig;
use crate::group::GroupCallCoordinator;
use crate::identity::{Participant, SessionId};
use crate::media::{LocalMedia, MediaDevices};
use crate::signaling::{InboundSignal, OutboundSignal, SignalingHandler};
use crate::transport::{EngineEvent, EngineSender, MediaEngine, TransportSession};
use crate::types::{
    CallDirection, CallEvent, CallId, CallMode, CallState, CallStatus, EndReason, GroupCallState,
    TransportRole, TransportState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Collaborators shared by every session of one client
#[derive(Clone)]
pub struct CallContext {
    local: Participant,
    signaling: SignalingHandler,
    devices: Arc<dyn MediaDevices>,
    engine: Arc<dyn MediaEngine>,
    config: CallConfig,
    events: broadcast::Sender<CallEvent>,
    engine_tx: EngineSender,
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("local", &self.local)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CallContext {
    /// Bundle the collaborators; `engine_tx` feeds the engine's event loop
    pub fn new(
        local: Participant,
        signaling: SignalingHandler,
        devices: Arc<dyn MediaDevices>,
        engine: Arc<dyn MediaEngine>,
        config: CallConfig,
        engine_tx: EngineSender,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local,
            signaling,
            devices,
            engine,
            config,
            events,
            engine_tx,
        }
    }

    /// This client
    pub fn local(&self) -> &Participant {
        &self.local
    }

    /// Engine configuration
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Outbound signaling
    pub fn signaling(&self) -> &SignalingHandler {
        &self.signaling
    }

    /// Subscribe to UI events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Sender<CallEvent> {
        self.events.clone()
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn status(&self, status: CallStatus) {
        tracing::debug!(status = %status, class = status.class(), "Status");
        self.emit(CallEvent::Status(status));
    }

    /// Post `event` to the engine queue after `after`
    pub(crate) fn schedule(&self, after: Duration, event: EngineEvent) {
        let tx = self.engine_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        });
    }

    pub(crate) async fn send(&self, signal: OutboundSignal) -> Result<(), CallError> {
        self.signaling.send(signal).await.map_err(CallError::from)
    }

    pub(crate) async fn acquire_media(&self) -> Result<LocalMedia, CallError> {
        match self.devices.acquire(&self.config.media).await {
            Ok(media) => {
                tracing::debug!(stream_id = %media.stream_id, tracks = media.tracks().len(), "Local media acquired");
                Ok(media)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Local media unavailable");
                Err(CallError::MediaUnavailable(e))
            }
        }
    }

    /// Create and open a transport; only called with capture in hand
    pub(crate) async fn open_transport(
        &self,
        peer: SessionId,
        role: TransportRole,
        media: &LocalMedia,
    ) -> Result<TransportSession, CallError> {
        let mut transport = TransportSession::create(
            self.engine.as_ref(),
            peer,
            role,
            &self.config,
            self.engine_tx.clone(),
        )
        .await?;
        if let Err(e) = transport.open(media).await {
            transport.close().await;
            return Err(e.into());
        }
        Ok(transport)
    }
}

/// State of one transport, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSnapshot {
    /// Remote peer
    pub peer: SessionId,
    /// Negotiation role
    pub role: TransportRole,
    /// Current state
    pub state: TransportState,
    /// Tracks received from the peer
    pub remote_tracks: usize,
}

impl From<&TransportSession> for TransportSnapshot {
    fn from(t: &TransportSession) -> Self {
        Self {
            peer: t.peer_id().clone(),
            role: t.role(),
            state: t.state(),
            remote_tracks: t.remote_tracks().len(),
        }
    }
}

/// What the controller is doing, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSnapshot {
    /// No call
    Idle,
    /// Private call
    Private {
        /// Call identifier
        call_id: CallId,
        /// Call state
        state: CallState,
        /// Who called whom
        direction: CallDirection,
        /// Partner's display name
        partner: String,
        /// Partner's session id, once known
        partner_id: Option<SessionId>,
        /// Transport towards the partner
        transport: Option<TransportSnapshot>,
        /// Local audio muted
        muted: bool,
    },
    /// Group call
    Group {
        /// Coordinator state
        state: GroupCallState,
        /// Whether this client started the call
        is_initiator: bool,
        /// Who started the call
        initiator: Option<SessionId>,
        /// Remote participants, sorted
        participants: Vec<SessionId>,
        /// Transports, sorted by peer
        transports: Vec<TransportSnapshot>,
        /// Transports in `Connected`
        connected: usize,
        /// Local audio muted
        muted: bool,
    },
}

impl CallSnapshot {
    /// Transports of whichever call is in progress
    pub fn transports(&self) -> Vec<TransportSnapshot> {
        match self {
            Self::Idle => Vec::new(),
            Self::Private { transport, .. } => transport.iter().cloned().collect(),
            Self::Group { transports, .. } => transports.clone(),
        }
    }
}

#[derive(Debug)]
enum ActiveCall {
    Idle,
    Private(CallSession),
    Group(GroupCallCoordinator),
}

/// Mode selection and message routing for one client
#[derive(Debug)]
pub struct CallController {
    ctx: CallContext,
    active: ActiveCall,
    group_epoch: u64,
}

impl CallController {
    /// Create an idle controller
    pub fn new(ctx: CallContext) -> Self {
        Self {
            ctx,
            active: ActiveCall::Idle,
            group_epoch: 0,
        }
    }

    /// Shared collaborators
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Mode of the call in place, if any
    pub fn mode(&self) -> Option<CallMode> {
        match self.active {
            ActiveCall::Idle => None,
            ActiveCall::Private(_) => Some(CallMode::Private),
            ActiveCall::Group(_) => Some(CallMode::Group),
        }
    }

    /// Whether a call currently occupies the client
    pub fn is_busy(&self) -> bool {
        match &self.active {
            ActiveCall::Idle => false,
            ActiveCall::Private(s) => s.is_live(),
            ActiveCall::Group(g) => g.is_live(),
        }
    }

    /// Inspect current state
    pub fn snapshot(&self) -> CallSnapshot {
        match &self.active {
            ActiveCall::Idle => CallSnapshot::Idle,
            ActiveCall::Private(s) => CallSnapshot::Private {
                call_id: s.id(),
                state: s.state(),
                direction: s.intent().direction,
                partner: s.partner_name().to_string(),
                partner_id: s.partner_id().cloned(),
                transport: s.transport().map(TransportSnapshot::from),
                muted: s.local_media().is_some_and(LocalMedia::is_muted),
            },
            ActiveCall::Group(g) => {
                let mut transports: Vec<TransportSnapshot> =
                    g.transports().map(TransportSnapshot::from).collect();
                transports.sort_by(|a, b| a.peer.cmp(&b.peer));
                CallSnapshot::Group {
                    state: g.state(),
                    is_initiator: g.is_initiator(),
                    initiator: g.initiator().map(|p| p.id.clone()),
                    participants: g.participants().map(|p| p.id.clone()).collect(),
                    transports,
                    connected: g.connected_count(),
                    muted: g.local_media().is_some_and(LocalMedia::is_muted),
                }
            }
        }
    }

    fn ensure_free(&mut self, what: &str) -> Result<(), CallError> {
        if self.is_busy() {
            return Err(CallError::ProtocolViolation(format!(
                "cannot {what} while another call is in progress"
            )));
        }
        if let ActiveCall::Group(g) = &mut self.active {
            g.decline(&self.ctx);
        }
        self.active = ActiveCall::Idle;
        Ok(())
    }

    fn settle(&mut self) {
        let finished = match &self.active {
            ActiveCall::Idle => false,
            ActiveCall::Private(s) => s.state() == CallState::Idle,
            ActiveCall::Group(g) => g.state() == GroupCallState::Idle,
        };
        if finished {
            self.active = ActiveCall::Idle;
        }
    }

    fn schedule_group_clear(&mut self) {
        self.group_epoch += 1;
        self.ctx.schedule(
            self.ctx.config().status_grace(),
            EngineEvent::GroupGrace {
                epoch: self.group_epoch,
            },
        );
    }

    /// Call a room member by display name
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` while another call is in progress,
    /// `MediaUnavailable` if capture fails
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local().id))]
    pub async fn start_private_call(&mut self, partner_name: &str) -> Result<CallId, CallError> {
        self.ensure_free("start a private call")?;
        let session = CallSession::initiate(&self.ctx, partner_name).await?;
        let id = session.id();
        self.active = ActiveCall::Private(session);
        Ok(id)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without a ringing call, `MediaUnavailable` if
    /// capture fails
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local().id))]
    pub async fn accept_call(&mut self) -> Result<CallId, CallError> {
        match &mut self.active {
            ActiveCall::Private(s) if s.state() == CallState::Ringing => {
                s.accept(&self.ctx).await?;
                Ok(s.id())
            }
            _ => Err(CallError::InvalidState("no incoming call".to_string())),
        }
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without a ringing call
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local().id))]
    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        let res = match &mut self.active {
            ActiveCall::Private(s) if s.state() == CallState::Ringing => s.reject(&self.ctx).await,
            _ => Err(CallError::InvalidState("no incoming call".to_string())),
        };
        self.settle();
        res
    }

    /// Hang up whatever call is in progress; a no-op without one
    ///
    /// # Errors
    ///
    /// Propagates session errors
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local().id))]
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        if matches!(self.active, ActiveCall::Group(_)) {
            self.leave_group_call().await?;
        } else if let ActiveCall::Private(s) = &mut self.active {
            s.end(&self.ctx).await?;
        }
        self.settle();
        Ok(())
    }

    /// Start a group call
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` while another call is in progress,
    /// `MediaUnavailable` if capture fails
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local().id))]
    pub async fn start_group_call(&mut self) -> Result<(), CallError> {
        self.ensure_free("start a group call")?;
        let mut group = GroupCallCoordinator::new();
        group.start(&self.ctx).await?;
        self.active = ActiveCall::Group(group);
        Ok(())
    }

    /// Join the announced group call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without a pending invitation,
    /// `MediaUnavailable` if capture fails
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local().id))]
    pub async fn join_group_call(&mut self) -> Result<(), CallError> {
        let res = match &mut self.active {
            ActiveCall::Group(g) if g.state() == GroupCallState::AwaitingDecision => {
                g.join(&self.ctx).await
            }
            _ => Err(CallError::InvalidState(
                "no group call invitation".to_string(),
            )),
        };
        self.settle();
        res
    }

    /// Dismiss the group call invitation
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without a pending invitation
    pub fn decline_group_call(&mut self) -> Result<(), CallError> {
        let declined = match &mut self.active {
            ActiveCall::Group(g) => g.decline(&self.ctx),
            _ => false,
        };
        self.settle();
        if declined {
            Ok(())
        } else {
            Err(CallError::InvalidState(
                "no group call invitation".to_string(),
            ))
        }
    }

    /// Leave the group call; a no-op when not in one
    ///
    /// Returns `true` if this call left.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` during a private call
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local().id))]
    pub async fn leave_group_call(&mut self) -> Result<bool, CallError> {
        let left = match &mut self.active {
            ActiveCall::Group(g) => {
                let was_live = g.is_live();
                let left = g.leave(&self.ctx).await;
                left && was_live
            }
            ActiveCall::Idle => false,
            ActiveCall::Private(_) => {
                return Err(CallError::InvalidState("not in a group call".to_string()))
            }
        };
        if left {
            self.schedule_group_clear();
        }
        self.settle();
        Ok(left)
    }

    /// Flip local audio mute; returns the new state
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without local media
    pub fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let media = match &self.active {
            ActiveCall::Private(s) if s.is_live() => s.local_media(),
            ActiveCall::Group(g) if g.is_live() => g.local_media(),
            _ => None,
        }
        .ok_or_else(|| CallError::InvalidState("no local media to mute".to_string()))?;

        let muted = !media.is_muted();
        media.set_muted(muted)?;
        tracing::debug!(muted, "Local audio mute toggled");
        self.ctx.emit(CallEvent::MuteChanged { muted });
        Ok(muted)
    }

    /// Route one relay message
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for malformed messages and messages that
    /// match no session; these are logged and otherwise ignored
    #[tracing::instrument(skip(self, signal), fields(local = %self.ctx.local().id, message_type = signal.message_type()))]
    pub async fn handle_signal(&mut self, signal: InboundSignal) -> Result<(), CallError> {
        if let Err(e) = signal.validate() {
            tracing::warn!(error = %e, "Dropping invalid signaling message");
            return Err(CallError::ProtocolViolation(e.to_string()));
        }

        let res = self.dispatch(signal).await;
        self.settle();
        if let Err(e) = &res {
            match e {
                CallError::ProtocolViolation(_) => {
                    tracing::warn!(error = %e, "Ignoring signaling message");
                }
                _ => tracing::debug!(error = %e, "Signaling message handling failed"),
            }
        }
        res
    }

    async fn dispatch(&mut self, signal: InboundSignal) -> Result<(), CallError> {
        let ctx = &self.ctx;
        match signal {
            InboundSignal::IncomingCall {
                caller_id,
                caller_name,
            } => {
                if self.is_busy() {
                    tracing::info!(caller = %caller_id, "Busy, rejecting incoming call");
                    return ctx
                        .send(OutboundSignal::CallReject { peer_id: caller_id })
                        .await;
                }
                self.ensure_free("ring")?;
                let session =
                    CallSession::incoming(&self.ctx, Participant::new(caller_id, caller_name));
                self.active = ActiveCall::Private(session);
                Ok(())
            }
            InboundSignal::CallAccept { peer_id, name } => match &mut self.active {
                ActiveCall::Private(s)
                    if s.state() == CallState::Requesting && s.partner_name() == name =>
                {
                    s.handle_accepted(ctx, peer_id, &name).await
                }
                _ => {
                    let _ = ctx
                        .send(OutboundSignal::CallEnded {
                            peer_id: peer_id.clone(),
                        })
                        .await;
                    Err(CallError::ProtocolViolation(format!(
                        "call-accept from {name} ({peer_id}) matches no outgoing call"
                    )))
                }
            },
            InboundSignal::CallReject { peer_id, name } => match &mut self.active {
                ActiveCall::Private(s) => s.handle_remote_rejected(ctx, &peer_id, &name).await,
                _ => Err(CallError::ProtocolViolation(format!(
                    "call-reject from {peer_id} matches no outgoing call"
                ))),
            },
            InboundSignal::CallEnded { peer_id } => match &mut self.active {
                ActiveCall::Private(s) => s.handle_remote_ended(ctx, &peer_id).await,
                ActiveCall::Group(g) => {
                    let ended = g
                        .handle_peer_ended(ctx, &peer_id, EndReason::RemoteHangup)
                        .await;
                    if matches!(ended, Ok(true)) {
                        self.schedule_group_clear();
                    }
                    ended.map(|_| ())
                }
                ActiveCall::Idle => Err(CallError::ProtocolViolation(format!(
                    "call-ended from {peer_id} without a call"
                ))),
            },
            InboundSignal::GroupCallAvailable {
                initiator_id,
                initiator_name,
            } => {
                if ctx.local().is(&initiator_id) {
                    tracing::trace!("Ignoring own group call announcement");
                    return Ok(());
                }
                if self.is_busy() {
                    tracing::debug!(initiator = %initiator_id, "Busy, ignoring group call announcement");
                    return Ok(());
                }
                self.ensure_free("receive an invitation")?;
                let mut group = GroupCallCoordinator::new();
                if group.handle_available(&self.ctx, Participant::new(initiator_id, initiator_name)) {
                    self.active = ActiveCall::Group(group);
                }
                Ok(())
            }
            InboundSignal::ParticipantJoined { peer_id, name } => match &mut self.active {
                ActiveCall::Group(g) => {
                    g.handle_participant_joined(ctx, Participant::new(peer_id, name))
                        .await
                }
                _ => Err(CallError::ProtocolViolation(format!(
                    "participant-joined for {peer_id} outside a group call"
                ))),
            },
            InboundSignal::SdpOffer {
                description,
                sender_id,
            } => match &mut self.active {
                ActiveCall::Private(s) => s.handle_remote_offer(ctx, &sender_id, description).await,
                ActiveCall::Group(g) => g.handle_remote_offer(ctx, &sender_id, description).await,
                ActiveCall::Idle => Err(CallError::ProtocolViolation(format!(
                    "sdp-offer from {sender_id} without a call"
                ))),
            },
            InboundSignal::SdpAnswer {
                description,
                sender_id,
            } => match &mut self.active {
                ActiveCall::Private(s) => {
                    s.handle_remote_answer(ctx, &sender_id, description).await
                }
                ActiveCall::Group(g) => g.handle_remote_answer(ctx, &sender_id, description).await,
                ActiveCall::Idle => Err(CallError::ProtocolViolation(format!(
                    "sdp-answer from {sender_id} without a call"
                ))),
            },
            InboundSignal::IceCandidate {
                candidate,
                sender_id,
            } => match &mut self.active {
                ActiveCall::Private(s) => s.handle_remote_candidate(&sender_id, candidate).await,
                ActiveCall::Group(g) => g.handle_remote_candidate(&sender_id, candidate).await,
                ActiveCall::Idle => Err(CallError::ProtocolViolation(format!(
                    "ice-candidate from {sender_id} without a call"
                ))),
            },
            InboundSignal::PeerUnreachable { target } => {
                let group_over = match &mut self.active {
                    ActiveCall::Private(s) => {
                        s.handle_unreachable(ctx, &target).await;
                        false
                    }
                    ActiveCall::Group(g) => g.handle_unreachable(ctx, &target).await,
                    ActiveCall::Idle => {
                        tracing::debug!(target_peer = %target, "Peer unreachable outside a call");
                        false
                    }
                };
                if group_over {
                    self.schedule_group_clear();
                }
                Ok(())
            }
        }
    }

    /// Route one engine event (link callback, timer, grace delay)
    pub async fn handle_engine_event(&mut self, event: EngineEvent) {
        let ctx = &self.ctx;
        match event {
            EngineEvent::Link {
                transport,
                peer,
                event,
            } => match &mut self.active {
                ActiveCall::Private(s) => s.handle_link_event(ctx, transport, event).await,
                ActiveCall::Group(g) => g.handle_link_event(ctx, transport, &peer, event).await,
                ActiveCall::Idle => {
                    tracing::trace!(peer = %peer, "Link event without a call ignored");
                }
            },
            EngineEvent::Timer {
                transport,
                peer,
                kind,
                seq,
            } => match &mut self.active {
                ActiveCall::Private(s) => s.handle_timer(ctx, transport, kind, seq).await,
                ActiveCall::Group(g) => g.handle_timer(ctx, transport, &peer, kind, seq).await,
                ActiveCall::Idle => {}
            },
            EngineEvent::CallGrace { call_id } => {
                let expired = matches!(
                    &self.active,
                    ActiveCall::Private(s) if s.id() == call_id && s.state().is_terminal()
                );
                if expired {
                    tracing::debug!(call_id = %call_id, "Call cleared after grace delay");
                    self.active = ActiveCall::Idle;
                    self.ctx.status(CallStatus::Cleared);
                }
            }
            EngineEvent::PeerGrace { transport, peer } => {
                let group_over = match &mut self.active {
                    ActiveCall::Group(g) => g.handle_peer_grace(ctx, transport, &peer).await,
                    _ => false,
                };
                if group_over {
                    self.schedule_group_clear();
                }
            }
            EngineEvent::GroupGrace { epoch } => {
                if epoch == self.group_epoch && matches!(self.active, ActiveCall::Idle) {
                    self.ctx.status(CallStatus::Cleared);
                }
            }
        }
        self.settle();
    }

    /// End any call in progress
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.end_call().await {
            tracing::warn!(error = %e, "Error ending call during shutdown");
        }
        self.active = ActiveCall::Idle;
    }
}

//! In-process signaling relay
//!
//! [`LocalRelay`] plays the part of the chat server's message bus: it knows
//! every connected client by session id and display name, resolves
//! addressing, rewrites `targetId` into `senderId`, and fans group
//! announcements out to the room. It does not interpret call state.

use crate::identity::{Participant, SessionId};
use crate::signaling::{InboundSignal, OutboundSignal, SignalingChannel, SignalingError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Client {
    participant: Participant,
    tx: mpsc::UnboundedSender<InboundSignal>,
}

#[derive(Debug, Default)]
struct RelayState {
    clients: HashMap<SessionId, Client>,
    /// Group rosters keyed by initiator, in join order
    groups: HashMap<SessionId, Vec<SessionId>>,
    delivered: u64,
}

impl RelayState {
    fn deliver(&mut self, to: &SessionId, signal: InboundSignal) -> bool {
        match self.clients.get(to) {
            Some(client) => {
                if client.tx.send(signal).is_ok() {
                    self.delivered += 1;
                    true
                } else {
                    tracing::debug!(client = %to, "Client receiver dropped");
                    false
                }
            }
            None => false,
        }
    }

    fn deliver_or_bounce(&mut self, from: &SessionId, to: &SessionId, signal: InboundSignal) {
        if !self.deliver(to, signal) {
            tracing::debug!(from = %from, to = %to, "Target not connected");
            self.deliver(
                from,
                InboundSignal::PeerUnreachable {
                    target: to.to_string(),
                },
            );
        }
    }
}

/// Shared relay; clone to hand out
#[derive(Debug, Clone, Default)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LocalRelay {
    /// Create an empty room
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; returns its outbound channel and inbound stream
    pub fn connect(
        &self,
        participant: Participant,
    ) -> (RelayEndpoint, mpsc::UnboundedReceiver<InboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = participant.id.clone();
        tracing::debug!(client = %participant, "Client connected to relay");
        self.state
            .lock()
            .clients
            .insert(id.clone(), Client { participant, tx });
        (
            RelayEndpoint {
                relay: self.clone(),
                sender: id,
            },
            rx,
        )
    }

    /// Remove a client and its roster entries
    pub fn disconnect(&self, id: &SessionId) {
        let mut state = self.state.lock();
        state.clients.remove(id);
        state.groups.remove(id);
        for roster in state.groups.values_mut() {
            roster.retain(|m| m != id);
        }
        tracing::debug!(client = %id, "Client disconnected from relay");
    }

    /// Roster of the group started by `initiator`, initiator first
    pub fn group_members(&self, initiator: &SessionId) -> Vec<SessionId> {
        self.state
            .lock()
            .groups
            .get(initiator)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages delivered so far
    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    fn route(&self, from: &SessionId, signal: OutboundSignal) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        let sender = state
            .clients
            .get(from)
            .map(|c| c.participant.clone())
            .ok_or(SignalingError::ChannelClosed)?;

        tracing::trace!(from = %from, message_type = signal.message_type(), "Relaying");

        match signal {
            OutboundSignal::CallRequest { target_name } => {
                let target = state
                    .clients
                    .values()
                    .find(|c| c.participant.display_name == target_name && &c.participant.id != from)
                    .map(|c| c.participant.id.clone());
                match target {
                    Some(to) => {
                        state.deliver(
                            &to,
                            InboundSignal::IncomingCall {
                                caller_id: sender.id,
                                caller_name: sender.display_name,
                            },
                        );
                    }
                    None => {
                        state.deliver(from, InboundSignal::PeerUnreachable { target: target_name });
                    }
                }
            }
            OutboundSignal::CallAccept { peer_id } => {
                state.deliver_or_bounce(
                    from,
                    &peer_id,
                    InboundSignal::CallAccept {
                        peer_id: from.clone(),
                        name: sender.display_name,
                    },
                );
            }
            OutboundSignal::CallReject { peer_id } => {
                state.deliver_or_bounce(
                    from,
                    &peer_id,
                    InboundSignal::CallReject {
                        peer_id: from.clone(),
                        name: sender.display_name,
                    },
                );
            }
            OutboundSignal::CallEnded { peer_id } => {
                state.deliver_or_bounce(from, &peer_id, InboundSignal::CallEnded { peer_id: from.clone() });
            }
            OutboundSignal::GroupCallStart => {
                state.groups.insert(from.clone(), vec![from.clone()]);
                let everyone: Vec<SessionId> = state.clients.keys().cloned().collect();
                for to in everyone {
                    state.deliver(
                        &to,
                        InboundSignal::GroupCallAvailable {
                            initiator_id: sender.id.clone(),
                            initiator_name: sender.display_name.clone(),
                        },
                    );
                }
            }
            OutboundSignal::GroupCallJoin { initiator_id } => {
                let Some(roster) = state.groups.get_mut(&initiator_id) else {
                    state.deliver(
                        from,
                        InboundSignal::PeerUnreachable {
                            target: initiator_id.to_string(),
                        },
                    );
                    return Ok(());
                };
                let existing: Vec<SessionId> =
                    roster.iter().filter(|m| *m != from).cloned().collect();
                if !roster.contains(from) {
                    roster.push(from.clone());
                }
                for to in existing {
                    state.deliver(
                        &to,
                        InboundSignal::ParticipantJoined {
                            peer_id: sender.id.clone(),
                            name: sender.display_name.clone(),
                        },
                    );
                }
            }
            OutboundSignal::GroupCallLeave { initiator_id } => {
                if &initiator_id == from {
                    state.groups.remove(&initiator_id);
                } else if let Some(roster) = state.groups.get_mut(&initiator_id) {
                    roster.retain(|m| m != from);
                }
            }
            OutboundSignal::SdpOffer {
                description,
                target_id,
            } => {
                state.deliver_or_bounce(
                    from,
                    &target_id,
                    InboundSignal::SdpOffer {
                        description,
                        sender_id: from.clone(),
                    },
                );
            }
            OutboundSignal::SdpAnswer {
                description,
                target_id,
            } => {
                state.deliver_or_bounce(
                    from,
                    &target_id,
                    InboundSignal::SdpAnswer {
                        description,
                        sender_id: from.clone(),
                    },
                );
            }
            OutboundSignal::IceCandidate {
                candidate,
                target_id,
            } => {
                state.deliver_or_bounce(
                    from,
                    &target_id,
                    InboundSignal::IceCandidate {
                        candidate,
                        sender_id: from.clone(),
                    },
                );
            }
        }
        Ok(())
    }
}

/// One client's connection to a [`LocalRelay`]
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    relay: LocalRelay,
    sender: SessionId,
}

impl RelayEndpoint {
    /// Session id the relay knows this client by
    pub fn session_id(&self) -> &SessionId {
        &self.sender
    }
}

#[async_trait]
impl SignalingChannel for RelayEndpoint {
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.relay.route(&self.sender, signal)
    }
}

/// Channel that only records what was sent
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<OutboundSignal>>>,
}

impl RecordingChannel {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().clone()
    }

    /// Number of sent messages of the given wire type
    pub fn count(&self, message_type: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message_type() == message_type)
            .count()
    }

    /// Forget recorded messages
    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        self.sent.lock().push(signal);
        Ok(())
    }
}

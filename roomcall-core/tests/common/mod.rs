//! Shared fixtures: a room of clients wired through an in-process relay and
//! loopback media network

#![allow(dead_code)]

use roomcall_core::prelude::*;
use roomcall_core::{CallConfig, MediaConstraints};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tracing_subscriber::EnvFilter;

/// How long a test waits for an expected event
pub const WAIT: Duration = Duration::from_secs(10);

pub struct Room {
    pub relay: LocalRelay,
    pub network: LoopbackNetwork,
    pub config: CallConfig,
}

pub struct Client {
    pub participant: Participant,
    pub service: CallService,
    pub events: Receiver<CallEvent>,
    pub devices: LoopbackDevices,
}

/// Route engine logs to the test harness; `RUST_LOG=roomcall_core=debug`
/// shows every transition
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Room {
    pub fn new() -> Self {
        Self::with_config(CallConfig {
            ice_servers: Vec::new(),
            media: MediaConstraints::audio_only(),
            ..CallConfig::default()
        })
    }

    pub fn with_config(config: CallConfig) -> Self {
        init_tracing();
        Self {
            relay: LocalRelay::new(),
            network: LoopbackNetwork::new(),
            config,
        }
    }

    /// Connect a client named `name` with session id `<name>-1`
    pub fn join(&self, name: &str) -> Client {
        self.join_with_config(name, self.config.clone())
    }

    pub fn join_with_config(&self, name: &str, config: CallConfig) -> Client {
        let participant = Participant::new(format!("{name}-1"), name);
        let (endpoint, inbound) = self.relay.connect(participant.clone());
        let devices = LoopbackDevices::new();
        let service = CallService::builder(participant.clone())
            .with_config(config)
            .with_signaling(Arc::new(endpoint), inbound)
            .with_devices(Arc::new(devices.clone()))
            .with_engine(Arc::new(self.network.engine(participant.id.clone())))
            .build()
            .unwrap();
        let events = service.subscribe_events();
        Client {
            participant,
            service,
            events,
            devices,
        }
    }
}

impl Client {
    pub fn id(&self) -> &SessionId {
        &self.participant.id
    }

    /// Wait for the first event matching `pred`, skipping the rest
    pub async fn wait_for(&mut self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
        self.wait_for_within(WAIT, pred).await
    }

    pub async fn wait_for_within(
        &mut self,
        limit: Duration,
        pred: impl Fn(&CallEvent) -> bool,
    ) -> CallEvent {
        let events = &mut self.events;
        let name = self.participant.display_name.clone();
        tokio::time::timeout(limit, async move {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => unreachable!("{name}: event stream closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| unreachable!("{}: expected event not seen", self.participant.display_name))
    }

    pub async fn wait_status(&mut self, status: CallStatus) {
        self.wait_for(|e| matches!(e, CallEvent::Status(s) if *s == status))
            .await;
    }

    /// Poll the controller until its snapshot satisfies `pred`
    pub async fn wait_snapshot(&self, pred: impl Fn(&CallSnapshot) -> bool) -> CallSnapshot {
        tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = self.service.snapshot().await.unwrap();
                if pred(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| unreachable!("{}: snapshot never matched", self.participant.display_name))
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        self.service.snapshot().await.unwrap()
    }
}

pub fn private_state(snapshot: &CallSnapshot) -> Option<CallState> {
    match snapshot {
        CallSnapshot::Private { state, .. } => Some(*state),
        _ => None,
    }
}

pub fn group_connected(snapshot: &CallSnapshot) -> Option<usize> {
    match snapshot {
        CallSnapshot::Group { connected, .. } => Some(*connected),
        _ => None,
    }
}

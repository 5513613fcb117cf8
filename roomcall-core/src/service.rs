//! Call service orchestration
//!
//! [`CallService`] runs a [`CallController`] on a single task. UI commands,
//! relay messages and engine events (link callbacks, timers, grace delays)
//! are all consumed by that task one at a time, so no two transitions of a
//! call ever run concurrently and session state needs no locks.

use crate::call::CallError;
use crate::config::CallConfig;
use crate::controller::{CallContext, CallController, CallSnapshot};
use crate::identity::Participant;
use crate::media::MediaDevices;
use crate::signaling::{InboundSignal, SignalingChannel, SignalingHandler};
use crate::transport::{EngineEvent, MediaEngine};
use crate::types::{CallEvent, CallId};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

const COMMAND_CAPACITY: usize = 64;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    StartPrivate { name: String, reply: Reply<CallId> },
    Accept { reply: Reply<CallId> },
    Reject { reply: Reply<()> },
    End { reply: Reply<()> },
    StartGroup { reply: Reply<()> },
    JoinGroup { reply: Reply<()> },
    DeclineGroup { reply: Reply<()> },
    LeaveGroup { reply: Reply<bool> },
    ToggleMute { reply: Reply<bool> },
    Snapshot { reply: oneshot::Sender<CallSnapshot> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to a running call engine
#[derive(Clone)]
pub struct CallService {
    local: Participant,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl CallService {
    /// Start building a service for `local`
    pub fn builder(local: Participant) -> CallServiceBuilder {
        CallServiceBuilder::new(local)
    }

    /// This client
    pub fn local(&self) -> &Participant {
        &self.local
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::ServiceStopped)?;
        rx.await.map_err(|_| CallError::ServiceStopped)?
    }

    /// Call a room member by display name
    ///
    /// # Errors
    ///
    /// See [`CallController::start_private_call`]
    pub async fn start_private_call(&self, name: &str) -> Result<CallId, CallError> {
        let name = name.to_string();
        self.request(|reply| Command::StartPrivate { name, reply })
            .await
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// See [`CallController::accept_call`]
    pub async fn accept_call(&self) -> Result<CallId, CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// See [`CallController::reject_call`]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// See [`CallController::end_call`]
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Start a group call
    ///
    /// # Errors
    ///
    /// See [`CallController::start_group_call`]
    pub async fn start_group_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StartGroup { reply }).await
    }

    /// Join the announced group call
    ///
    /// # Errors
    ///
    /// See [`CallController::join_group_call`]
    pub async fn join_group_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::JoinGroup { reply }).await
    }

    /// Dismiss the group call invitation
    ///
    /// # Errors
    ///
    /// See [`CallController::decline_group_call`]
    pub async fn decline_group_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::DeclineGroup { reply }).await
    }

    /// Leave the group call
    ///
    /// # Errors
    ///
    /// See [`CallController::leave_group_call`]
    pub async fn leave_group_call(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::LeaveGroup { reply }).await
    }

    /// Flip local audio mute
    ///
    /// # Errors
    ///
    /// See [`CallController::toggle_mute`]
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Inspect the controller
    ///
    /// # Errors
    ///
    /// Returns `ServiceStopped` if the service task is gone
    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply: tx })
            .await
            .map_err(|_| CallError::ServiceStopped)?;
        rx.await.map_err(|_| CallError::ServiceStopped)
    }

    /// End any call and stop the service task
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Builder for [`CallService`]
pub struct CallServiceBuilder {
    local: Participant,
    config: CallConfig,
    signaling: Option<(Arc<dyn SignalingChannel>, mpsc::UnboundedReceiver<InboundSignal>)>,
    devices: Option<Arc<dyn MediaDevices>>,
    engine: Option<Arc<dyn MediaEngine>>,
}

impl CallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(local: Participant) -> Self {
        Self {
            local,
            config: CallConfig::default(),
            signaling: None,
            devices: None,
            engine: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the relay connection: outbound channel plus inbound message stream
    #[must_use]
    pub fn with_signaling(
        mut self,
        channel: Arc<dyn SignalingChannel>,
        inbound: mpsc::UnboundedReceiver<InboundSignal>,
    ) -> Self {
        self.signaling = Some((channel, inbound));
        self
    }

    /// Set the capture devices
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the media transport engine
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Build and spawn the service task; must run inside a tokio runtime
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing
    pub fn build(self) -> Result<CallService, ServiceError> {
        let (channel, inbound) = self
            .signaling
            .ok_or_else(|| ServiceError::InitError("signaling channel not set".to_string()))?;
        let devices = self
            .devices
            .ok_or_else(|| ServiceError::InitError("media devices not set".to_string()))?;
        let engine = self
            .engine
            .ok_or_else(|| ServiceError::InitError("media engine not set".to_string()))?;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let ctx = CallContext::new(
            self.local.clone(),
            SignalingHandler::new(channel),
            devices,
            engine,
            self.config,
            engine_tx,
        );
        let events = ctx.events();
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        tracing::info!(local = %self.local, "Call service started");
        tokio::spawn(run(
            CallController::new(ctx),
            command_rx,
            inbound,
            engine_rx,
        ));

        Ok(CallService {
            local: self.local,
            commands,
            events,
        })
    }
}

async fn run(
    mut controller: CallController,
    mut commands: mpsc::Receiver<Command>,
    mut inbound: mpsc::UnboundedReceiver<InboundSignal>,
    mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
) {
    let mut relay_open = true;
    let mut shutdown_reply = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    shutdown_reply = Some(reply);
                    break;
                }
                Some(command) => handle_command(&mut controller, command).await,
                None => break,
            },
            signal = inbound.recv(), if relay_open => match signal {
                Some(signal) => {
                    // Failures are logged by the controller and never stop the loop.
                    let _ = controller.handle_signal(signal).await;
                }
                None => {
                    tracing::warn!("Signaling relay closed");
                    relay_open = false;
                }
            },
            Some(event) = engine_rx.recv() => controller.handle_engine_event(event).await,
        }
    }

    controller.shutdown().await;
    tracing::info!(local = %controller.context().local(), "Call service stopped");
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

async fn handle_command(controller: &mut CallController, command: Command) {
    match command {
        Command::StartPrivate { name, reply } => {
            let _ = reply.send(controller.start_private_call(&name).await);
        }
        Command::Accept { reply } => {
            let _ = reply.send(controller.accept_call().await);
        }
        Command::Reject { reply } => {
            let _ = reply.send(controller.reject_call().await);
        }
        Command::End { reply } => {
            let _ = reply.send(controller.end_call().await);
        }
        Command::StartGroup { reply } => {
            let _ = reply.send(controller.start_group_call().await);
        }
        Command::JoinGroup { reply } => {
            let _ = reply.send(controller.join_group_call().await);
        }
        Command::DeclineGroup { reply } => {
            let _ = reply.send(controller.decline_group_call());
        }
        Command::LeaveGroup { reply } => {
            let _ = reply.send(controller.leave_group_call().await);
        }
        Command::ToggleMute { reply } => {
            let _ = reply.send(controller.toggle_mute());
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(controller.snapshot());
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

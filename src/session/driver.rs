//! Async event loop that owns a [`SessionController`].
//!
//! Commands from the presentation layer and events from devices and the
//! transport are handled one at a time, so the controller itself never needs
//! a lock.

use crate::audio::device::AudioBackend;
use crate::config::Config;
use crate::error::{Result, VoxliveError};
use crate::session::controller::SessionController;
use crate::session::state::{Language, SessionId, SessionState, SessionStatus};
use crate::session::{EventReceiver, event_channel};
use crate::transport::TransportConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Requests accepted by the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Stop,
    SetLanguage(Language),
    /// Stop, close both device contexts and exit the loop.
    Shutdown,
}

/// Cloneable front end to a running [`SessionRunner`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn start(&self) -> Result<()> {
        self.send(SessionCommand::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(SessionCommand::Stop)
    }

    pub fn set_language(&self, language: Language) -> Result<()> {
        self.send(SessionCommand::SetLanguage(language))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown)
    }

    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VoxliveError::Other("session loop has exited".to_string()))
    }
}

/// Owns the controller and multiplexes its inputs.
pub struct SessionRunner {
    controller: SessionController,
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    connect_timeout: Option<Duration>,
    connect_deadline: Option<(SessionId, Instant)>,
}

impl SessionRunner {
    pub fn new(
        config: Config,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn TransportConnector>,
    ) -> (Self, SessionHandle) {
        let (event_tx, event_rx) = event_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connect_timeout = config.transport.connect_timeout_ms.map(Duration::from_millis);
        let controller = SessionController::new(config, backend, connector, event_tx);
        let handle = SessionHandle {
            commands: command_tx,
            status: controller.subscribe(),
        };
        let runner = Self {
            controller,
            events: event_rx,
            commands: command_rx,
            connect_timeout,
            connect_deadline: None,
        };
        (runner, handle)
    }

    /// Runs until `Shutdown` arrives or every handle is dropped.
    pub async fn run(mut self) {
        loop {
            let deadline = self.connect_deadline.map(|(_, at)| at);
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("all session handles dropped");
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = self.events.recv() => self.controller.handle_event(event),
                _ = sleep_until(deadline) => {
                    if let (Some((session, _)), Some(waited)) =
                        (self.connect_deadline.take(), self.connect_timeout)
                    {
                        warn!(%session, "connect timed out");
                        self.controller.on_connect_timeout(session, waited);
                    }
                }
            }

            if self.controller.state() != SessionState::Connecting {
                self.connect_deadline = None;
            }
        }
        self.controller.shutdown().await;
        info!("session loop exited");
    }

    /// Returns false when the loop should exit.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        debug!(?command, "session command");
        match command {
            SessionCommand::Start => match self.controller.start().await {
                Ok(session) => {
                    self.connect_deadline = self
                        .connect_timeout
                        .map(|timeout| (session, Instant::now() + timeout));
                }
                Err(e) => warn!("Session start failed: {}", e),
            },
            SessionCommand::Stop => self.controller.stop(),
            SessionCommand::SetLanguage(language) => {
                if let Err(e) = self.controller.set_language(language) {
                    warn!("{}", e);
                }
            }
            SessionCommand::Shutdown => return false,
        }
        true
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

//! Bidirectional stream to the remote speech model.
//!
//! A connector opens the stream and reports open/message/close/error as
//! [`TransportEvent`]s on the session event channel. The returned handle is
//! the send side: fire-and-forget, with an idempotent close.

#[cfg(feature = "live-transport")]
pub mod live;
pub mod protocol;

pub use protocol::{LiveSetup, ServerMessage};

use crate::audio::codec::MediaBlob;
use crate::error::{Result, VoxliveError};
use crate::session::{EventSender, SessionEvent, SessionId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Callback surface of the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(ServerMessage),
    Close,
    Error(String),
}

/// Send side of an open stream.
pub trait TransportHandle: Send {
    /// Queues one audio frame. Never waits on the network.
    fn send_realtime_input(&mut self, blob: &MediaBlob) -> Result<()>;

    /// Closes the stream. Calling it again, or after the remote side
    /// already closed, does nothing.
    fn close(&mut self);
}

/// Opens streams. Events for the new stream are tagged with `session`.
pub trait TransportConnector: Send + Sync {
    fn connect(
        &self,
        setup: LiveSetup,
        session: SessionId,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>>;
}

/// Posts a transport event, ignoring a session loop that already exited.
pub fn post(events: &EventSender, session: SessionId, event: TransportEvent) {
    if events.send(SessionEvent::Transport { session, event }).is_err() {
        debug!(%session, "session loop gone, transport event dropped");
    }
}

#[derive(Default)]
struct MockTransportState {
    connects: usize,
    closes: usize,
    setups: Vec<LiveSetup>,
    sent: Vec<MediaBlob>,
    current: Option<(SessionId, EventSender)>,
}

/// Records what the session did to the transport and lets tests inject events.
#[derive(Default)]
pub struct MockTransportProbe {
    state: Mutex<MockTransportState>,
}

impl MockTransportProbe {
    fn lock(&self) -> MutexGuard<'_, MockTransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn last_setup(&self) -> Option<LiveSetup> {
        self.lock().setups.last().cloned()
    }

    pub fn sent(&self) -> Vec<MediaBlob> {
        self.lock().sent.clone()
    }

    /// Delivers an event as if the most recent stream produced it.
    /// Returns false when nothing ever connected.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let current = self.lock().current.clone();
        match current {
            Some((session, events)) => {
                post(&events, session, event);
                true
            }
            None => false,
        }
    }
}

/// In-memory transport for tests and offline runs.
#[derive(Clone, Default)]
pub struct MockTransportConnector {
    probe: Arc<MockTransportProbe>,
    auto_open: bool,
    fail_connect: bool,
    fail_send: bool,
}

impl MockTransportConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `Open` immediately after connecting.
    pub fn with_auto_open(mut self) -> Self {
        self.auto_open = true;
        self
    }

    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Every send fails, as when the socket is already closing.
    pub fn with_send_failure(mut self) -> Self {
        self.fail_send = true;
        self
    }

    pub fn probe(&self) -> Arc<MockTransportProbe> {
        Arc::clone(&self.probe)
    }
}

impl TransportConnector for MockTransportConnector {
    fn connect(
        &self,
        setup: LiveSetup,
        session: SessionId,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>> {
        if self.fail_connect {
            return Err(VoxliveError::Transport {
                message: "mock connect failure".to_string(),
            });
        }
        {
            let mut state = self.probe.lock();
            state.connects += 1;
            state.setups.push(setup);
            state.current = Some((session, events.clone()));
        }
        if self.auto_open {
            post(&events, session, TransportEvent::Open);
        }
        Ok(Box::new(MockTransportHandle {
            probe: Arc::clone(&self.probe),
            fail_send: self.fail_send,
            closed: false,
        }))
    }
}

struct MockTransportHandle {
    probe: Arc<MockTransportProbe>,
    fail_send: bool,
    closed: bool,
}

impl TransportHandle for MockTransportHandle {
    fn send_realtime_input(&mut self, blob: &MediaBlob) -> Result<()> {
        if self.closed {
            return Err(VoxliveError::TransportClosed);
        }
        if self.fail_send {
            return Err(VoxliveError::Transport {
                message: "mock send failure".to_string(),
            });
        }
        self.probe.lock().sent.push(blob.clone());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.probe.lock().closes += 1;
        }
    }
}

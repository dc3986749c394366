//! The real-time session engine.
//!
//! Device callbacks and transport callbacks never touch session state
//! directly: they post a [`SessionEvent`] onto one channel, and the
//! controller handles events one at a time on the session task.

pub mod capture;
pub mod controller;
pub mod driver;
pub mod playback;
pub mod state;

pub use controller::SessionController;
pub use driver::{SessionCommand, SessionHandle, SessionRunner};
pub use playback::{PlaybackScheduler, ScheduledChunk};
pub use state::{Language, SessionId, SessionState, SessionStatus};

use crate::audio::device::BufferId;
use crate::transport::TransportEvent;
use tokio::sync::mpsc;

/// Everything that can happen to a session from the outside.
#[derive(Debug)]
pub enum SessionEvent {
    Transport {
        session: SessionId,
        event: TransportEvent,
    },
    /// One fixed-size microphone frame at the capture rate.
    CaptureFrame {
        session: SessionId,
        samples: Vec<f32>,
    },
    /// A playback buffer finished on its own.
    PlaybackEnded { buffer: BufferId },
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

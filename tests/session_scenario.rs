//! End-to-end session scenarios against the in-memory audio and transport.
//!
//! Events are pumped by hand so every step is deterministic.

use std::sync::Arc;
use voxlive::audio::codec::encode;
use voxlive::audio::device::{MockAudioBackend, MockAudioProbe};
use voxlive::config::Config;
use voxlive::defaults::FRAME_SIZE;
use voxlive::session::{EventReceiver, event_channel};
use voxlive::transport::protocol::ServerMessage;
use voxlive::transport::{MockTransportConnector, MockTransportProbe, TransportEvent};
use voxlive::{SessionController, SessionState};

struct Scenario {
    controller: SessionController,
    events: EventReceiver,
    audio: Arc<MockAudioProbe>,
    transport: Arc<MockTransportProbe>,
}

impl Scenario {
    fn new() -> Self {
        let mut config = Config::default();
        config.transport.api_key = Some("scenario-key".to_string());

        let backend = MockAudioBackend::new();
        let connector = MockTransportConnector::new();
        let (tx, rx) = event_channel();
        Self {
            audio: backend.probe(),
            transport: connector.probe(),
            controller: SessionController::new(config, Arc::new(backend), Arc::new(connector), tx),
            events: rx,
        }
    }

    fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.controller.handle_event(event);
        }
    }

    fn emit(&mut self, event: TransportEvent) {
        assert!(self.transport.emit(event));
        self.pump();
    }

    fn speak(&mut self, amplitude: f32) {
        assert!(self.audio.feed_microphone(&vec![amplitude; FRAME_SIZE]));
        self.pump();
    }
}

/// 100ms of a quiet tone at the playback rate, base64 PCM16.
fn reply_chunk() -> String {
    let samples: Vec<f32> = (0..2400).map(|i| ((i as f32) * 0.05).sin() * 0.2).collect();
    encode(&samples, 24000).data
}

#[tokio::test]
async fn full_conversation_turn() {
    let mut s = Scenario::new();

    s.controller.start().await.unwrap();
    assert_eq!(s.controller.state(), SessionState::Connecting);
    let setup = s.transport.last_setup().unwrap();
    assert!(setup.system_instruction.contains("Telugu"));

    s.emit(TransportEvent::Open);
    assert_eq!(s.controller.state(), SessionState::Connected);
    assert!(s.audio.processor_connected());

    // Silence is streamed but does not mark the user as speaking.
    s.speak(0.0);
    assert!(!s.controller.status().user_speaking);
    assert_eq!(s.transport.sent().len(), 1);
    assert_eq!(s.transport.sent()[0].mime_type, "audio/pcm;rate=16000");

    // A chunk too short to play is dropped without touching the session.
    s.emit(TransportEvent::Message(ServerMessage::audio(&["AAA="])));
    assert_eq!(s.controller.state(), SessionState::Connected);
    assert!(!s.controller.status().assistant_speaking);
    assert!(s.audio.scheduled().is_empty());

    let chunk = reply_chunk();
    s.emit(TransportEvent::Message(ServerMessage::audio(&[&chunk, &chunk])));
    assert!(s.controller.status().assistant_speaking);
    let scheduled = s.audio.scheduled();
    assert_eq!(scheduled.len(), 2);
    assert!((scheduled[1].start - (scheduled[0].start + scheduled[0].duration)).abs() < 1e-9);

    // Natural completion of both chunks ends the assistant's turn.
    for buffer in &scheduled {
        s.audio.finish_buffer(buffer.id);
    }
    s.pump();
    assert!(!s.controller.status().assistant_speaking);
    assert!(s.controller.playback().is_empty());

    s.controller.stop();
    assert_eq!(s.controller.state(), SessionState::Idle);
    assert!(s.controller.playback().is_empty());
    assert_eq!(s.audio.live_tracks(), 0);
    assert_eq!(s.transport.closes(), 1);
}

#[tokio::test]
async fn user_talking_over_the_reply_cuts_it_off() {
    let mut s = Scenario::new();
    s.controller.start().await.unwrap();
    s.emit(TransportEvent::Open);

    let chunk = reply_chunk();
    s.emit(TransportEvent::Message(ServerMessage::audio(&[&chunk, &chunk, &chunk])));
    assert_eq!(s.controller.playback().queued().len(), 3);

    // Loud enough for speech but below the barge-in bar: playback continues.
    s.speak(0.01);
    assert!(s.controller.status().user_speaking);
    assert_eq!(s.controller.playback().queued().len(), 3);

    s.speak(0.3);
    assert!(!s.controller.status().assistant_speaking);
    assert!(s.controller.playback().is_empty());
    assert_eq!(s.audio.stopped().len(), 3);
    assert_eq!(s.controller.state(), SessionState::Connected);

    // The server's own interruption notice arrives afterwards and is a no-op.
    s.emit(TransportEvent::Message(ServerMessage::interruption()));
    assert_eq!(s.controller.playback().flush_count(), 1);

    s.controller.stop();
}

#[tokio::test]
async fn server_close_returns_to_idle() {
    let mut s = Scenario::new();
    s.controller.start().await.unwrap();
    s.emit(TransportEvent::Open);

    s.emit(TransportEvent::Close);
    assert_eq!(s.controller.state(), SessionState::Idle);
    assert_eq!(s.audio.live_tracks(), 0);
    assert!(!s.audio.feed_microphone(&vec![0.5; FRAME_SIZE]));

    // A fresh session can start on the same devices.
    s.controller.start().await.unwrap();
    s.emit(TransportEvent::Open);
    assert_eq!(s.controller.state(), SessionState::Connected);
    assert_eq!(s.audio.output_contexts_created(), 1);
    s.controller.stop();
}

#[tokio::test]
async fn stop_before_start_is_a_no_op() {
    let mut s = Scenario::new();
    s.controller.stop();
    s.controller.stop();

    assert_eq!(s.controller.state(), SessionState::Idle);
    assert_eq!(s.transport.closes(), 0);
    assert_eq!(s.audio.microphones_opened(), 0);
    assert!(s.controller.status().error.is_none());
}

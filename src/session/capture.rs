//! Microphone side of the session: frame in, VAD, barge-in, encode, send.

use crate::audio::codec;
use crate::audio::device::{Microphone, OutputContext};
use crate::audio::frame::FrameProcessor;
use crate::audio::vad::{VadConfig, VadDecision, VoiceActivityDetector};
use crate::error::Result;
use crate::session::playback::PlaybackScheduler;
use crate::session::{EventSender, SessionEvent, SessionId};
use crate::transport::TransportHandle;
use tracing::{debug, info};

/// What one frame did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameOutcome {
    pub decision: VadDecision,
    /// Playback was flushed by this frame.
    pub barged_in: bool,
    /// The encoded frame was accepted by the transport.
    pub sent: bool,
}

/// Owns the microphone stream for one session.
pub struct CapturePipeline {
    vad: VoiceActivityDetector,
    frame_size: usize,
    capture_rate: u32,
    microphone: Option<Box<dyn Microphone>>,
    wired: bool,
    user_speaking: bool,
    frames_sent: u64,
    send_failures: u64,
}

impl CapturePipeline {
    pub fn new(vad: VadConfig, frame_size: usize, capture_rate: u32) -> Self {
        Self {
            vad: VoiceActivityDetector::new(vad),
            frame_size,
            capture_rate,
            microphone: None,
            wired: false,
            user_speaking: false,
            frames_sent: 0,
            send_failures: 0,
        }
    }

    /// Takes ownership of an opened microphone. Frames do not flow until [`wire`](Self::wire).
    pub fn attach(&mut self, microphone: Box<dyn Microphone>) {
        debug!(label = microphone.label(), "microphone attached");
        self.microphone = Some(microphone);
    }

    /// Binds a frame processor that posts every full frame to the session loop.
    pub fn wire(&mut self, session: SessionId, events: EventSender) -> Result<()> {
        let Some(microphone) = self.microphone.as_mut() else {
            debug!(%session, "no microphone to wire");
            return Ok(());
        };
        let processor = FrameProcessor::new(
            self.frame_size,
            Box::new(move |samples| {
                if events
                    .send(SessionEvent::CaptureFrame { session, samples })
                    .is_err()
                {
                    debug!(%session, "session loop gone, capture frame dropped");
                }
            }),
        )?;
        microphone.connect(processor)?;
        self.wired = true;
        info!(
            %session,
            frame_size = self.frame_size,
            rate = self.capture_rate,
            "capture wired"
        );
        Ok(())
    }

    /// Handles one captured frame.
    ///
    /// A barge-in flushes playback before this returns. Send failures are
    /// counted and dropped; capture keeps running until teardown.
    pub fn process_frame(
        &mut self,
        frame: &[f32],
        playback: &mut PlaybackScheduler,
        output: &mut dyn OutputContext,
        transport: Option<&mut Box<dyn TransportHandle>>,
    ) -> FrameOutcome {
        let decision = self.vad.classify(frame, playback.assistant_speaking());
        self.user_speaking = decision.is_user_speaking;

        let barged_in = decision.is_barge_in;
        if barged_in {
            info!(rms = decision.rms, "barge-in, flushing playback");
            playback.flush(output);
        }

        let sent = match transport {
            Some(transport) => {
                let blob = codec::encode(frame, self.capture_rate);
                match transport.send_realtime_input(&blob) {
                    Ok(()) => {
                        self.frames_sent += 1;
                        true
                    }
                    Err(e) => {
                        self.send_failures += 1;
                        debug!("capture frame not sent: {}", e);
                        false
                    }
                }
            }
            None => false,
        };

        FrameOutcome {
            decision,
            barged_in,
            sent,
        }
    }

    /// Disconnects the processor and stops every track. Safe to repeat and
    /// safe before anything was attached.
    pub fn teardown(&mut self) {
        if let Some(mut microphone) = self.microphone.take() {
            microphone.disconnect();
            microphone.stop();
            debug!(label = microphone.label(), "microphone released");
        }
        self.wired = false;
        self.user_speaking = false;
        self.vad.reset();
    }

    pub fn is_attached(&self) -> bool {
        self.microphone.is_some()
    }

    pub fn is_wired(&self) -> bool {
        self.wired
    }

    pub fn user_speaking(&self) -> bool {
        self.user_speaking
    }

    pub fn live_tracks(&self) -> usize {
        self.microphone.as_ref().map_or(0, |mic| mic.live_tracks())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }
}

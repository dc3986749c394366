//! Websocket transport to the live speech API.
//!
//! `connect` returns immediately; the handshake, the `setup` exchange and all
//! socket I/O run on a spawned task. The session learns the outcome through
//! `Open` / `Close` / `Error` events.

use crate::audio::codec::MediaBlob;
use crate::config::Config;
use crate::error::{Result, VoxliveError};
use crate::session::{EventSender, SessionId};
use crate::transport::protocol::{ClientMessage, LiveSetup, ServerMessage};
use crate::transport::{TransportConnector, TransportEvent, TransportHandle, post};
use futures_util::{SinkExt, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

enum Outbound {
    Frame(String),
    Close,
}

/// How the socket loop ended.
enum Ended {
    /// We asked to close; the session already moved on.
    Local,
    Remote,
}

fn transport_error(context: &str, e: impl Display) -> VoxliveError {
    VoxliveError::Transport {
        message: format!("{}: {}", context, e),
    }
}

/// Opens live sessions against one endpoint with one API key.
pub struct LiveConnector {
    endpoint: String,
    api_key: String,
}

impl LiveConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    /// Fails with `ConfigMissing` when no API key is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let key = config.require_api_key()?;
        Ok(Self::new(config.transport.endpoint.clone(), key))
    }

    fn url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

impl TransportConnector for LiveConnector {
    fn connect(
        &self,
        setup: LiveSetup,
        session: SessionId,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| transport_error("no async runtime for the transport", e))?;
        let setup_json = setup
            .to_message()
            .to_json()
            .map_err(|e| transport_error("encoding setup", e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let url = self.url();
        info!(%session, model = %setup.model, voice = %setup.voice, "connecting to live endpoint");
        runtime.spawn(async move {
            match run_socket(url, setup_json, session, &events, rx).await {
                Ok(Ended::Local) => debug!(%session, "socket closed locally"),
                Ok(Ended::Remote) => post(&events, session, TransportEvent::Close),
                Err(e) => post(&events, session, TransportEvent::Error(e.to_string())),
            }
        });

        Ok(Box::new(LiveHandle { outbound: Some(tx) }))
    }
}

async fn run_socket(
    url: String,
    setup_json: String,
    session: SessionId,
    events: &EventSender,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Result<Ended> {
    let (socket, _response) = connect_async(url)
        .await
        .map_err(|e| transport_error("websocket handshake failed", e))?;
    let (mut sink, mut stream) = socket.split();

    sink.send(Message::Text(setup_json.into()))
        .await
        .map_err(|e| transport_error("sending setup", e))?;

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Frame(json)) => {
                    sink.send(Message::Text(json.into()))
                        .await
                        .map_err(|e| transport_error("sending audio", e))?;
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(%session, "close frame not sent: {}", e);
                    }
                    return Ok(Ended::Local);
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => dispatch(text.as_str(), session, events),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatch(text, session, events),
                    Err(_) => debug!(%session, len = bytes.len(), "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    match frame {
                        Some(frame) => warn!(%session, code = %frame.code, reason = %frame.reason, "server closed the stream"),
                        None => info!(%session, "server closed the stream"),
                    }
                    return Ok(Ended::Remote);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(transport_error("websocket error", e)),
                None => return Ok(Ended::Remote),
            },
        }
    }
}

fn dispatch(text: &str, session: SessionId, events: &EventSender) {
    let message = match ServerMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(%session, "unparseable server message: {}", e);
            return;
        }
    };
    if message.is_setup_complete() {
        post(events, session, TransportEvent::Open);
    } else if message.server_content.is_some() {
        post(events, session, TransportEvent::Message(message));
    }
}

/// Send side of a live socket.
struct LiveHandle {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl TransportHandle for LiveHandle {
    fn send_realtime_input(&mut self, blob: &MediaBlob) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(VoxliveError::TransportClosed)?;
        let json = ClientMessage::realtime_audio(blob)
            .to_json()
            .map_err(|e| transport_error("encoding audio", e))?;
        outbound
            .send(Outbound::Frame(json))
            .map_err(|_| VoxliveError::TransportClosed)
    }

    fn close(&mut self) {
        if let Some(outbound) = self.outbound.take()
            && outbound.send(Outbound::Close).is_err()
        {
            debug!("socket task already finished");
        }
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::event_channel;

    #[test]
    fn url_carries_key() {
        let connector = LiveConnector::new("wss://example.test/ws", "k123");
        assert_eq!(connector.url(), "wss://example.test/ws?key=k123");

        let connector = LiveConnector::new("wss://example.test/ws?alt=1", "k");
        assert_eq!(connector.url(), "wss://example.test/ws?alt=1&key=k");
    }

    #[test]
    fn from_config_requires_key() {
        assert!(matches!(
            LiveConnector::from_config(&Config::default()),
            Err(VoxliveError::ConfigMissing { .. })
        ));
    }

    #[test]
    fn dispatch_maps_setup_complete_and_content() {
        let (tx, mut rx) = event_channel();
        dispatch(r#"{"setupComplete":{}}"#, SessionId(1), &tx);
        dispatch(r#"{"serverContent":{"interrupted":true}}"#, SessionId(1), &tx);
        dispatch("not json", SessionId(1), &tx);
        dispatch(r#"{"usageMetadata":{}}"#, SessionId(1), &tx);

        let mut seen = Vec::new();
        while let Ok(crate::session::SessionEvent::Transport { event, .. }) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], TransportEvent::Open);
        assert!(matches!(&seen[1], TransportEvent::Message(m) if m.interrupted()));
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_error() {
        let connector = LiveConnector::new("ws://127.0.0.1:9", "k");
        let (tx, mut rx) = event_channel();
        let setup = LiveSetup {
            model: "m".to_string(),
            voice: "Kore".to_string(),
            system_instruction: String::new(),
        };
        let _handle = connector.connect(setup, SessionId(4), tx).unwrap();

        match rx.recv().await {
            Some(crate::session::SessionEvent::Transport { session, event }) => {
                assert_eq!(session, SessionId(4));
                assert!(matches!(event, TransportEvent::Error(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn closed_handle_rejects_sends() {
        let mut handle = LiveHandle { outbound: None };
        let blob = MediaBlob {
            data: String::new(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        assert!(matches!(
            handle.send_realtime_input(&blob),
            Err(VoxliveError::TransportClosed)
        ));
        handle.close();
    }
}

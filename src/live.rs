//! Live-frame detection over a duplex text channel.
//!
//! Each inbound message carries one encoded frame as `{"image": "..."}`
//! (bare base64 or a data URI). Frames are handled one at a time per
//! connection. A frame that fails is answered with an error event and the
//! session keeps reading; binary messages get the same treatment.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tungstenite::{Message, WebSocket};

use crate::detect::{Detection, DetectorHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::imaging::{decode_base64_payload, decode_image};
use crate::single::detect_once;

/// One data message from the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Payload is not inspected; frames must arrive as JSON text.
    Binary,
}

/// Text transport for a live session.
pub trait FrameChannel {
    /// Next data message, `Ok(None)` once the peer has closed.
    fn recv(&mut self) -> PipelineResult<Option<Inbound>>;

    fn send_text(&mut self, text: String) -> PipelineResult<()>;
}

#[derive(Debug, Deserialize)]
struct FrameRequest {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FrameEvent {
    Detected {
        success: bool,
        person_count: usize,
        persons: Vec<Detection>,
        annotated_image: String,
        inference_time_ms: f64,
    },
    Failed {
        success: bool,
        error: String,
    },
}

impl FrameEvent {
    fn failed(error: &PipelineError) -> Self {
        FrameEvent::Failed {
            success: false,
            error: error.to_string(),
        }
    }
}

pub struct LiveSession {
    detector: DetectorHandle,
}

impl LiveSession {
    pub fn new(detector: DetectorHandle) -> Self {
        Self { detector }
    }

    /// Serve `channel` until the peer closes. Returns the number of frames
    /// answered.
    ///
    /// Only transport errors end the session early.
    pub fn run<C: FrameChannel>(&self, channel: &mut C) -> PipelineResult<u64> {
        let mut answered = 0;
        while let Some(message) = channel.recv()? {
            let handled = match message {
                Inbound::Text(text) => self.handle_frame(&text),
                Inbound::Binary => Err(PipelineError::Decode(
                    "binary frames are not supported; send {\"image\": <base64>} as text".into(),
                )),
            };
            let event = match handled {
                Ok(event) => event,
                Err(err) => {
                    log::warn!("live frame {} rejected: {}", answered, err);
                    FrameEvent::failed(&err)
                }
            };
            let body = serde_json::to_string(&event)
                .map_err(|e| PipelineError::Write(format!("encode live event: {e}")))?;
            channel.send_text(body)?;
            answered += 1;
        }
        log::debug!("live session closed after {} frames", answered);
        Ok(answered)
    }

    fn handle_frame(&self, text: &str) -> PipelineResult<FrameEvent> {
        let request: FrameRequest = serde_json::from_str(text)
            .map_err(|e| PipelineError::Decode(format!("invalid frame message: {e}")))?;
        let bytes = decode_base64_payload(&request.image)?;
        let image = decode_image(&bytes)?;
        let detection = detect_once(&self.detector, &image, true)?;
        let report = detection.to_report()?;
        Ok(FrameEvent::Detected {
            success: true,
            person_count: report.person_count,
            persons: report.persons,
            annotated_image: report.annotated_image.unwrap_or_default(),
            inference_time_ms: report.inference_time_ms,
        })
    }
}

impl<S: Read + Write> FrameChannel for WebSocket<S> {
    fn recv(&mut self) -> PipelineResult<Option<Inbound>> {
        loop {
            match self.read() {
                Ok(Message::Text(text)) => return Ok(Some(Inbound::Text(text))),
                Ok(Message::Binary(_)) => return Ok(Some(Inbound::Binary)),
                Ok(Message::Close(_)) => return Ok(None),
                // Pings are answered by tungstenite on the next read/write.
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None)
                }
                Err(tungstenite::Error::Io(err)) => return Err(PipelineError::Io(err)),
                Err(err) => return Err(PipelineError::Decode(format!("websocket: {err}"))),
            }
        }
    }

    fn send_text(&mut self, text: String) -> PipelineResult<()> {
        self.send(Message::Text(text))
            .map_err(|e| PipelineError::Write(format!("websocket: {e}")))
    }
}

//! Media stream wire protocol.
//!
//! The far end sends JSON text frames tagged by `event`: `connected`, `start`,
//! `media` and `stop`. Numeric fields such as `sequence_number`, `chunk` and
//! `timestamp` arrive either as JSON numbers or as decimal strings. Outbound
//! audio goes back as binary frames holding one frame of raw codec bytes; the
//! only outbound text frame is `{"event":"clear"}`, which asks the far end to
//! drop audio it has buffered but not yet played.

use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use voxline_types::{AudioCodec, MediaFormat};

/// Reasons an inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{event} event is missing {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },

    #[error("invalid base64 media payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unsupported media encoding: {0}")]
    UnsupportedCodec(String),

    #[error("unexpected binary frame ({0} bytes)")]
    UnexpectedBinary(usize),
}

/// The far end started streaming a call.
#[derive(Debug, Clone, PartialEq)]
pub struct StartEvent {
    pub stream_id: String,
    /// Call-control id; identifies the call in the registry.
    pub call_id: String,
    pub call_leg_id: Option<String>,
    pub format: MediaFormat,
}

/// One chunk of call audio.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub stream_id: Option<String>,
    pub track: Option<String>,
    pub chunk: Option<u64>,
    pub timestamp_ms: Option<u64>,
    pub payload: Vec<u8>,
}

impl MediaEvent {
    /// Audio spoken by the caller. Frames echoing our own outbound track are
    /// not caller speech.
    pub fn is_inbound(&self) -> bool {
        !matches!(self.track.as_deref(), Some("outbound"))
    }
}

/// The far end stopped streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct StopEvent {
    pub stream_id: Option<String>,
    pub call_id: Option<String>,
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected,
    Start(StartEvent),
    Media(MediaEvent),
    Stop(StopEvent),
    /// Any other event name; accepted and ignored.
    Other(String),
}

/// A number that may be encoded as a JSON number or a decimal string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flexible {
    Int(u64),
    Str(String),
}

impl Flexible {
    fn value(&self) -> Option<u64> {
        match self {
            Flexible::Int(n) => Some(*n),
            Flexible::Str(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    start: Option<RawStart>,
    #[serde(default)]
    media: Option<RawMedia>,
    #[serde(default)]
    stop: Option<RawStop>,
}

#[derive(Debug, Deserialize)]
struct RawStart {
    #[serde(default)]
    call_control_id: Option<String>,
    #[serde(default)]
    call_leg_id: Option<String>,
    #[serde(default)]
    media_format: Option<RawMediaFormat>,
}

#[derive(Debug, Deserialize)]
struct RawMediaFormat {
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    sample_rate: Option<Flexible>,
    #[serde(default)]
    channels: Option<Flexible>,
}

#[derive(Debug, Deserialize)]
struct RawMedia {
    #[serde(default)]
    track: Option<String>,
    #[serde(default)]
    chunk: Option<Flexible>,
    #[serde(default)]
    timestamp: Option<Flexible>,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStop {
    #[serde(default)]
    call_control_id: Option<String>,
}

/// Decodes one inbound text frame.
pub fn decode_text(text: &str) -> Result<InboundEvent, ProtocolError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    match raw.event.as_str() {
        "connected" => Ok(InboundEvent::Connected),
        "start" => decode_start(raw),
        "media" => decode_media(raw),
        "stop" => Ok(InboundEvent::Stop(StopEvent {
            stream_id: raw.stream_id,
            call_id: raw.stop.and_then(|s| s.call_control_id),
        })),
        _ => Ok(InboundEvent::Other(raw.event)),
    }
}

fn decode_start(raw: RawFrame) -> Result<InboundEvent, ProtocolError> {
    let stream_id = raw.stream_id.ok_or(ProtocolError::MissingField {
        event: "start",
        field: "stream_id",
    })?;
    let start = raw.start.ok_or(ProtocolError::MissingField {
        event: "start",
        field: "start",
    })?;
    let call_id = start
        .call_control_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(ProtocolError::MissingField {
            event: "start",
            field: "start.call_control_id",
        })?;

    let mut format = MediaFormat::default();
    if let Some(media_format) = start.media_format {
        if let Some(encoding) = media_format.encoding {
            format.codec = encoding
                .parse::<AudioCodec>()
                .map_err(|_| ProtocolError::UnsupportedCodec(encoding))?;
        }
        if let Some(rate) = media_format.sample_rate.as_ref().and_then(Flexible::value) {
            format.sample_rate = rate as u32;
        }
        if let Some(channels) = media_format.channels.as_ref().and_then(Flexible::value) {
            format.channels = channels as u16;
        }
    }
    if format.channels != 1 {
        return Err(ProtocolError::UnsupportedCodec(format!(
            "{} with {} channels",
            format.codec, format.channels
        )));
    }

    Ok(InboundEvent::Start(StartEvent {
        stream_id,
        call_id,
        call_leg_id: start.call_leg_id,
        format,
    }))
}

fn decode_media(raw: RawFrame) -> Result<InboundEvent, ProtocolError> {
    let media = raw.media.ok_or(ProtocolError::MissingField {
        event: "media",
        field: "media",
    })?;
    let payload = media.payload.ok_or(ProtocolError::MissingField {
        event: "media",
        field: "media.payload",
    })?;
    let payload = base64::engine::general_purpose::STANDARD.decode(payload.as_bytes())?;
    Ok(InboundEvent::Media(MediaEvent {
        stream_id: raw.stream_id,
        track: media.track,
        chunk: media.chunk.as_ref().and_then(Flexible::value),
        timestamp_ms: media.timestamp.as_ref().and_then(Flexible::value),
        payload,
    }))
}

/// Text frame telling the far end to flush buffered playback.
pub fn clear_frame() -> String {
    serde_json::json!({ "event": "clear" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_start_with_string_numbers() {
        let event = decode_text(
            r#"{"event":"start","sequence_number":"1","stream_id":"S1",
                "start":{"call_control_id":"C1","call_leg_id":"L1",
                         "media_format":{"encoding":"PCMA","sample_rate":"16000","channels":1}}}"#,
        )
        .unwrap();
        let InboundEvent::Start(start) = event else {
            panic!("expected start, got {:?}", event);
        };
        assert_eq!(start.call_id, "C1");
        assert_eq!(start.stream_id, "S1");
        assert_eq!(start.call_leg_id.as_deref(), Some("L1"));
        assert_eq!(start.format.codec, AudioCodec::Pcma);
        assert_eq!(start.format.sample_rate, 16000);
    }

    #[test]
    fn start_without_media_format_defaults_to_pcmu() {
        let event =
            decode_text(r#"{"event":"start","stream_id":"S","start":{"call_control_id":"C"}}"#)
                .unwrap();
        let InboundEvent::Start(start) = event else {
            panic!("expected start");
        };
        assert_eq!(start.format, MediaFormat::default());
    }

    #[test]
    fn start_without_call_id_is_rejected() {
        let err = decode_text(r#"{"event":"start","stream_id":"S","start":{}}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingField {
                field: "start.call_control_id",
                ..
            }
        ));
    }

    #[test]
    fn unsupported_encoding_is_rejected() {
        let err = decode_text(
            r#"{"event":"start","stream_id":"S","start":{"call_control_id":"C",
                "media_format":{"encoding":"OPUS","sample_rate":48000,"channels":1}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedCodec(ref c) if c == "OPUS"));
    }

    #[test]
    fn decodes_media_payload_and_counters() {
        let event = decode_text(
            r#"{"event":"media","stream_id":"S","media":{"track":"inbound","chunk":"2","timestamp":40,"payload":"AAEC"}}"#,
        )
        .unwrap();
        let InboundEvent::Media(media) = event else {
            panic!("expected media");
        };
        assert_eq!(media.payload, vec![0, 1, 2]);
        assert_eq!(media.chunk, Some(2));
        assert_eq!(media.timestamp_ms, Some(40));
        assert!(media.is_inbound());
    }

    #[test]
    fn outbound_track_is_not_caller_audio() {
        let event = decode_text(
            r#"{"event":"media","media":{"track":"outbound","payload":""}}"#,
        )
        .unwrap();
        let InboundEvent::Media(media) = event else {
            panic!("expected media");
        };
        assert!(!media.is_inbound());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(decode_text("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            decode_text(r#"{"event":"media","media":{"payload":"***"}}"#),
            Err(ProtocolError::Base64(_))
        ));
    }

    #[test]
    fn unknown_events_are_tolerated() {
        assert_eq!(
            decode_text(r#"{"event":"connected","version":"1.0.0"}"#).unwrap(),
            InboundEvent::Connected
        );
        assert_eq!(
            decode_text(r#"{"event":"dtmf","dtmf":{"digit":"1"}}"#).unwrap(),
            InboundEvent::Other("dtmf".to_string())
        );
    }

    #[test]
    fn stop_carries_call_id() {
        let event =
            decode_text(r#"{"event":"stop","stream_id":"S","stop":{"call_control_id":"C"}}"#)
                .unwrap();
        assert_eq!(
            event,
            InboundEvent::Stop(StopEvent {
                stream_id: Some("S".to_string()),
                call_id: Some("C".to_string()),
            })
        );
    }
}

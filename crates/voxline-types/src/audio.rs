//! Audio frame and media format definitions.
//!
//! A call negotiates one `MediaFormat` in its `start` event; every frame in
//! either direction of that call is encoded in that format.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported telephony codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioCodec {
    /// G.711 mu-law, 8 bits per sample.
    #[default]
    #[serde(rename = "PCMU")]
    Pcmu,
    /// G.711 A-law, 8 bits per sample.
    #[serde(rename = "PCMA")]
    Pcma,
    /// Linear 16-bit PCM, little endian.
    #[serde(rename = "L16")]
    L16,
}

impl AudioCodec {
    /// Encoded bytes per mono sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Pcmu | Self::Pcma => 1,
            Self::L16 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
            Self::L16 => "L16",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown codec name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCodec(pub String);

impl fmt::Display for UnknownCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported codec: {}", self.0)
    }
}

impl std::error::Error for UnknownCodec {}

impl FromStr for AudioCodec {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PCMU" | "ULAW" | "MULAW" => Ok(Self::Pcmu),
            "PCMA" | "ALAW" => Ok(Self::Pcma),
            "L16" | "PCM16" => Ok(Self::L16),
            _ => Err(UnknownCodec(s.to_string())),
        }
    }
}

/// Media format negotiated for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for MediaFormat {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Pcmu,
            sample_rate: 8000,
            channels: 1,
        }
    }
}

impl MediaFormat {
    /// Number of encoded bytes in one frame of the given duration.
    pub fn frame_len(&self, frame: Duration) -> usize {
        let samples = (u128::from(self.sample_rate) * frame.as_millis() / 1000) as usize;
        samples * self.codec.bytes_per_sample() * usize::from(self.channels.max(1))
    }

    /// Playback duration of `len` encoded bytes.
    pub fn duration_of(&self, len: usize) -> Duration {
        let bytes_per_second = u64::from(self.sample_rate)
            * self.codec.bytes_per_sample() as u64
            * u64::from(self.channels.max(1));
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(len as u64 * 1_000_000 / bytes_per_second)
    }
}

/// One chunk of encoded audio travelling in a single direction of a call.
///
/// `sequence` is monotonic per direction per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub payload: Vec<u8>,
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub sequence: u64,
    /// Media timestamp in milliseconds as reported by the carrier, if any.
    pub timestamp_ms: Option<u64>,
}

impl AudioFrame {
    pub fn new(payload: Vec<u8>, format: MediaFormat, sequence: u64) -> Self {
        Self {
            payload,
            codec: format.codec,
            sample_rate: format.sample_rate,
            sequence,
            timestamp_ms: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

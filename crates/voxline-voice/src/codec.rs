//! G.711 and linear PCM conversion helpers.
//!
//! Telephony audio arrives as mu-law, A-law or 16-bit linear PCM. Recognition
//! wants 16-bit WAV and the voice-activity check wants sample energy, so
//! everything is normalized through `i16` samples here.

use voxline_types::AudioCodec;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = i32::from((u >> 4) & 0x07);
    let mantissa = i32::from(u & 0x0F);
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut s = i32::from(sample);
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0x00
    };
    s = s.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (s & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let positive = a & 0x80 != 0;
    let exponent = i32::from((a & 0x70) >> 4);
    let mantissa = i32::from(a & 0x0F);
    let mut magnitude = (mantissa << 4) + 8;
    if exponent != 0 {
        magnitude = (magnitude + 0x100) << (exponent - 1);
    }
    if positive {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut s = i32::from(sample);
    let sign = if s >= 0 {
        0x80
    } else {
        s = -s;
        0x00
    };
    s = s.min(32767);

    let (exponent, mantissa) = if s >= 256 {
        let mut exponent = 7;
        let mut mask = 0x4000;
        while exponent > 1 && (s & mask) == 0 {
            exponent -= 1;
            mask >>= 1;
        }
        (exponent, (s >> (exponent + 3)) & 0x0F)
    } else {
        (0, (s >> 4) & 0x0F)
    };
    ((sign | (exponent << 4) | mantissa) as u8) ^ 0x55
}

/// Decodes encoded audio into linear samples. A trailing odd byte of L16 is ignored.
pub fn decode(payload: &[u8], codec: AudioCodec) -> Vec<i16> {
    match codec {
        AudioCodec::Pcmu => payload.iter().map(|&b| ulaw_to_linear(b)).collect(),
        AudioCodec::Pcma => payload.iter().map(|&b| alaw_to_linear(b)).collect(),
        AudioCodec::L16 => payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    }
}

pub fn encode(samples: &[i16], codec: AudioCodec) -> Vec<u8> {
    match codec {
        AudioCodec::Pcmu => samples.iter().map(|&s| linear_to_ulaw(s)).collect(),
        AudioCodec::Pcma => samples.iter().map(|&s| linear_to_alaw(s)).collect(),
        AudioCodec::L16 => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
    }
}

/// Encoded byte for digital silence in the given codec.
pub fn silence_byte(codec: AudioCodec) -> u8 {
    match codec {
        AudioCodec::Pcmu => 0xFF,
        AudioCodec::Pcma => 0xD5,
        AudioCodec::L16 => 0x00,
    }
}

/// Root-mean-square level of an encoded payload, normalized to `0.0..=1.0`.
pub fn rms(payload: &[u8], codec: AudioCodec) -> f32 {
    let samples = decode(payload, codec);
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    ((sum / samples.len() as f64).sqrt() / 32768.0) as f32
}

/// Wraps mono 16-bit samples in a WAV container for upload.
pub fn pcm16_to_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let byte_rate = sample_rate * 2;
    let mut wav = Vec::with_capacity(44 + data_len as usize);

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_bytes_decode_to_near_zero() {
        assert_eq!(ulaw_to_linear(silence_byte(AudioCodec::Pcmu)), 0);
        assert!(alaw_to_linear(silence_byte(AudioCodec::Pcma)).abs() <= 8);
        assert_eq!(rms(&[0xFF; 160], AudioCodec::Pcmu), 0.0);
    }

    #[test]
    fn companding_keeps_loud_samples_close() {
        for &sample in &[1000i16, -1000, 12000, -24000] {
            let via_ulaw = ulaw_to_linear(linear_to_ulaw(sample));
            let via_alaw = alaw_to_linear(linear_to_alaw(sample));
            let tolerance = (i32::from(sample).abs() / 16).max(16);
            assert!((i32::from(via_ulaw) - i32::from(sample)).abs() <= tolerance);
            assert!((i32::from(via_alaw) - i32::from(sample)).abs() <= tolerance);
        }
    }

    #[test]
    fn loud_ulaw_payload_has_high_rms() {
        // 0x00 is the largest negative mu-law code.
        assert!(rms(&[0x00; 160], AudioCodec::Pcmu) > 0.9);
    }

    #[test]
    fn l16_decode_ignores_trailing_byte() {
        let samples = decode(&[0x01, 0x00, 0xFF, 0x7F, 0x05], AudioCodec::L16);
        assert_eq!(samples, vec![1, i16::MAX]);
    }

    #[test]
    fn wav_header_describes_payload() {
        let wav = pcm16_to_wav(&[0, 1, 2, 3], 8000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 8000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 8);
        assert_eq!(wav.len(), 44 + 8);
    }
}

//! # Fragment Decoding
//!
//! Turns a transport-encoded audio fragment into normalized PCM.
//!
//! ## Audio Format:
//! - **Transport**: base64 text (standard alphabet) inside a JSON event
//! - **Samples**: 16-bit signed, little-endian, mono
//! - **Sample rate**: fixed per session (24kHz by default)
//!
//! A corrupt fragment produces a `DecodeError`; the caller drops that one
//! fragment and keeps going.

use crate::error::DecodeError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use byteorder::{ByteOrder, LittleEndian};

/// Decoded linear PCM, normalized to [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback duration in seconds (samples / sample rate).
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decoder for one session's fragments; all fragments share one sample rate.
#[derive(Debug, Clone)]
pub struct FragmentDecoder {
    sample_rate: u32,
}

impl FragmentDecoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode a base64 payload into normalized samples.
    ///
    /// Whitespace inside the payload (line-wrapped base64) is ignored.
    pub fn decode(&self, payload: &str) -> Result<PcmBuffer, DecodeError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }

        let bytes = if payload.contains(char::is_whitespace) {
            let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64.decode(compact)
        } else {
            BASE64.decode(payload)
        }
        .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;

        self.decode_pcm(&bytes)
    }

    /// Decode raw little-endian 16-bit PCM bytes.
    ///
    /// ## Conversion:
    /// Each sample is divided by 32768, so -32768 maps to exactly -1.0 and
    /// 32767 to just under 1.0.
    pub fn decode_pcm(&self, bytes: &[u8]) -> Result<PcmBuffer, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        if bytes.len() % 2 != 0 {
            return Err(DecodeError::OddLength(bytes.len()));
        }

        let mut pcm = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(bytes, &mut pcm);

        let samples = pcm.iter().map(|&s| s as f32 / 32768.0).collect();
        Ok(PcmBuffer::new(samples, self.sample_rate))
    }
}

/// Encode samples the way the remote sender does. Used by tests and the
/// synthetic-tone helpers.
pub fn encode_pcm16(samples: &[i16]) -> String {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_normalizes_samples() {
        let decoder = FragmentDecoder::new(24000);
        let payload = encode_pcm16(&[0, 16384, -16384, 32767, -32768]);
        let buffer = decoder.decode(&payload).unwrap();

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.samples()[0], 0.0);
        assert_eq!(buffer.samples()[1], 0.5);
        assert_eq!(buffer.samples()[2], -0.5);
        assert!(buffer.samples()[3] < 1.0 && buffer.samples()[3] > 0.999);
        assert_eq!(buffer.samples()[4], -1.0);
    }

    #[test]
    fn test_duration_follows_sample_rate() {
        let decoder = FragmentDecoder::new(24000);
        let payload = encode_pcm16(&vec![0i16; 2400]);
        let buffer = decoder.decode(&payload).unwrap();
        assert!((buffer.duration() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_wrapped_base64_is_accepted() {
        let decoder = FragmentDecoder::new(16000);
        let payload = encode_pcm16(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let (head, tail) = payload.split_at(payload.len() / 2);
        let wrapped = format!("{}\n  {}", head, tail);
        assert_eq!(decoder.decode(&wrapped).unwrap().len(), 8);
    }

    #[test]
    fn test_malformed_payloads() {
        let decoder = FragmentDecoder::new(24000);

        assert_eq!(decoder.decode(""), Err(DecodeError::EmptyPayload));
        assert!(matches!(
            decoder.decode("%%% not base64 %%%"),
            Err(DecodeError::InvalidEncoding(_))
        ));
        // three bytes cannot hold whole 16-bit samples
        let odd = BASE64.encode([1u8, 2, 3]);
        assert_eq!(decoder.decode(&odd), Err(DecodeError::OddLength(3)));
    }
}

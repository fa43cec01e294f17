//! Per-frame transcoding between the telephony leg (base64 μ-law, 8 kHz
//! mono) and whatever the realtime assistant was configured to speak.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

use super::g711::{decode_ulaw, encode_ulaw};
use super::resample::{downsample, upsample};
use crate::error::CallError;

pub const TELEPHONY_SAMPLE_RATE: u32 = 8_000;

/// Audio encodings understood by the realtime assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Same companding as the telephony leg; frames pass through untouched.
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    /// 16-bit little-endian linear PCM at 24 kHz.
    #[serde(rename = "pcm16")]
    Pcm16,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::G711Ulaw => "g711_ulaw",
            AudioFormat::Pcm16 => "pcm16",
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioFormat::G711Ulaw => TELEPHONY_SAMPLE_RATE,
            AudioFormat::Pcm16 => 24_000,
        }
    }

    fn rate_factor(&self) -> usize {
        (self.sample_rate() / TELEPHONY_SAMPLE_RATE) as usize
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "g711_ulaw" | "ulaw" | "mulaw" => Ok(AudioFormat::G711Ulaw),
            "pcm16" | "pcm" => Ok(AudioFormat::Pcm16),
            other => Err(CallError::InvalidConfiguration(format!(
                "unsupported audio format: {}",
                other
            ))),
        }
    }
}

/// A frame ready for the telephony socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelephonyFrame {
    /// base64 μ-law payload
    pub payload: String,
    /// 8 kHz samples carried, i.e. playback length in 1/8 ms
    pub samples: usize,
}

impl TelephonyFrame {
    pub fn duration_ms(&self) -> u64 {
        (self.samples as u64 * 1000) / TELEPHONY_SAMPLE_RATE as u64
    }
}

/// Stateless; a frame's output depends only on its own bytes.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    assistant: AudioFormat,
}

impl FrameCodec {
    pub fn new(assistant: AudioFormat) -> Self {
        Self { assistant }
    }

    /// μ-law bytes → assistant encoding bytes.
    pub fn caller_to_assistant_bytes(&self, ulaw: &[u8]) -> Result<Vec<u8>, CallError> {
        if ulaw.is_empty() {
            return Err(CallError::MalformedFrame("empty caller frame".into()));
        }
        match self.assistant {
            AudioFormat::G711Ulaw => Ok(ulaw.to_vec()),
            AudioFormat::Pcm16 => {
                let pcm = upsample(&decode_ulaw(ulaw), self.assistant.rate_factor());
                Ok(pcm.iter().flat_map(|s| s.to_le_bytes()).collect())
            }
        }
    }

    /// Assistant encoding bytes → μ-law bytes.
    pub fn assistant_to_caller_bytes(&self, data: &[u8]) -> Result<Vec<u8>, CallError> {
        if data.is_empty() {
            return Err(CallError::MalformedFrame("empty assistant frame".into()));
        }
        match self.assistant {
            AudioFormat::G711Ulaw => Ok(data.to_vec()),
            AudioFormat::Pcm16 => {
                if data.len() % 2 != 0 {
                    return Err(CallError::MalformedFrame(format!(
                        "pcm16 frame with odd length {}",
                        data.len()
                    )));
                }
                let pcm: Vec<i16> = data
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(encode_ulaw(&downsample(&pcm, self.assistant.rate_factor())))
            }
        }
    }

    /// Wire form: base64 in, base64 out.
    pub fn caller_to_assistant(&self, payload: &str) -> Result<String, CallError> {
        let ulaw = decode_payload(payload)?;
        Ok(B64.encode(self.caller_to_assistant_bytes(&ulaw)?))
    }

    pub fn assistant_to_caller(&self, payload: &str) -> Result<TelephonyFrame, CallError> {
        let data = decode_payload(payload)?;
        let ulaw = self.assistant_to_caller_bytes(&data)?;
        Ok(TelephonyFrame {
            samples: ulaw.len(),
            payload: B64.encode(ulaw),
        })
    }
}

fn decode_payload(payload: &str) -> Result<Vec<u8>, CallError> {
    B64.decode(payload.trim())
        .map_err(|e| CallError::MalformedFrame(format!("bad base64 payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::g711::{linear_to_ulaw, ulaw_to_linear};

    fn sine_ulaw(len: usize, freq: f32, amplitude: f32) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let t = i as f32 / TELEPHONY_SAMPLE_RATE as f32;
                let sample = (t * freq * 2.0 * std::f32::consts::PI).sin() * amplitude;
                linear_to_ulaw(sample as i16)
            })
            .collect()
    }

    #[test]
    fn ulaw_passthrough_is_byte_exact() {
        let codec = FrameCodec::new(AudioFormat::G711Ulaw);
        let frame = sine_ulaw(160, 440.0, 6000.0);
        let payload = B64.encode(&frame);

        let upstream = codec.caller_to_assistant(&payload).unwrap();
        assert_eq!(upstream, payload);
        let back = codec.assistant_to_caller(&upstream).unwrap();
        assert_eq!(back.payload, payload);
        assert_eq!(back.samples, 160);
        assert_eq!(back.duration_ms(), 20);
    }

    #[test]
    fn pcm16_round_trip_stays_within_codec_tolerance() {
        let codec = FrameCodec::new(AudioFormat::Pcm16);
        let frame = sine_ulaw(160, 200.0, 8000.0);

        let pcm = codec.caller_to_assistant_bytes(&frame).unwrap();
        assert_eq!(pcm.len(), 160 * 3 * 2);

        let back = codec.assistant_to_caller_bytes(&pcm).unwrap();
        assert_eq!(back.len(), frame.len());
        for (original, restored) in frame.iter().zip(back.iter()) {
            let a = ulaw_to_linear(*original) as i32;
            let b = ulaw_to_linear(*restored) as i32;
            // interpolation offset plus one requantisation step
            assert!((a - b).abs() <= 1024, "{} vs {}", a, b);
        }
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let pcm = FrameCodec::new(AudioFormat::Pcm16);
        assert!(matches!(
            pcm.caller_to_assistant("not base64!!"),
            Err(CallError::MalformedFrame(_))
        ));
        assert!(matches!(
            pcm.assistant_to_caller(&B64.encode([1u8, 2, 3])),
            Err(CallError::MalformedFrame(_))
        ));
        assert!(matches!(
            pcm.caller_to_assistant(""),
            Err(CallError::MalformedFrame(_))
        ));
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("g711_ulaw".parse::<AudioFormat>().unwrap(), AudioFormat::G711Ulaw);
        assert_eq!("PCM16".parse::<AudioFormat>().unwrap(), AudioFormat::Pcm16);
        assert!("opus".parse::<AudioFormat>().is_err());
        assert_eq!(
            serde_json::to_string(&AudioFormat::G711Ulaw).unwrap(),
            "\"g711_ulaw\""
        );
    }
}

//! audio - Frame transcoding for the media relay
//!
//! The telephony leg speaks base64 μ-law at 8 kHz. The realtime assistant is
//! configured for either the same μ-law stream or 24 kHz PCM16; this module
//! converts single frames between the two without carrying state.

mod frame_codec;
mod g711;
mod resample;

pub use frame_codec::{AudioFormat, FrameCodec, TelephonyFrame, TELEPHONY_SAMPLE_RATE};

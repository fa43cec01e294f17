//! Wire messages for both relay peers.
//!
//! Telephony side: Twilio-style media stream events, tagged by `event`.
//! Assistant side: OpenAI-style realtime events, tagged by `type`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;

// ==========================================
// 1. Telephony media stream
// ==========================================

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    Connected,
    Start {
        start: StreamStart,
    },
    Media {
        media: MediaChunk,
    },
    Stop,
    /// Echo of a mark we sent: everything queued before it has been played.
    Mark {
        mark: MarkLabel,
    },
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MarkLabel {
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    pub call_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyCommand {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Drops whatever assistant audio the provider still has queued.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    /// Asks the provider to echo `mark` once playback reaches this point.
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkLabel,
    },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutboundMedia {
    pub payload: String,
}

impl TelephonyCommand {
    pub fn media(stream_sid: &str, payload: String) -> Self {
        TelephonyCommand::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia { payload },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        TelephonyCommand::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }

    pub fn mark(stream_sid: &str, name: &str) -> Self {
        TelephonyCommand::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkLabel {
                name: name.to_string(),
            },
        }
    }
}

// ==========================================
// 2. Realtime assistant
// ==========================================

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.created")]
    ResponseCreated,
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta { item_id: String, delta: String },
    /// Server VAD heard the user start talking.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptCompleted { transcript: String },
    #[serde(rename = "error")]
    Error { error: RealtimeErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RealtimeErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum RealtimeCommand {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },
    #[serde(rename = "conversation.item.truncate")]
    Truncate {
        item_id: String,
        content_index: u32,
        audio_end_ms: u64,
    },
    #[serde(rename = "conversation.item.create")]
    CreateItem { item: ConversationItem },
    #[serde(rename = "response.create")]
    CreateResponse,
}

/// One-time configuration sent right after the assistant socket opens.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub turn_detection: TurnDetection,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub voice: String,
    pub instructions: String,
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputTranscription>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        Self {
            kind: "server_vad".to_string(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InputTranscription {
    pub model: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ItemContent>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ItemContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ConversationItem {
    pub fn system_note(text: &str) -> Self {
        Self {
            kind: "message".to_string(),
            role: "system".to_string(),
            content: vec![ItemContent {
                kind: "input_text".to_string(),
                text: text.to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn parses_telephony_lifecycle() {
        let connected = r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#;
        assert_eq!(
            serde_json::from_str::<TelephonyEvent>(connected).unwrap(),
            TelephonyEvent::Connected
        );

        let start = r#"{"event":"start","sequenceNumber":"1","streamSid":"MZ1",
            "start":{"accountSid":"AC1","streamSid":"MZ1","callSid":"CA1",
            "tracks":["inbound"],"customParameters":{"k":"v"},
            "mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}}}"#;
        match serde_json::from_str::<TelephonyEvent>(start).unwrap() {
            TelephonyEvent::Start { start } => {
                assert_eq!(start.stream_sid, "MZ1");
                assert_eq!(start.call_sid, "CA1");
                assert_eq!(start.custom_parameters.get("k").map(String::as_str), Some("v"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let media = r#"{"event":"media","streamSid":"MZ1","media":
            {"track":"inbound","chunk":"2","timestamp":"40","payload":"//8="}}"#;
        match serde_json::from_str::<TelephonyEvent>(media).unwrap() {
            TelephonyEvent::Media { media } => {
                assert_eq!(media.payload, "//8=");
                assert_eq!(media.timestamp.as_deref(), Some("40"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let stop = r#"{"event":"stop","streamSid":"MZ1","stop":{"callSid":"CA1"}}"#;
        assert_eq!(
            serde_json::from_str::<TelephonyEvent>(stop).unwrap(),
            TelephonyEvent::Stop
        );

        let mark = r#"{"event":"mark","sequenceNumber":"9","streamSid":"MZ1","mark":{"name":"x"}}"#;
        assert_eq!(
            serde_json::from_str::<TelephonyEvent>(mark).unwrap(),
            TelephonyEvent::Mark {
                mark: MarkLabel { name: "x".into() }
            }
        );

        let dtmf = r#"{"event":"dtmf","streamSid":"MZ1","dtmf":{"digit":"1"}}"#;
        assert_eq!(
            serde_json::from_str::<TelephonyEvent>(dtmf).unwrap(),
            TelephonyEvent::Other
        );
    }

    #[test]
    fn telephony_commands_carry_stream_sid() {
        let media: Value =
            serde_json::to_value(TelephonyCommand::media("MZ1", "AAAA".into())).unwrap();
        assert_eq!(
            media,
            json!({"event":"media","streamSid":"MZ1","media":{"payload":"AAAA"}})
        );
        let clear: Value = serde_json::to_value(TelephonyCommand::clear("MZ1")).unwrap();
        assert_eq!(clear, json!({"event":"clear","streamSid":"MZ1"}));
        let mark: Value = serde_json::to_value(TelephonyCommand::mark("MZ1", "bye")).unwrap();
        assert_eq!(
            mark,
            json!({"event":"mark","streamSid":"MZ1","mark":{"name":"bye"}})
        );
    }

    #[test]
    fn parses_realtime_events() {
        let delta = r#"{"type":"response.audio.delta","event_id":"e1","response_id":"r1",
            "item_id":"it1","output_index":0,"content_index":0,"delta":"AAAA"}"#;
        assert_eq!(
            serde_json::from_str::<RealtimeEvent>(delta).unwrap(),
            RealtimeEvent::AudioDelta {
                item_id: "it1".into(),
                delta: "AAAA".into()
            }
        );

        let started = r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":120,"item_id":"u1"}"#;
        assert_eq!(
            serde_json::from_str::<RealtimeEvent>(started).unwrap(),
            RealtimeEvent::SpeechStarted
        );

        let transcript = r#"{"type":"conversation.item.input_audio_transcription.completed",
            "item_id":"u1","content_index":0,"transcript":"Please hang up."}"#;
        assert_eq!(
            serde_json::from_str::<RealtimeEvent>(transcript).unwrap(),
            RealtimeEvent::TranscriptCompleted {
                transcript: "Please hang up.".into()
            }
        );

        let unknown = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        assert_eq!(
            serde_json::from_str::<RealtimeEvent>(unknown).unwrap(),
            RealtimeEvent::Other
        );
    }

    #[test]
    fn session_update_declares_formats_and_vad() {
        let update = RealtimeCommand::SessionUpdate {
            session: SessionConfig {
                turn_detection: TurnDetection::server_vad(),
                input_audio_format: AudioFormat::G711Ulaw,
                output_audio_format: AudioFormat::G711Ulaw,
                voice: "alloy".into(),
                instructions: "wake up".into(),
                modalities: vec!["text".into(), "audio".into()],
                input_audio_transcription: Some(InputTranscription {
                    model: "whisper-1".into(),
                }),
            },
        };
        let value: Value = serde_json::to_value(update).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["input_audio_format"], "g711_ulaw");
        assert_eq!(value["session"]["voice"], "alloy");
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "whisper-1");

        let create: Value = serde_json::to_value(RealtimeCommand::CreateResponse).unwrap();
        assert_eq!(create, json!({"type":"response.create"}));
    }
}

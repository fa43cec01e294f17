//! Media relay: bridges one telephony media stream to one realtime assistant
//! session for the lifetime of a call.
//!
//! The relay walks `Handshaking -> Streaming -> Draining -> Closed`. While
//! streaming, two pumps run as independent tasks:
//!
//! * the caller pump turns `media` frames into `input_audio_buffer.append`
//!   and ends the stream once the goodbye `mark` comes back;
//! * the assistant pump turns audio deltas into `media` frames, handles
//!   barge-in (`clear` + `conversation.item.truncate`) and end-of-call
//!   requests gated by presence.
//!
//! Whichever pump finishes first decides how the relay ends; the other one
//! is cancelled. The relay never touches sockets directly, only
//! [`PeerLink`]s, so any pair of channels can stand in for either peer.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{AudioFormat, FrameCodec, TELEPHONY_SAMPLE_RATE};
use crate::config::Config;
use crate::error::CallError;
use crate::mode_selector::ConversationMode;
use crate::net_link::{AssistantConnector, PeerLink};
use crate::presence::PresenceGate;
use crate::protocol::{
    ConversationItem, InputTranscription, RealtimeCommand, RealtimeEvent, SessionConfig,
    StreamStart, TelephonyCommand, TelephonyEvent, TurnDetection,
};
use crate::session::CallRegistry;
use crate::state_machine::RelayPhase;
use crate::termination::TerminationPhrases;

/// Injected when the caller asks to hang up but has not proven they are up.
pub const KEEP_GOING_NOTE: &str = "The user asked to end the call, but they have not confirmed \
they are out of bed yet. Do not say goodbye. Tell them kindly that the call ends once they \
touch the doorbell sensor, and keep encouraging them to get up.";

/// Injected when an honoured hang-up arrives while the assistant is silent.
pub const GOODBYE_NOTE: &str =
    "The user is confirmed to be up. Say a short, cheerful goodbye.";

/// Mark sent after the goodbye. Its echo means the caller heard all of it.
pub const GOODBYE_MARK: &str = "goodbye";

/// Error code for a `response.create` sent while another response is running.
const ACTIVE_RESPONSE_ERROR: &str = "conversation_already_has_active_response";

/// Receives the relay's "realtime failed for this call" signal.
///
/// Called at most once per relay, and only for failures where falling back
/// to the traditional flow makes sense (assistant unreachable or dropped).
pub trait RealtimeFallback: Send + Sync {
    fn realtime_failed(&self, call_id: Option<&str>, error: &CallError);
}

/// Per-deployment assistant settings shared by every relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub voice: String,
    pub instructions: String,
    pub assistant_format: AudioFormat,
    pub transcription_model: Option<String>,
    pub termination: TerminationPhrases,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        let model = config.transcription_model.trim();
        Self {
            voice: config.realtime_voice.clone(),
            instructions: config.realtime_instructions.clone(),
            assistant_format: config.realtime_audio_format,
            transcription_model: (!model.is_empty()).then(|| model.to_string()),
            termination: TerminationPhrases::default(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            turn_detection: TurnDetection::server_vad(),
            input_audio_format: self.assistant_format,
            output_audio_format: self.assistant_format,
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            modalities: vec!["text".to_string(), "audio".to_string()],
            input_audio_transcription: self
                .transcription_model
                .clone()
                .map(|model| InputTranscription { model }),
        }
    }
}

/// Everything a relay needs besides the telephony link itself.
pub struct RelayContext {
    pub registry: Arc<CallRegistry>,
    pub presence: Arc<PresenceGate>,
    pub connector: Arc<dyn AssistantConnector>,
    pub fallback: Arc<dyn RealtimeFallback>,
    pub settings: RelaySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Telephony sent `stop`.
    StreamStopped,
    /// Telephony socket went away without `stop`.
    CallerDisconnected,
    /// The caller asked to end the call while presence was confirmed.
    HangUpHonoured,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Completed { call_id: String, reason: StopReason },
    /// Telephony left before identifying the call.
    Abandoned,
    Failed {
        call_id: Option<String>,
        error: CallError,
    },
}

enum HandshakeStep {
    Waiting,
    Started(StreamStart),
    /// Telephony hung up or stopped before streaming began.
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    StreamStopped,
    CallerDisconnected,
    HangUp,
    AssistantDropped,
}

pub struct MediaRelay {
    id: Uuid,
    ctx: Arc<RelayContext>,
    phase: watch::Sender<RelayPhase>,
}

impl MediaRelay {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        let (phase, _) = watch::channel(RelayPhase::Handshaking);
        Self {
            id: Uuid::new_v4(),
            ctx,
            phase,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> RelayPhase {
        *self.phase.borrow()
    }

    /// Observe phase changes, e.g. to wait for `Closed`.
    pub fn subscribe(&self) -> watch::Receiver<RelayPhase> {
        self.phase.subscribe()
    }

    fn advance(&self, next: RelayPhase) {
        let current = self.phase();
        if current.can_advance_to(next) {
            self.phase.send_replace(next);
            log::debug!("relay {}: {:?} -> {:?}", self.id, current, next);
        }
    }

    /// Runs the relay to completion. Returns once both peers are released.
    pub async fn run(self, telephony: PeerLink) -> RelayOutcome {
        let PeerLink {
            tx: tel_tx,
            rx: mut tel_rx,
        } = telephony;

        // 1. 连接 AI，同时盯住电话侧：主叫可能在连接期间就挂断
        let mut start: Option<StreamStart> = None;
        let mut connect = self.ctx.connector.connect();
        let assistant = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(link) => break link,
                    Err(error) => return self.fail(start.map(|s| s.call_sid), error),
                },
                msg = tel_rx.recv() => match self.handshake_step(msg) {
                    HandshakeStep::Waiting => {}
                    HandshakeStep::Started(early) => {
                        if start.is_none() {
                            start = Some(early);
                        } else {
                            log::warn!("relay {}: duplicate start ignored", self.id);
                        }
                    }
                    HandshakeStep::Left => return self.abandon(),
                },
            }
        };
        drop(connect);
        let PeerLink {
            tx: ai_tx,
            rx: mut ai_rx,
        } = assistant;

        let update = RealtimeCommand::SessionUpdate {
            session: self.ctx.settings.session_config(),
        };
        if let Err(error) = send_json(&ai_tx, &update).await {
            return self.fail(start.map(|s| s.call_sid), error);
        }

        // 2. 等待电话侧 start 事件（可能在连接期间已经到达）
        let start = match start {
            Some(start) => start,
            None => match self.await_start(&mut tel_rx, &mut ai_rx).await {
                Ok(start) => start,
                Err(outcome) => return outcome,
            },
        };
        let call_id = start.call_sid.clone();
        log::info!(
            "[{}] Media stream {} attached to relay {}",
            call_id,
            start.stream_sid,
            self.id
        );

        self.ctx
            .registry
            .get_or_create(&call_id, ConversationMode::Realtime);
        if let Err(error) = self.ctx.registry.bind_relay(&call_id) {
            log::error!("[{}] Cannot bind relay: {}", call_id, error);
            self.advance(RelayPhase::Closed);
            return RelayOutcome::Failed {
                call_id: Some(call_id),
                error,
            };
        }
        self.advance(RelayPhase::Streaming);

        // 3. 双向泵
        let codec = FrameCodec::new(self.ctx.settings.assistant_format);
        let caller = CallerPump {
            call_id: call_id.clone(),
            rx: tel_rx,
            assistant: ai_tx.clone(),
            codec,
        };
        let assistant = AssistantPump {
            call_id: call_id.clone(),
            stream_sid: start.stream_sid,
            rx: ai_rx,
            assistant: ai_tx,
            telephony: tel_tx,
            codec,
            presence: self.ctx.presence.clone(),
            termination: self.ctx.settings.termination.clone(),
            playback: None,
            response_active: false,
            response_requested: false,
            hangup_pending: false,
            goodbye_marked: false,
        };
        let exit = self
            .supervise(tokio::spawn(caller.run()), tokio::spawn(assistant.run()))
            .await;

        // 4. 收尾
        self.ctx.registry.release_relay(&call_id);
        let reason = match exit {
            PumpExit::StreamStopped => StopReason::StreamStopped,
            PumpExit::CallerDisconnected => StopReason::CallerDisconnected,
            PumpExit::HangUp => StopReason::HangUpHonoured,
            PumpExit::AssistantDropped => {
                let error = CallError::PeerUnavailable("assistant dropped mid-call".to_string());
                return self.fail(Some(call_id), error);
            }
        };
        self.advance(RelayPhase::Closed);
        log::info!("[{}] Relay closed ({:?})", call_id, reason);
        RelayOutcome::Completed { call_id, reason }
    }

    async fn await_start(
        &self,
        tel_rx: &mut mpsc::Receiver<String>,
        ai_rx: &mut mpsc::Receiver<String>,
    ) -> Result<StreamStart, RelayOutcome> {
        loop {
            tokio::select! {
                msg = tel_rx.recv() => match self.handshake_step(msg) {
                    HandshakeStep::Waiting => {}
                    HandshakeStep::Started(start) => return Ok(start),
                    HandshakeStep::Left => return Err(self.abandon()),
                },
                msg = ai_rx.recv() => {
                    let Some(text) = msg else {
                        let error = CallError::PeerUnavailable(
                            "assistant closed during handshake".to_string(),
                        );
                        return Err(self.fail(None, error));
                    };
                    match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(RealtimeEvent::SessionCreated) | Ok(RealtimeEvent::SessionUpdated) => {
                            log::debug!("relay {}: assistant session ready", self.id);
                        }
                        Ok(RealtimeEvent::Error { error }) => {
                            log::warn!("relay {}: assistant error: {}", self.id, error.message);
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("relay {}: malformed assistant frame: {}", self.id, e),
                    }
                }
            }
        }
    }

    /// One telephony message seen before streaming starts.
    fn handshake_step(&self, msg: Option<String>) -> HandshakeStep {
        let Some(text) = msg else {
            log::info!("relay {}: telephony left during handshake", self.id);
            return HandshakeStep::Left;
        };
        match serde_json::from_str::<TelephonyEvent>(&text) {
            Ok(TelephonyEvent::Start { start }) => HandshakeStep::Started(start),
            Ok(TelephonyEvent::Stop) => {
                log::info!("relay {}: stream stopped during handshake", self.id);
                self.advance(RelayPhase::Draining);
                HandshakeStep::Left
            }
            Ok(TelephonyEvent::Connected) => {
                log::debug!("relay {}: telephony connected", self.id);
                HandshakeStep::Waiting
            }
            Ok(TelephonyEvent::Media { .. }) => {
                log::debug!("relay {}: media during handshake dropped", self.id);
                HandshakeStep::Waiting
            }
            Ok(TelephonyEvent::Mark { .. }) | Ok(TelephonyEvent::Other) => HandshakeStep::Waiting,
            Err(e) => {
                log::warn!("relay {}: malformed telephony frame: {}", self.id, e);
                HandshakeStep::Waiting
            }
        }
    }

    /// Telephony left before streaming. Not an assistant failure, so no fallback.
    fn abandon(&self) -> RelayOutcome {
        self.advance(RelayPhase::Closed);
        RelayOutcome::Abandoned
    }

    /// Waits for the first pump to finish and cancels the other.
    async fn supervise(
        &self,
        mut caller: JoinHandle<PumpExit>,
        mut assistant: JoinHandle<PumpExit>,
    ) -> PumpExit {
        let (first, remaining) = tokio::select! {
            res = &mut caller => (res, assistant),
            res = &mut assistant => (res, caller),
        };
        let exit = first.unwrap_or_else(|e| {
            log::error!("relay {}: pump task failed: {}", self.id, e);
            PumpExit::AssistantDropped
        });
        if exit != PumpExit::AssistantDropped {
            self.advance(RelayPhase::Draining);
        }
        remaining.abort();
        let _ = remaining.await;
        exit
    }

    fn fail(&self, call_id: Option<String>, error: CallError) -> RelayOutcome {
        match &call_id {
            Some(id) => log::error!("[{}] Realtime relay failed: {}", id, error),
            None => log::error!("relay {}: realtime relay failed: {}", self.id, error),
        }
        self.advance(RelayPhase::Closed);
        self.ctx.fallback.realtime_failed(call_id.as_deref(), &error);
        RelayOutcome::Failed { call_id, error }
    }
}

async fn send_json<T: Serialize>(tx: &mpsc::Sender<String>, msg: &T) -> Result<(), CallError> {
    let text = serde_json::to_string(msg).map_err(|e| CallError::MalformedFrame(e.to_string()))?;
    tx.send(text)
        .await
        .map_err(|_| CallError::PeerUnavailable("peer connection closed".to_string()))
}

struct CallerPump {
    call_id: String,
    rx: mpsc::Receiver<String>,
    assistant: mpsc::Sender<String>,
    codec: FrameCodec,
}

impl CallerPump {
    async fn run(mut self) -> PumpExit {
        while let Some(text) = self.rx.recv().await {
            let event = match serde_json::from_str::<TelephonyEvent>(&text) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("[{}] Malformed telephony frame dropped: {}", self.call_id, e);
                    continue;
                }
            };
            match event {
                TelephonyEvent::Media { media } => {
                    if media.track.as_deref().is_some_and(|t| t != "inbound") {
                        continue;
                    }
                    let audio = match self.codec.caller_to_assistant(&media.payload) {
                        Ok(audio) => audio,
                        Err(e) => {
                            log::warn!("[{}] Caller frame dropped: {}", self.call_id, e);
                            continue;
                        }
                    };
                    let append = RealtimeCommand::AppendAudio { audio };
                    if send_json(&self.assistant, &append).await.is_err() {
                        return PumpExit::AssistantDropped;
                    }
                }
                TelephonyEvent::Stop => {
                    log::info!("[{}] Telephony stream stopped", self.call_id);
                    return PumpExit::StreamStopped;
                }
                TelephonyEvent::Mark { mark } if mark.name == GOODBYE_MARK => {
                    log::info!("[{}] Goodbye played out, ending stream", self.call_id);
                    return PumpExit::HangUp;
                }
                TelephonyEvent::Start { .. } => {
                    log::warn!("[{}] Duplicate start ignored", self.call_id);
                }
                TelephonyEvent::Mark { .. } | TelephonyEvent::Connected | TelephonyEvent::Other => {}
            }
        }
        log::info!("[{}] Telephony socket closed", self.call_id);
        PumpExit::CallerDisconnected
    }
}

/// Assistant audio forwarded to the caller for the item currently speaking.
struct Playback {
    item_id: String,
    samples: u64,
}

impl Playback {
    fn forwarded_ms(&self) -> u64 {
        self.samples * 1000 / TELEPHONY_SAMPLE_RATE as u64
    }
}

struct AssistantPump {
    call_id: String,
    stream_sid: String,
    rx: mpsc::Receiver<String>,
    assistant: mpsc::Sender<String>,
    telephony: mpsc::Sender<String>,
    codec: FrameCodec,
    presence: Arc<PresenceGate>,
    termination: TerminationPhrases,
    playback: Option<Playback>,
    response_active: bool,
    /// A `response.create` of ours has not been acknowledged yet.
    response_requested: bool,
    hangup_pending: bool,
    goodbye_marked: bool,
}

impl AssistantPump {
    async fn run(mut self) -> PumpExit {
        while let Some(text) = self.rx.recv().await {
            let event = match serde_json::from_str::<RealtimeEvent>(&text) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("[{}] Malformed assistant frame dropped: {}", self.call_id, e);
                    continue;
                }
            };
            if let Err(exit) = self.handle(event).await {
                return exit;
            }
        }
        log::warn!("[{}] Assistant socket closed", self.call_id);
        PumpExit::AssistantDropped
    }

    async fn handle(&mut self, event: RealtimeEvent) -> Result<(), PumpExit> {
        match event {
            RealtimeEvent::AudioDelta { item_id, delta } => {
                self.response_active = true;
                let frame = match self.codec.assistant_to_caller(&delta) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("[{}] Assistant frame dropped: {}", self.call_id, e);
                        return Ok(());
                    }
                };
                self.track_playback(&item_id, frame.samples as u64);
                let media = TelephonyCommand::media(&self.stream_sid, frame.payload);
                self.to_caller(&media).await
            }
            RealtimeEvent::SpeechStarted => self.interrupt().await,
            RealtimeEvent::ResponseCreated => {
                self.response_active = true;
                self.response_requested = false;
                Ok(())
            }
            RealtimeEvent::ResponseDone => {
                self.response_active = false;
                if self.hangup_pending {
                    return self.mark_goodbye().await;
                }
                Ok(())
            }
            RealtimeEvent::TranscriptCompleted { transcript } => {
                self.on_transcript(&transcript).await
            }
            RealtimeEvent::Error { error } => {
                log::warn!(
                    "[{}] Assistant error {}: {}",
                    self.call_id,
                    error.code.as_deref().unwrap_or("-"),
                    error.message
                );
                if !self.response_requested {
                    return Ok(());
                }
                self.response_requested = false;
                if error.code.as_deref() == Some(ACTIVE_RESPONSE_ERROR) {
                    // 已有回复在进行，它自己的 response.done 会到来
                    self.response_active = true;
                    return Ok(());
                }
                // 请求被拒且不会再有 response.done
                self.response_active = false;
                if self.hangup_pending {
                    return self.mark_goodbye().await;
                }
                Ok(())
            }
            RealtimeEvent::SessionCreated | RealtimeEvent::SessionUpdated => {
                log::debug!("[{}] Assistant session acknowledged", self.call_id);
                Ok(())
            }
            RealtimeEvent::Other => Ok(()),
        }
    }

    fn track_playback(&mut self, item_id: &str, samples: u64) {
        if let Some(playback) = self.playback.as_mut().filter(|p| p.item_id == item_id) {
            playback.samples += samples;
            return;
        }
        self.playback = Some(Playback {
            item_id: item_id.to_string(),
            samples,
        });
    }

    /// Caller barged in: flush queued playback, then cut the assistant's item
    /// at what was already forwarded.
    async fn interrupt(&mut self) -> Result<(), PumpExit> {
        log::info!("[{}] Caller started speaking, clearing playback", self.call_id);
        self.to_caller(&TelephonyCommand::clear(&self.stream_sid))
            .await?;
        if let Some(playback) = self.playback.take() {
            let truncate = RealtimeCommand::Truncate {
                audio_end_ms: playback.forwarded_ms(),
                item_id: playback.item_id,
                content_index: 0,
            };
            self.to_assistant(&truncate).await?;
        }
        Ok(())
    }

    async fn on_transcript(&mut self, transcript: &str) -> Result<(), PumpExit> {
        log::info!("[{}] Caller: {}", self.call_id, transcript);
        if !self.termination.matches(transcript) {
            return Ok(());
        }

        if self.presence.is_armed() {
            log::info!("[{}] End-of-call request honoured", self.call_id);
            self.hangup_pending = true;
            if self.response_active {
                return Ok(());
            }
            return self.prompt(GOODBYE_NOTE).await;
        }

        log::info!(
            "[{}] End-of-call request ignored, presence not confirmed",
            self.call_id
        );
        self.prompt(KEEP_GOING_NOTE).await
    }

    async fn prompt(&mut self, note: &str) -> Result<(), PumpExit> {
        let item = RealtimeCommand::CreateItem {
            item: ConversationItem::system_note(note),
        };
        self.to_assistant(&item).await?;
        self.to_assistant(&RealtimeCommand::CreateResponse).await?;
        self.response_active = true;
        self.response_requested = true;
        Ok(())
    }

    /// The goodbye is fully generated. The caller pump ends the stream once
    /// the provider echoes this mark, i.e. after the audio has played.
    async fn mark_goodbye(&mut self) -> Result<(), PumpExit> {
        if self.goodbye_marked {
            return Ok(());
        }
        self.goodbye_marked = true;
        log::info!("[{}] Goodbye generated, waiting for playback", self.call_id);
        self.to_caller(&TelephonyCommand::mark(&self.stream_sid, GOODBYE_MARK))
            .await
    }

    async fn to_caller(&self, msg: &TelephonyCommand) -> Result<(), PumpExit> {
        send_json(&self.telephony, msg)
            .await
            .map_err(|_| PumpExit::CallerDisconnected)
    }

    async fn to_assistant(&self, msg: &RealtimeCommand) -> Result<(), PumpExit> {
        send_json(&self.assistant, msg)
            .await
            .map_err(|_| PumpExit::AssistantDropped)
    }
}

//! Call orchestrator: answers the telephony provider's call webhook with a
//! call-control document, either speak-then-listen (traditional) or
//! "connect a media stream to us" (realtime).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use url::Url;

use crate::config::Config;
use crate::error::CallError;
use crate::media_relay::RealtimeFallback;
use crate::mode_selector::{ConversationMode, ModeSelector};
use crate::session::CallRegistry;

/// What the provider should do with the call next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallInstructions {
    /// Say `prompt`, then collect speech. The result is posted back to the
    /// same webhook.
    Gather { prompt: String },
    /// Open a media stream to `url`.
    Stream { url: String },
}

impl CallInstructions {
    pub fn mode(&self) -> ConversationMode {
        match self {
            CallInstructions::Gather { .. } => ConversationMode::Traditional,
            CallInstructions::Stream { .. } => ConversationMode::Realtime,
        }
    }

    pub fn to_twiml(&self) -> String {
        let body = match self {
            CallInstructions::Gather { prompt } => format!(
                "<Say>{}</Say><Gather input=\"speech\" language=\"en-US\" speechTimeout=\"auto\"/>",
                xml_escape(prompt)
            ),
            CallInstructions::Stream { url } => format!(
                "<Connect><Stream url=\"{}\"/></Connect>",
                xml_escape(url)
            ),
        };
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>{}</Response>",
            body
        )
    }
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Derives the `wss://…/media-stream` address from the public base URL.
/// Plaintext schemes are refused, providers will not connect to them.
pub fn media_stream_url(base_url: &str) -> Result<String, CallError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| CallError::InvalidConfiguration(format!("base url {}: {}", base_url, e)))?;
    match url.scheme() {
        "https" | "wss" => {}
        other => {
            return Err(CallError::InvalidConfiguration(format!(
                "media stream needs an encrypted address, got {}://",
                other
            )));
        }
    }
    url.set_scheme("wss")
        .map_err(|_| CallError::InvalidConfiguration(base_url.to_string()))?;
    let path = format!("{}/media-stream", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    Ok(url.to_string())
}

pub struct CallOrchestrator {
    registry: Arc<CallRegistry>,
    selector: Arc<ModeSelector>,
    stream_url: String,
    greeting: String,
    reprompt: String,
    forced: DashMap<String, ConversationMode>,
    prefer_traditional: AtomicBool,
}

impl CallOrchestrator {
    pub fn new(
        registry: Arc<CallRegistry>,
        selector: Arc<ModeSelector>,
        base_url: &str,
        greeting: &str,
        reprompt: &str,
    ) -> Result<Self, CallError> {
        Ok(Self {
            registry,
            selector,
            stream_url: media_stream_url(base_url)?,
            greeting: greeting.to_string(),
            reprompt: reprompt.to_string(),
            forced: DashMap::new(),
            prefer_traditional: AtomicBool::new(false),
        })
    }

    pub fn from_config(
        config: &Config,
        registry: Arc<CallRegistry>,
        selector: Arc<ModeSelector>,
    ) -> Result<Self, CallError> {
        Self::new(
            registry,
            selector,
            &config.base_url,
            &config.greeting,
            &config.reprompt,
        )
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    /// Pins the mode of a call placed for testing. Consumed by its first webhook.
    pub fn force_mode(&self, call_id: &str, mode: ConversationMode) {
        log::info!("[{}] Mode forced to {}", call_id, mode);
        self.forced.insert(call_id.to_string(), mode);
    }

    pub fn prefers_traditional(&self) -> bool {
        self.prefer_traditional.load(Ordering::SeqCst)
    }

    /// Forced mode wins, then a pending fallback preference, then the selector.
    fn decide_mode(&self, call_id: &str) -> ConversationMode {
        if let Some((_, mode)) = self.forced.remove(call_id) {
            return mode;
        }
        if self.prefer_traditional.swap(false, Ordering::SeqCst) {
            log::info!("[{}] Realtime failed last time, using traditional", call_id);
            return ConversationMode::Traditional;
        }
        self.selector.choose_mode()
    }

    /// Handles one call webhook. The first request for a call decides its
    /// mode; later requests (speech results posted back) reuse it.
    pub fn handle_incoming(&self, call_id: &str) -> Result<CallInstructions, CallError> {
        let call_id = call_id.trim();
        if call_id.is_empty() {
            return Err(CallError::InvalidConfiguration(
                "call webhook without CallSid".to_string(),
            ));
        }

        let (session, prompt) = match self.registry.get(call_id) {
            Ok(session) => (session, &self.reprompt),
            Err(CallError::NotFound(_)) => {
                let mode = self.decide_mode(call_id);
                let session = match self.registry.create(call_id, mode) {
                    Ok(session) => session,
                    // 并发的重复 webhook，沿用先到者的模式
                    Err(CallError::DuplicateSession(_)) => self.registry.get(call_id)?,
                    Err(e) => return Err(e),
                };
                (session, &self.greeting)
            }
            Err(e) => return Err(e),
        };

        log::info!("[{}] Answering in {} mode", call_id, session.mode);
        Ok(match session.mode {
            ConversationMode::Traditional => CallInstructions::Gather {
                prompt: prompt.clone(),
            },
            ConversationMode::Realtime => CallInstructions::Stream {
                url: self.stream_url.clone(),
            },
        })
    }

    /// The provider reported a terminal call status.
    pub fn call_ended(&self, call_id: &str) {
        self.forced.remove(call_id);
        self.registry.end_call(call_id);
    }
}

impl RealtimeFallback for CallOrchestrator {
    fn realtime_failed(&self, call_id: Option<&str>, error: &CallError) {
        log::warn!(
            "[{}] Realtime unavailable ({}); next call will use traditional mode",
            call_id.unwrap_or("-"),
            error
        );
        self.prefer_traditional.store(true, Ordering::SeqCst);
    }
}

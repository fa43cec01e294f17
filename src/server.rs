//! HTTP surface: provider webhooks, the media stream upgrade, presence
//! webhooks and the small admin API.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Form, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::error::CallError;
use crate::media_relay::{MediaRelay, RelayContext, RelayOutcome, RelaySettings};
use crate::mode_selector::{ConversationMode, ModeSelector};
use crate::net_link::{AssistantConnector, RealtimeConnector, link_socket};
use crate::orchestrator::CallOrchestrator;
use crate::presence::{PresenceGate, is_authenticated_event};
use crate::session::CallRegistry;
use crate::telephony::TwilioClient;

/// Call statuses after which the provider sends nothing more for a call.
const TERMINAL_CALL_STATUSES: &[&str] = &["completed", "failed", "busy", "no-answer", "canceled"];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<CallRegistry>,
    pub selector: Arc<ModeSelector>,
    pub presence: Arc<PresenceGate>,
    pub orchestrator: Arc<CallOrchestrator>,
    pub relay: Arc<RelayContext>,
    pub telephony: Arc<TwilioClient>,
}

impl AppState {
    /// Production wiring: assistant reached over the configured realtime URL.
    pub fn from_config(config: Config) -> Result<Self, CallError> {
        let connector = Arc::new(RealtimeConnector::new(
            &config.realtime_url,
            &config.openai_api_key,
        ));
        Self::new(config, connector)
    }

    pub fn new(config: Config, connector: Arc<dyn AssistantConnector>) -> Result<Self, CallError> {
        let registry = Arc::new(CallRegistry::new());
        let selector = Arc::new(ModeSelector::new(config.realtime_probability)?);
        let presence = Arc::new(PresenceGate::new(Duration::from_secs(
            config.presence_validity_secs,
        )));
        let orchestrator = Arc::new(CallOrchestrator::from_config(
            &config,
            registry.clone(),
            selector.clone(),
        )?);
        let relay = Arc::new(RelayContext {
            registry: registry.clone(),
            presence: presence.clone(),
            connector,
            fallback: orchestrator.clone(),
            settings: RelaySettings::from_config(&config),
        });
        let telephony = Arc::new(TwilioClient::from_config(&config));

        Ok(Self {
            config: Arc::new(config),
            registry,
            selector,
            presence,
            orchestrator,
            relay,
            telephony,
        })
    }
}

impl IntoResponse for CallError {
    fn into_response(self) -> Response {
        let status = match &self {
            CallError::InvalidConfiguration(_) | CallError::MalformedFrame(_) => {
                StatusCode::BAD_REQUEST
            }
            CallError::NotFound(_) => StatusCode::NOT_FOUND,
            CallError::DuplicateSession(_) => StatusCode::CONFLICT,
            CallError::PeerUnavailable(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/call", post(place_call))
        .route("/test-call", get(test_call))
        .route("/voice", post(voice))
        .route("/call-status", post(call_status))
        .route("/media-stream", get(media_stream))
        .route("/admin/probability", get(get_probability).post(set_probability))
        .route("/doorbell-status", get(doorbell_status))
        .route("/activate-doorbell", post(activate_doorbell))
        .route("/doorbell-webhook", post(doorbell_webhook))
        .route("/test-websocket", get(test_websocket))
        .with_state(state)
}

/// Serves until Ctrl+C.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server_host, state.config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    log::info!("Listening on {} (public {})", addr, state.config.base_url);
    log::info!("Media stream address: {}", state.orchestrator.stream_url());

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {}", e);
            }
            log::info!("Received Ctrl+C, shutting down...");
        })
        .await?;
    Ok(())
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "Wake-up Coach is running",
        "version": env!("APP_VERSION"),
        "realtime_probability": state.selector.get_probability(),
        "presence": state.presence.status(),
        "live_sessions": state.registry.len(),
        "telephony_configured": state.config.twilio_configured(),
    }))
}

async fn place_call(State(state): State<AppState>) -> Result<Json<Value>, CallError> {
    let call_sid = state.telephony.place_wakeup_call().await?;
    Ok(Json(json!({ "status": "Call initiated", "call_sid": call_sid })))
}

#[derive(Debug, Deserialize)]
struct TestCallQuery {
    mode: Option<String>,
}

async fn test_call(
    State(state): State<AppState>,
    Query(query): Query<TestCallQuery>,
) -> Result<Json<Value>, CallError> {
    let mode = query
        .mode
        .as_deref()
        .map(str::parse::<ConversationMode>)
        .transpose()?;
    let call_sid = state.telephony.place_wakeup_call().await?;
    if let Some(mode) = mode {
        state.orchestrator.force_mode(&call_sid, mode);
    }
    Ok(Json(json!({
        "status": "Test call initiated",
        "call_sid": call_sid,
        "mode": mode,
    })))
}

#[derive(Debug, Deserialize)]
struct VoiceWebhook {
    #[serde(rename = "CallSid", default)]
    call_sid: String,
    #[serde(rename = "SpeechResult")]
    speech_result: Option<String>,
}

async fn voice(
    State(state): State<AppState>,
    Form(form): Form<VoiceWebhook>,
) -> Result<Response, CallError> {
    if let Some(speech) = form.speech_result.as_deref().filter(|s| !s.is_empty()) {
        log::info!("[{}] Caller said: {}", form.call_sid, speech);
    }
    let instructions = state.orchestrator.handle_incoming(&form.call_sid)?;
    Ok((
        [(header::CONTENT_TYPE, "application/xml")],
        instructions.to_twiml(),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct StatusWebhook {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "CallStatus")]
    call_status: String,
}

async fn call_status(State(state): State<AppState>, Form(form): Form<StatusWebhook>) -> StatusCode {
    log::info!("[{}] Call status: {}", form.call_sid, form.call_status);
    if TERMINAL_CALL_STATUSES.contains(&form.call_status.as_str()) {
        state.orchestrator.call_ended(&form.call_sid);
    }
    StatusCode::NO_CONTENT
}

async fn media_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let relay = MediaRelay::new(state.relay.clone());
        log::info!("Media stream connected, relay {}", relay.id());
        match relay.run(link_socket(socket, "telephony")).await {
            RelayOutcome::Completed { call_id, reason } => {
                log::info!("[{}] Media stream finished: {:?}", call_id, reason)
            }
            RelayOutcome::Abandoned => log::info!("Media stream closed before start"),
            RelayOutcome::Failed { call_id, error } => log::warn!(
                "[{}] Media stream failed: {}",
                call_id.as_deref().unwrap_or("-"),
                error
            ),
        }
    })
}

async fn get_probability(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "probability": state.selector.get_probability() }))
}

#[derive(Debug, Deserialize)]
struct ProbabilityUpdate {
    probability: f64,
}

async fn set_probability(
    State(state): State<AppState>,
    Json(update): Json<ProbabilityUpdate>,
) -> Result<Json<Value>, CallError> {
    state.selector.set_probability(update.probability)?;
    Ok(Json(json!({ "probability": state.selector.get_probability() })))
}

async fn doorbell_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.presence.status()))
}

async fn activate_doorbell(State(state): State<AppState>) -> Json<Value> {
    state.presence.arm();
    Json(json!(state.presence.status()))
}

/// Pulls the event type out of a presence webhook body. Anything that is
/// not a JSON object with a string type field yields `None`.
fn presence_event_type(body: &[u8]) -> Option<String> {
    let body: Value = serde_json::from_slice(body).ok()?;
    ["event_type", "type", "event"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

async fn doorbell_webhook(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let event_type = presence_event_type(&body).unwrap_or_default();
    let event_type = event_type.as_str();

    if !is_authenticated_event(event_type) {
        log::info!("Presence webhook ignored: {:?}", event_type);
        return Json(json!({ "armed": false, "ignored": true }));
    }

    log::info!("Presence confirmed by {}", event_type);
    state.presence.arm();
    let status = state.presence.status();
    Json(json!({
        "armed": status.armed,
        "remaining_secs": status.remaining_secs,
        "validity_secs": status.validity_secs,
    }))
}

async fn test_websocket(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        log::info!("Echo socket connected");
        if socket
            .send(Message::Text("Wake-up Coach echo socket ready".to_string()))
            .await
            .is_err()
        {
            return;
        }
        while let Some(Ok(msg)) = socket.recv().await {
            match msg {
                Message::Text(text) => {
                    if socket.send(Message::Text(format!("echo: {}", text))).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        log::info!("Echo socket closed");
    })
}

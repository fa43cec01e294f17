//! HTTP surface against a real listener; the assistant is never reachable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use wakeup_coach::config::Config;
use wakeup_coach::error::CallError;
use wakeup_coach::net_link::{AssistantConnector, PeerLink};
use wakeup_coach::server::{AppState, router};

struct Unreachable;

#[async_trait]
impl AssistantConnector for Unreachable {
    async fn connect(&self) -> Result<PeerLink, CallError> {
        Err(CallError::PeerUnavailable("assistant offline".into()))
    }
}

async fn spawn_app(probability: f64) -> (SocketAddr, AppState) {
    let mut config = Config::new().unwrap();
    config.base_url = "https://coach.example.com".into();
    config.realtime_probability = probability;
    let state = AppState::new(config, Arc::new(Unreachable)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

#[tokio::test]
async fn voice_webhook_returns_call_control_document() {
    let (addr, state) = spawn_app(0.0).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/voice", addr))
        .form(&[("CallSid", "CA1"), ("From", "+15550001111")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/xml");
    let body = resp.text().await.unwrap();
    assert!(body.contains("<Gather input=\"speech\""));
    assert!(body.contains("<Say>"));
    assert_eq!(state.registry.len(), 1);

    let resp = client
        .post(format!("http://{}/voice", addr))
        .form(&[("From", "+15550001111")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn probability_admin_validates_and_drives_mode() {
    let (addr, _) = spawn_app(0.0).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/admin/probability", addr);

    let resp = client
        .post(&url)
        .json(&json!({"probability": 1.01}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let current: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(current["probability"], 0.0);

    let resp = client
        .post(&url)
        .json(&json!({"probability": 1.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = client
        .post(format!("http://{}/voice", addr))
        .form(&[("CallSid", "CA2")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("<Stream url=\"wss://coach.example.com/media-stream\"/>"));
}

#[tokio::test]
async fn presence_webhook_arms_only_on_authenticated_events() {
    let (addr, state) = spawn_app(0.5).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/doorbell-webhook", addr);

    let ignored: Value = client
        .post(&url)
        .json(&json!({"event_type": "doorbell.ring"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ignored, json!({"armed": false, "ignored": true}));
    assert!(!state.presence.is_armed());

    let resp = client
        .post(&url)
        .header("content-type", "text/plain")
        .body("ding dong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ignored: Value = resp.json().await.unwrap();
    assert_eq!(ignored["ignored"], true);
    assert!(!state.presence.is_armed());

    let armed: Value = client
        .post(&url)
        .json(&json!({"type": "doorbell.fingerprint.authenticated", "device": "front"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(armed["armed"], true);

    let status: Value = client
        .get(format!("http://{}/doorbell-status", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["armed"], true);
    assert_eq!(status["validity_secs"], 300);
}

#[tokio::test]
async fn terminal_status_callback_ends_the_session() {
    let (addr, state) = spawn_app(0.0).await;
    let client = reqwest::Client::new();
    client
        .post(format!("http://{}/voice", addr))
        .form(&[("CallSid", "CA3")])
        .send()
        .await
        .unwrap();
    assert!(state.registry.get("CA3").is_ok());

    let resp = client
        .post(format!("http://{}/call-status", addr))
        .form(&[("CallSid", "CA3"), ("CallStatus", "ringing")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(state.registry.get("CA3").is_ok());

    client
        .post(format!("http://{}/call-status", addr))
        .form(&[("CallSid", "CA3"), ("CallStatus", "completed")])
        .send()
        .await
        .unwrap();
    assert!(state.registry.get("CA3").is_err());
}

#[tokio::test]
async fn test_call_without_credentials_is_rejected() {
    let (addr, _) = spawn_app(0.5).await;
    let resp = reqwest::get(format!("http://{}/test-call?mode=realtime", addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = reqwest::get(format!("http://{}/test-call?mode=hologram", addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn media_stream_without_assistant_hangs_up_and_prefers_traditional() {
    let (addr, state) = spawn_app(1.0).await;
    assert!(!state.orchestrator.prefers_traditional());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/media-stream", addr))
        .await
        .unwrap();
    // the relay closes the socket instead of leaving it hanging
    let closed = timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(state.orchestrator.prefers_traditional());

    let body = reqwest::Client::new()
        .post(format!("http://{}/voice", addr))
        .form(&[("CallSid", "CA4")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("<Gather"));
}

#[tokio::test]
async fn status_page_reports_live_state() {
    let (addr, _) = spawn_app(0.25).await;
    let status: Value = reqwest::get(format!("http://{}/", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["realtime_probability"], 0.25);
    assert_eq!(status["live_sessions"], 0);
    assert_eq!(status["presence"]["armed"], false);
}

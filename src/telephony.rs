use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::error::CallError;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
}

/// Outbound calls through the provider's REST API.
pub struct TwilioClient {
    client: Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from: String,
    default_to: String,
    base_url: String,
}

impl TwilioClient {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_base: TWILIO_API_BASE.to_string(),
            account_sid: config.twilio_account_sid.clone(),
            auth_token: config.twilio_auth_token.clone(),
            from: config.twilio_phone_number.clone(),
            default_to: config.phone_number.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Points the client at another API root (a local stub in tests).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Calls the configured wake-up number.
    pub async fn place_wakeup_call(&self) -> Result<String, CallError> {
        self.place_call(&self.default_to).await
    }

    /// Starts a call to `to`; the provider then fetches `/voice` for
    /// instructions. Returns the provider's call id.
    pub async fn place_call(&self, to: &str) -> Result<String, CallError> {
        if self.account_sid.is_empty() || self.auth_token.is_empty() || self.from.is_empty() {
            return Err(CallError::InvalidConfiguration(
                "TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN and TWILIO_PHONE_NUMBER are required"
                    .to_string(),
            ));
        }
        if to.trim().is_empty() {
            return Err(CallError::InvalidConfiguration(
                "no destination number (PHONE_NUMBER)".to_string(),
            ));
        }

        let url = format!("{}/Accounts/{}/Calls.json", self.api_base, self.account_sid);
        let voice_url = format!("{}/voice", self.base_url);
        let status_url = format!("{}/call-status", self.base_url);
        log::info!("Placing call to {} (webhook {})", to, voice_url);

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to),
                ("From", self.from.as_str()),
                ("Url", voice_url.as_str()),
                ("StatusCallback", status_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CallError::PeerUnavailable(format!("telephony api: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CallError::PeerUnavailable(format!(
                "telephony api returned {}: {}",
                status, body
            )));
        }

        let call: CallResource = resp
            .json()
            .await
            .map_err(|e| CallError::PeerUnavailable(format!("telephony api reply: {}", e)))?;
        log::info!("[{}] Call placed", call.sid);
        Ok(call.sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Form;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn config() -> Config {
        let mut config = Config::new().unwrap();
        config.base_url = "https://coach.example.com".into();
        config.twilio_account_sid = "AC123".into();
        config.twilio_auth_token = "secret".into();
        config.twilio_phone_number = "+15550001111".into();
        config.phone_number = "+15552223333".into();
        config
    }

    #[tokio::test]
    async fn missing_credentials_are_a_configuration_error() {
        let mut config = config();
        config.twilio_auth_token.clear();
        let client = TwilioClient::from_config(&config);
        assert!(matches!(
            client.place_wakeup_call().await,
            Err(CallError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn posts_call_form_and_returns_sid() {
        let (seen_tx, mut seen_rx) = mpsc::channel::<HashMap<String, String>>(1);
        let app = Router::new().route(
            "/Accounts/AC123/Calls.json",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(form).await;
                    Json(serde_json::json!({"sid": "CA42", "status": "queued"}))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            TwilioClient::from_config(&config()).with_api_base(&format!("http://{}", addr));
        assert_eq!(client.place_wakeup_call().await.unwrap(), "CA42");

        let form = seen_rx.recv().await.unwrap();
        assert_eq!(form["To"], "+15552223333");
        assert_eq!(form["From"], "+15550001111");
        assert_eq!(form["Url"], "https://coach.example.com/voice");
        assert_eq!(form["StatusCallback"], "https://coach.example.com/call-status");
    }

    #[tokio::test]
    async fn provider_rejection_is_peer_unavailable() {
        let app = Router::new().route(
            "/Accounts/AC123/Calls.json",
            post(|| async { (axum::http::StatusCode::UNAUTHORIZED, "bad auth") }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            TwilioClient::from_config(&config()).with_api_base(&format!("http://{}", addr));
        assert!(matches!(
            client.place_call("+15559998888").await,
            Err(CallError::PeerUnavailable(_))
        ));
    }
}

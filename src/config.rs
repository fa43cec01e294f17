use crate::audio::AudioFormat;
use crate::error::CallError;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    // HTTP 服务配置
    pub server_host: String,
    pub server_port: u16,
    /// Public https address the telephony provider reaches us on.
    pub base_url: String,

    // Realtime 会话配置（静态部分）
    pub realtime_url: String,
    pub realtime_voice: String,
    pub realtime_audio_format: AudioFormat,
    pub transcription_model: String,
    pub realtime_instructions: String,
    pub realtime_probability: f64,

    // 通话提示语
    pub greeting: String,
    pub reprompt: String,

    pub presence_validity_secs: u64,

    // 密钥与号码（动态部分，只从运行时环境读取）
    pub openai_api_key: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_phone_number: String,
    pub phone_number: String,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有默认值都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            server_host: env!("SERVER_HOST").to_string(),
            server_port: env!("SERVER_PORT")
                .parse()
                .map_err(|_| "Failed to parse SERVER_PORT")?,
            base_url: env!("DEFAULT_BASE_URL").to_string(),

            realtime_url: env!("REALTIME_URL").to_string(),
            realtime_voice: env!("REALTIME_VOICE").to_string(),
            realtime_audio_format: env!("REALTIME_AUDIO_FORMAT")
                .parse()
                .map_err(|_| "Failed to parse REALTIME_AUDIO_FORMAT")?,
            transcription_model: env!("REALTIME_TRANSCRIPTION_MODEL").to_string(),
            realtime_instructions: env!("REALTIME_INSTRUCTIONS").to_string(),
            realtime_probability: env!("REALTIME_PROBABILITY")
                .parse()
                .map_err(|_| "Failed to parse REALTIME_PROBABILITY")?,

            greeting: env!("CALL_GREETING").to_string(),
            reprompt: env!("CALL_REPROMPT").to_string(),

            presence_validity_secs: env!("PRESENCE_VALIDITY_SECS")
                .parse()
                .map_err(|_| "Failed to parse PRESENCE_VALIDITY_SECS")?,

            openai_api_key: String::new(),
            twilio_account_sid: String::new(),
            twilio_auth_token: String::new(),
            twilio_phone_number: String::new(),
            phone_number: String::new(),
        })
    }

    /// Build-time defaults overlaid with the process environment (after `.env`).
    pub fn load() -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env file loaded: {}", e);
        }
        let mut config = Self::new().map_err(anyhow::Error::msg)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies runtime overrides. `lookup` is the environment in production and
    /// a map in tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), CallError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |slot: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = value.trim().to_string();
            }
        };

        set(&mut self.base_url, "BASE_URL");
        set(&mut self.realtime_url, "REALTIME_URL");
        set(&mut self.realtime_voice, "REALTIME_VOICE");
        set(&mut self.openai_api_key, "OPENAI_API_KEY");
        set(&mut self.twilio_account_sid, "TWILIO_ACCOUNT_SID");
        set(&mut self.twilio_auth_token, "TWILIO_AUTH_TOKEN");
        set(&mut self.twilio_phone_number, "TWILIO_PHONE_NUMBER");
        set(&mut self.phone_number, "PHONE_NUMBER");

        if let Some(port) = lookup("PORT") {
            self.server_port = port
                .trim()
                .parse()
                .map_err(|_| CallError::InvalidConfiguration(format!("PORT={}", port)))?;
        }
        if let Some(p) = lookup("REALTIME_PROBABILITY") {
            self.realtime_probability = p.trim().parse().map_err(|_| {
                CallError::InvalidConfiguration(format!("REALTIME_PROBABILITY={}", p))
            })?;
        }
        if let Some(format) = lookup("REALTIME_AUDIO_FORMAT") {
            self.realtime_audio_format = format.trim().parse()?;
        }
        if let Some(secs) = lookup("DOORBELL_VALIDITY_SECS") {
            self.presence_validity_secs = secs.trim().parse().map_err(|_| {
                CallError::InvalidConfiguration(format!("DOORBELL_VALIDITY_SECS={}", secs))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if !(0.0..=1.0).contains(&self.realtime_probability) {
            return Err(CallError::InvalidConfiguration(format!(
                "realtime probability {} outside [0, 1]",
                self.realtime_probability
            )));
        }
        let base = Url::parse(&self.base_url).map_err(|e| {
            CallError::InvalidConfiguration(format!("BASE_URL {}: {}", self.base_url, e))
        })?;
        if base.scheme() != "https" {
            // 媒体流地址由 BASE_URL 推导，Twilio 只接受 wss://
            return Err(CallError::InvalidConfiguration(format!(
                "BASE_URL must use https, got {}",
                base.scheme()
            )));
        }
        let realtime = Url::parse(&self.realtime_url).map_err(|e| {
            CallError::InvalidConfiguration(format!("REALTIME_URL {}: {}", self.realtime_url, e))
        })?;
        if realtime.scheme() != "wss" && realtime.scheme() != "ws" {
            return Err(CallError::InvalidConfiguration(format!(
                "REALTIME_URL must be a websocket address, got {}",
                self.realtime_url
            )));
        }
        Ok(())
    }

    pub fn twilio_configured(&self) -> bool {
        !self.twilio_account_sid.is_empty()
            && !self.twilio_auth_token.is_empty()
            && !self.twilio_phone_number.is_empty()
    }
}

use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    server: Server,
    realtime: Realtime,
    call: Call,
    presence: Presence,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Server {
    host: String,
    port: u16,
    base_url: String,
}

#[derive(Deserialize)]
struct Realtime {
    url: String,
    voice: String,
    audio_format: String,
    transcription_model: String,
    probability: f64,
    instructions: String,
}

#[derive(Deserialize)]
struct Call {
    greeting: String,
    reprompt: String,
}

#[derive(Deserialize)]
struct Presence {
    validity_secs: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // HTTP 服务
    println!("cargo:rustc-env=SERVER_HOST={}", config.server.host);
    println!("cargo:rustc-env=SERVER_PORT={}", config.server.port);
    println!("cargo:rustc-env=DEFAULT_BASE_URL={}", config.server.base_url);

    // Realtime 会话
    println!("cargo:rustc-env=REALTIME_URL={}", config.realtime.url);
    println!("cargo:rustc-env=REALTIME_VOICE={}", config.realtime.voice);
    println!("cargo:rustc-env=REALTIME_AUDIO_FORMAT={}", config.realtime.audio_format);
    println!(
        "cargo:rustc-env=REALTIME_TRANSCRIPTION_MODEL={}",
        config.realtime.transcription_model
    );
    println!("cargo:rustc-env=REALTIME_PROBABILITY={}", config.realtime.probability);
    println!("cargo:rustc-env=REALTIME_INSTRUCTIONS={}", config.realtime.instructions);

    // 通话提示语
    println!("cargo:rustc-env=CALL_GREETING={}", config.call.greeting);
    println!("cargo:rustc-env=CALL_REPROMPT={}", config.call.reprompt);

    // 门铃确认有效期
    println!("cargo:rustc-env=PRESENCE_VALIDITY_SECS={}", config.presence.validity_secs);
}

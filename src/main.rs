use wakeup_coach::config::Config;
use wakeup_coach::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，默认 info 级别，可用 RUST_LOG 覆盖
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 加载配置：编译期默认值 + .env + 进程环境变量
    let config = Config::load()?;
    println!(
        "{} v{} starting (realtime probability {}, presence window {}s)",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.realtime_probability,
        config.presence_validity_secs
    );
    if !config.twilio_configured() {
        log::warn!("Telephony credentials missing; /call and /test-call will fail");
    }
    if config.openai_api_key.is_empty() {
        log::warn!("OPENAI_API_KEY missing; realtime calls will fall back to traditional mode");
    }

    let state = AppState::from_config(config)?;
    server::serve(state).await?;

    println!("Wake-up coach stopped");
    Ok(())
}

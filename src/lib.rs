pub mod audio;
pub mod config;
pub mod error;
pub mod media_relay;
pub mod mode_selector;
pub mod net_link;
pub mod orchestrator;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state_machine;
pub mod telephony;
pub mod termination;

pub use config::Config;
pub use error::CallError;

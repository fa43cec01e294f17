//! Error taxonomy shared by the relay, the registry and the orchestrator.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Rejected at the boundary; never reaches a live relay.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("call session not found: {0}")]
    NotFound(String),

    #[error("call session already exists: {0}")]
    DuplicateSession(String),

    /// A peer socket failed to open or dropped mid-call.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Logged and dropped by the relay, never propagated past a pump.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

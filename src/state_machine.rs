use serde::Serialize;

/// Per-relay protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPhase {
    /// Assistant socket opening, session configured, waiting for the
    /// telephony `start` event.
    Handshaking,
    /// Both pumps running.
    Streaming,
    /// A peer asked to stop; flushing what is already queued.
    Draining,
    /// Terminal. The session binding has been released.
    Closed,
}

impl RelayPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayPhase::Closed)
    }

    /// Legal forward transitions. Failures may jump straight to `Closed`.
    pub fn can_advance_to(&self, next: RelayPhase) -> bool {
        use RelayPhase::*;
        matches!(
            (self, next),
            (Handshaking, Streaming)
                | (Handshaking, Draining)
                | (Handshaking, Closed)
                | (Streaming, Draining)
                | (Streaming, Closed)
                | (Draining, Closed)
        )
    }
}

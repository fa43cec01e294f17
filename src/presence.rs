//! Presence gate: a physical confirmation (doorbell fingerprint, NFC tag…)
//! arms the gate for a fixed window. While armed, a spoken request to end the
//! call is honoured; otherwise the coach keeps going.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Event types that count as "the user is physically up".
pub const AUTHENTICATED_EVENTS: &[&str] = &[
    "doorbell.fingerprint.authenticated",
    "fingerprint.authenticated",
    "authenticated",
    "access.granted",
    "nfc.authenticated",
];

pub fn is_authenticated_event(event_type: &str) -> bool {
    let event_type = event_type.trim().to_ascii_lowercase();
    AUTHENTICATED_EVENTS.iter().any(|known| *known == event_type)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PresenceStatus {
    pub armed: bool,
    pub remaining_secs: u64,
    pub validity_secs: u64,
}

pub struct PresenceGate {
    activated_at: RwLock<Option<Instant>>,
    validity: Duration,
    clock: Arc<dyn Clock>,
}

impl PresenceGate {
    pub fn new(validity: Duration) -> Self {
        Self::with_clock(validity, Arc::new(SystemClock))
    }

    pub fn with_clock(validity: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            activated_at: RwLock::new(None),
            validity,
            clock,
        }
    }

    /// Records "now" as the activation moment, replacing any earlier one.
    pub fn arm(&self) {
        *self.activated_at.write() = Some(self.clock.now());
        log::info!("Presence gate armed for {}s", self.validity.as_secs());
    }

    pub fn is_armed(&self) -> bool {
        !self.remaining().is_zero()
    }

    /// Time left before the gate disarms; zero when already disarmed.
    pub fn remaining(&self) -> Duration {
        let Some(activated_at) = *self.activated_at.read() else {
            return Duration::ZERO;
        };
        let elapsed = self.clock.now().saturating_duration_since(activated_at);
        self.validity.saturating_sub(elapsed)
    }

    pub fn status(&self) -> PresenceStatus {
        let remaining = self.remaining();
        PresenceStatus {
            armed: !remaining.is_zero(),
            remaining_secs: remaining.as_secs(),
            validity_secs: self.validity.as_secs(),
        }
    }
}

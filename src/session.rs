//! Call session registry: the only shared mutable per-call state.
//!
//! Backed by a sharded `DashMap` so one call's update never waits on
//! another's. Getters hand out snapshots; nothing outside the registry owns a
//! session.

use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::error::CallError;
use crate::mode_selector::ConversationMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initiated,
    Streaming,
    Ended,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    /// Fixed at creation.
    pub mode: ConversationMode,
    pub created_at: Instant,
    pub state: SessionState,
    relay_bound: bool,
    call_ended: bool,
}

impl CallSession {
    fn new(call_id: &str, mode: ConversationMode) -> Self {
        Self {
            call_id: call_id.to_string(),
            mode,
            created_at: Instant::now(),
            state: SessionState::Initiated,
            relay_bound: false,
            call_ended: false,
        }
    }

    pub fn relay_bound(&self) -> bool {
        self.relay_bound
    }
}

#[derive(Default)]
pub struct CallRegistry {
    sessions: DashMap<String, CallSession>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, call_id: &str, mode: ConversationMode) -> Result<CallSession, CallError> {
        match self.sessions.entry(call_id.to_string()) {
            Entry::Occupied(_) => Err(CallError::DuplicateSession(call_id.to_string())),
            Entry::Vacant(slot) => {
                let session = CallSession::new(call_id, mode);
                slot.insert(session.clone());
                log::info!("[{}] Session created ({})", call_id, mode);
                Ok(session)
            }
        }
    }

    pub fn get(&self, call_id: &str) -> Result<CallSession, CallError> {
        self.sessions
            .get(call_id)
            .map(|s| s.clone())
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))
    }

    /// Returns the live session, creating one with `mode` if absent. An
    /// existing session keeps its original mode.
    pub fn get_or_create(&self, call_id: &str, mode: ConversationMode) -> CallSession {
        self.sessions
            .entry(call_id.to_string())
            .or_insert_with(|| {
                log::info!("[{}] Session created on stream connect ({})", call_id, mode);
                CallSession::new(call_id, mode)
            })
            .clone()
    }

    pub fn remove(&self, call_id: &str) {
        if self.sessions.remove(call_id).is_some() {
            log::info!("[{}] Session removed", call_id);
        }
    }

    /// Claims the session for a media relay. Only one relay per session.
    pub fn bind_relay(&self, call_id: &str) -> Result<CallSession, CallError> {
        let mut session = self
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| CallError::NotFound(call_id.to_string()))?;
        if session.relay_bound {
            return Err(CallError::DuplicateSession(call_id.to_string()));
        }
        session.relay_bound = true;
        session.state = SessionState::Streaming;
        Ok(session.clone())
    }

    /// Stream closed. The session goes away if the call already ended.
    pub fn release_relay(&self, call_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(call_id) {
            session.relay_bound = false;
        }
        self.remove_finished(call_id);
    }

    /// Call ended. The session goes away unless a relay still holds it.
    pub fn end_call(&self, call_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(call_id) {
            session.call_ended = true;
            session.state = SessionState::Ended;
        }
        self.remove_finished(call_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn remove_finished(&self, call_id: &str) {
        if self
            .sessions
            .remove_if(call_id, |_, s| s.call_ended && !s.relay_bound)
            .is_some()
        {
            log::info!("[{}] Session closed", call_id);
        }
    }
}

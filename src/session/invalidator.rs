// Session invalidation and the logout signal for the presentation layer

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::store::SessionStore;

/// Notification that the current session is gone and the user must log in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Refresh failed or the server kept rejecting the refreshed token
    Expired { reason: String },
    /// The user logged out explicitly
    SignedOut,
}

/// Clears the store and emits exactly one event per ended session
pub struct SessionInvalidator {
    store: Arc<dyn SessionStore>,
    events: broadcast::Sender<SessionEvent>,
    /// Serializes "is there a session" with "clear it"
    guard: Mutex<()>,
}

impl SessionInvalidator {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            events,
            guard: Mutex::new(()),
        }
    }

    /// Receive future session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// End the session whose access token the server rejected for good.
    ///
    /// Only clears the store while it still holds `rejected_token`; a session
    /// installed by a later refresh or login is left alone. Returns `true` for
    /// the call that actually removed the session, so concurrent or repeated
    /// calls emit a single event.
    pub fn invalidate(&self, rejected_token: &str, reason: &str) -> Result<bool> {
        self.end_session(
            Some(rejected_token),
            SessionEvent::Expired {
                reason: reason.to_string(),
            },
        )
    }

    /// End the session on explicit user request
    pub fn sign_out(&self) -> Result<bool> {
        self.end_session(None, SessionEvent::SignedOut)
    }

    fn end_session(&self, rejected_token: Option<&str>, event: SessionEvent) -> Result<bool> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| anyhow!("invalidator lock poisoned"))?;

        match self.store.get()? {
            None => {
                // Still clear in case a partial session was left behind
                self.store.clear()?;
                return Ok(false);
            }
            Some(current) if rejected_token.is_some_and(|t| t != current.access_token) => {
                tracing::debug!("Session was replaced after the rejection, keeping it");
                return Ok(false);
            }
            Some(_) => {}
        }

        self.store.clear()?;
        tracing::warn!(event = ?event, "Session ended, login required");
        let _ = self.events.send(event);
        Ok(true)
    }
}

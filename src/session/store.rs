// Session storage contract and in-memory implementation

use anyhow::{anyhow, Result};
use std::sync::RwLock;

use super::types::Session;

/// Persistent home of the current session.
///
/// Implementations perform no validation of token shape; whether a token is
/// usable is decided only by server responses. `clear` must be idempotent.
pub trait SessionStore: Send + Sync {
    /// Current session, `None` when logged out
    fn get(&self) -> Result<Option<Session>>;

    /// Replace the current session
    fn set(&self, session: &Session) -> Result<()>;

    /// Remove every session field
    fn clear(&self) -> Result<()>;
}

/// Process-local store, used by tests and short-lived tools
#[derive(Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self) -> Result<Option<Session>> {
        let guard = self
            .session
            .read()
            .map_err(|_| anyhow!("session lock poisoned"))?;
        Ok(guard.clone())
    }

    fn set(&self, session: &Session) -> Result<()> {
        let mut guard = self
            .session
            .write()
            .map_err(|_| anyhow!("session lock poisoned"))?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .session
            .write()
            .map_err(|_| anyhow!("session lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}

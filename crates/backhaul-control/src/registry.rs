//! Connection registry
//!
//! Tracks the live agent sessions on the relay, in registration order, and
//! picks one for each public request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::session::{Session, SessionInfo};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session {0} is already registered")]
    DuplicateSession(String),

    #[error("No sessions available")]
    NoSessionsAvailable,

    #[error("Session limit of {0} reached")]
    SessionLimitReached(usize),
}

/// Which session should serve a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Round-robin over all live sessions
    Any,
    /// A specific session by id
    Id(String),
}

/// Registry of live sessions.
///
/// The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<Vec<Arc<Session>>>,
    cursor: AtomicUsize,
    max_sessions: Option<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of live sessions
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Add a session; fails if its id is already present or the registry is full
    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());

        if sessions.iter().any(|s| s.id() == session.id()) {
            return Err(RegistryError::DuplicateSession(session.id().to_string()));
        }
        if let Some(max) = self.max_sessions {
            if sessions.len() >= max {
                return Err(RegistryError::SessionLimitReached(max));
            }
        }

        info!(
            session_id = %session.id(),
            target = %session.target(),
            total = sessions.len() + 1,
            "Registered session"
        );
        sessions.push(session);
        Ok(())
    }

    /// Remove a session by id; a second call is a no-op
    pub fn unregister(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());

        let index = sessions.iter().position(|s| s.id() == id)?;
        let session = sessions.remove(index);
        info!(session_id = %id, remaining = sessions.len(), "Unregistered session");
        Some(session)
    }

    pub fn select(&self, selection: &Selection) -> Result<Arc<Session>, RegistryError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());

        match selection {
            Selection::Any => {
                if sessions.is_empty() {
                    return Err(RegistryError::NoSessionsAvailable);
                }
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % sessions.len();
                let session = Arc::clone(&sessions[index]);
                debug!(session_id = %session.id(), "Selected session");
                Ok(session)
            }
            Selection::Id(id) => sessions
                .iter()
                .find(|s| s.id() == id)
                .cloned()
                .ok_or(RegistryError::NoSessionsAvailable),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.select(&Selection::Id(id.to_string())).ok()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Current sessions, in registration order
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.snapshot().iter().map(|s| s.info()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.id().to_string()).collect()
    }
}

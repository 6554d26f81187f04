//! Who is online: the nickname → session map shared by every connection.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::protocol::ServerLine;

/// Identifies one accepted connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("nickname is already taken")]
    AlreadyTaken,
    #[error("nickname is not registered to this session")]
    NotFound,
}

/// The outbound path of one session.
///
/// Lines pushed here are queued for the session's writer task, so delivery
/// never waits on the peer's socket.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<String>,
}

impl SessionHandle {
    pub fn new(id: SessionId, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queues `line` for this session. Returns `false` once the session's
    /// writer has gone away.
    pub fn deliver(&self, line: &ServerLine) -> bool {
        self.deliver_encoded(line.to_string())
    }

    fn deliver_encoded(&self, line: String) -> bool {
        match self.outbound.send(line) {
            Ok(()) => true,
            Err(_) => {
                debug!(session = %self.id, "dropping line for closed session");
                false
            }
        }
    }
}

/// Thread-safe registry of active sessions keyed by nickname.
///
/// A `BTreeMap` keeps the `USERS` list in a stable, sorted order. Every
/// read and mutation is a single short critical section; no lock is ever
/// held while a line is delivered.
#[derive(Debug)]
pub struct Registry {
    sessions: RwLock<BTreeMap<String, SessionHandle>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Claims `nickname` for `handle` if nobody holds it yet.
    pub async fn register(
        &self,
        nickname: &str,
        handle: SessionHandle,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        match sessions.entry(nickname.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
            Entry::Occupied(_) => Err(RegistryError::AlreadyTaken),
        }
    }

    /// Moves `session` from `old` to `new` in one step.
    ///
    /// Fails with `NotFound` unless `old` belongs to `session`, and with
    /// `AlreadyTaken` if anyone holds `new`, the caller included.
    pub async fn rename(
        &self,
        session: SessionId,
        old: &str,
        new: &str,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if !sessions.get(old).is_some_and(|handle| handle.id == session) {
            return Err(RegistryError::NotFound);
        }
        if sessions.contains_key(new) {
            return Err(RegistryError::AlreadyTaken);
        }

        if let Some(handle) = sessions.remove(old) {
            sessions.insert(new.to_string(), handle);
        }
        Ok(())
    }

    /// Releases `nickname` if `session` still holds it. Returns whether an
    /// entry was removed; calling it twice is harmless.
    pub async fn unregister(&self, session: SessionId, nickname: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.get(nickname).is_some_and(|handle| handle.id == session) {
            sessions.remove(nickname);
            return true;
        }
        false
    }

    /// Queues `line` for every registered session and returns how many
    /// accepted it.
    pub async fn broadcast(&self, line: &ServerLine) -> usize {
        let recipients: Vec<SessionHandle> =
            self.sessions.read().await.values().cloned().collect();

        let encoded = line.to_string();
        recipients
            .iter()
            .filter(|recipient| recipient.deliver_encoded(encoded.clone()))
            .count()
    }

    /// Queues `line` for the session holding `nickname`.
    pub async fn unicast(
        &self,
        nickname: &str,
        line: &ServerLine,
    ) -> Result<(), RegistryError> {
        let recipient = self.sessions.read().await.get(nickname).cloned();
        match recipient {
            Some(recipient) => {
                // A session that is mid-teardown still counts as delivered.
                recipient.deliver(line);
                Ok(())
            }
            None => Err(RegistryError::NotFound),
        }
    }

    pub async fn snapshot_nicknames(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Sends a fresh `USERS` line to everyone online.
    pub async fn announce_user_list(&self) {
        let users = self.snapshot_nicknames().await;
        self.broadcast(&ServerLine::Users(users)).await;
    }
}

//! Registry of live client sessions.
//!
//! Every accepted connection is registered before its handler starts and
//! removed when its [`Registration`] guard drops, so removal happens exactly
//! once however the handler ends. The registry also owns the per-session
//! close tokens used to force read loops to exit on shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use slab::Slab;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A registered session.
#[derive(Debug)]
pub struct SessionEntry {
    pub session_id: u64,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    close: CancellationToken,
}

/// Live sessions, keyed by slab slot.
///
/// Provides O(1) insert and remove behind a single mutex.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<Slab<SessionEntry>>,
}

impl SessionRegistry {
    /// Create a registry with room for `capacity` sessions before growing.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Slab::with_capacity(capacity)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slab<SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session and return the guard that deregisters it.
    pub fn register(self: &Arc<Self>, session_id: u64, peer: SocketAddr) -> Registration {
        let close = CancellationToken::new();
        let key = self.lock().insert(SessionEntry {
            session_id,
            peer,
            connected_at: Utc::now(),
            close: close.clone(),
        });
        trace!(key, session_id, peer = %peer, "Session registered");

        Registration {
            registry: Arc::clone(self),
            key,
            close,
        }
    }

    fn remove(&self, key: usize) -> Option<SessionEntry> {
        self.lock().try_remove(key)
    }

    /// Signal every registered session to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let sessions = self.lock();
        for (_, entry) in sessions.iter() {
            entry.close.cancel();
        }
        sessions.len()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Session ids and peers of every live session.
    pub fn peers(&self) -> Vec<(u64, SocketAddr)> {
        self.lock()
            .iter()
            .map(|(_, entry)| (entry.session_id, entry.peer))
            .collect()
    }
}

/// Ownership of one registry slot. Dropping it deregisters the session.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<SessionRegistry>,
    key: usize,
    close: CancellationToken,
}

impl Registration {
    /// Token cancelled when the manager wants this session closed.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.remove(self.key) {
            trace!(
                key = self.key,
                session_id = entry.session_id,
                "Session deregistered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_drop() {
        let registry = SessionRegistry::with_capacity(4);
        let r1 = registry.register(1, addr(1000));
        let r2 = registry.register(2, addr(1001));
        assert_eq!(registry.len(), 2);

        drop(r1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.peers(), vec![(2, addr(1001))]);

        drop(r2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_slot_is_not_removed_by_stale_guard() {
        let registry = SessionRegistry::with_capacity(1);
        let r1 = registry.register(1, addr(1000));
        drop(r1);

        // Slot reused by a new session; nothing else may remove it.
        let r2 = registry.register(2, addr(1001));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.peers(), vec![(2, addr(1001))]);
        drop(r2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_all_cancels_every_token() {
        let registry = SessionRegistry::with_capacity(4);
        let regs: Vec<_> = (0..3).map(|i| registry.register(i, addr(2000 + i as u16))).collect();
        let tokens: Vec<_> = regs.iter().map(Registration::close_token).collect();
        assert!(tokens.iter().all(|t| !t.is_cancelled()));

        assert_eq!(registry.close_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));

        // Closing signals; the entries leave when their guards drop.
        assert_eq!(registry.len(), 3);
        drop(regs);
        assert!(registry.is_empty());
    }
}

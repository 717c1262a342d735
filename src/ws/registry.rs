//! In-memory registry of joined connections, indexed by user and by event.
//!
//! Both maps live behind one mutex so a join or leave mutates them
//! atomically. The registry stores only cloned channel senders; the socket
//! itself stays owned by the connection's actor, which is also the only
//! party that ever closes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::ConnectionSender;

/// Process-unique identity for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next connection id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the registry tracks per joined connection.
#[derive(Debug, Clone)]
pub struct Member {
    pub conn_id: ConnId,
    pub user_id: String,
    pub event_id: i64,
    pub sender: ConnectionSender,
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    /// The connection already joined an event on this socket.
    #[error("connection has already joined an event")]
    AlreadyJoined,
}

#[derive(Default)]
struct Maps {
    by_user: HashMap<String, Member>,
    by_event: HashMap<i64, Vec<Member>>,
    // Reverse index so leave() can find a connection without knowing its ids.
    joined: HashMap<ConnId, (String, i64)>,
}

/// Registry of live, joined connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    maps: Mutex<Maps>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `user_id` and `event_id`.
    ///
    /// A second join on the same connection is refused. A join for a user
    /// already registered on another connection removes that prior member
    /// from both maps and returns it; the caller decides what to do with
    /// its transport.
    pub fn join(
        &self,
        conn_id: ConnId,
        user_id: &str,
        event_id: i64,
        sender: ConnectionSender,
    ) -> Result<Option<Member>, RegistryError> {
        let mut maps = self.lock();
        if maps.joined.contains_key(&conn_id) {
            return Err(RegistryError::AlreadyJoined);
        }

        let member = Member {
            conn_id,
            user_id: user_id.to_string(),
            event_id,
            sender,
        };

        let evicted = maps.by_user.insert(user_id.to_string(), member.clone());
        if let Some(prior) = &evicted {
            Self::remove_from_event(&mut maps, prior.event_id, prior.conn_id);
            maps.joined.remove(&prior.conn_id);
        }

        maps.by_event.entry(event_id).or_default().push(member);
        maps.joined.insert(conn_id, (user_id.to_string(), event_id));
        Ok(evicted)
    }

    /// Remove a connection from both maps. Idempotent: returns the removed
    /// member on the call that actually deregistered it, `None` after.
    pub fn leave(&self, conn_id: ConnId) -> Option<Member> {
        let mut maps = self.lock();
        let (user_id, event_id) = maps.joined.remove(&conn_id)?;

        let member = maps.by_user.remove(&user_id);
        Self::remove_from_event(&mut maps, event_id, conn_id);
        member
    }

    /// Snapshot of the connections currently joined to an event.
    pub fn members_of(&self, event_id: i64) -> Vec<Member> {
        self.lock().by_event.get(&event_id).cloned().unwrap_or_default()
    }

    /// The single active connection registered for a user, if any.
    pub fn member_for_user(&self, user_id: &str) -> Option<Member> {
        self.lock().by_user.get(user_id).cloned()
    }

    fn remove_from_event(maps: &mut Maps, event_id: i64, conn_id: ConnId) {
        if let Some(members) = maps.by_event.get_mut(&event_id) {
            members.retain(|m| m.conn_id != conn_id);
            // An emptied room is dropped entirely.
            if members.is_empty() {
                maps.by_event.remove(&event_id);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        // A poisoned lock means a task panicked while holding it; the maps
        // themselves are still coherent, so keep serving.
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
impl ConnectionRegistry {
    fn has_room(&self, event_id: i64) -> bool {
        self.lock().by_event.contains_key(&event_id)
    }
}

//! Per-client adaptive state and the registry that owns it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::ladder::LadderStore;

/// A rate is only picked when the estimate covers it with this much headroom.
pub const HEADROOM: f64 = 1.5;

/// Returned by the selector when no ladder is available.
pub const NO_SELECTION: u64 = 0;

/// Shortest duration used for throughput, so an instant transfer stays finite.
const MIN_TRANSFER_SECS: f64 = 1e-6;

/// Achieved throughput in Kbps for `bytes` moved in `elapsed`.
pub fn throughput_kbps(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(MIN_TRANSFER_SECS);
    (bytes as f64 * 8.0) / (secs * 1000.0)
}

// ============================================================================
// CONNECTION ID
// ============================================================================

/// Identity of one accepted client connection. Ids increase in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// CLIENT SESSION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientSession {
    pub peer: SocketAddr,
    /// Smoothed throughput in Kbps.
    throughput: f64,
    manifest_path: Option<String>,
}

impl ClientSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            throughput: 0.0,
            manifest_path: None,
        }
    }

    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    pub fn manifest_path(&self) -> Option<&str> {
        self.manifest_path.as_deref()
    }

    pub fn bind_manifest(&mut self, path: impl Into<String>) {
        self.manifest_path = Some(path.into());
    }

    /// EWMA update: `alpha * sample + (1 - alpha) * estimate`.
    pub fn update_throughput(&mut self, sample: f64, alpha: f64) {
        self.throughput = alpha * sample + (1.0 - alpha) * self.throughput;
    }

    /// Highest rate the estimate covers with [`HEADROOM`], else the lowest
    /// rate. [`NO_SELECTION`] when no manifest is bound, its ladder is unknown
    /// or the ladder is empty.
    pub fn select_bitrate(&self, ladders: &LadderStore) -> u64 {
        let Some(ladder) = self.manifest_path().and_then(|path| ladders.get(path)) else {
            return NO_SELECTION;
        };

        ladder
            .rates()
            .iter()
            .rev()
            .copied()
            .find(|&rate| self.throughput >= HEADROOM * rate as f64)
            .or_else(|| ladder.lowest())
            .unwrap_or(NO_SELECTION)
    }
}

// ============================================================================
// SESSION REGISTRY
// ============================================================================

/// All live client sessions, iterated in registration order.
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<ConnectionId, ClientSession>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates an id and registers a fresh session under it.
    pub fn open(&self, peer: SocketAddr) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.register(id, ClientSession::new(peer));
        id
    }

    pub fn register(&self, id: ConnectionId, session: ClientSession) {
        self.sessions.lock().insert(id, session);
    }

    /// Snapshot of a session.
    pub fn get(&self, id: ConnectionId) -> Option<ClientSession> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Runs `f` against the live session. `None` if it is gone.
    pub fn update<R>(&self, id: ConnectionId, f: impl FnOnce(&mut ClientSession) -> R) -> Option<R> {
        self.sessions.lock().get_mut(&id).map(f)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ClientSession> {
        self.sessions.lock().remove(&id)
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.sessions.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

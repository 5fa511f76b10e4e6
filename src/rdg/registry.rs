//! Rendezvous registry for legacy half-stream sessions.
//!
//! The legacy protocol opens two HTTP connections: `RDG_OUT_DATA` arrives
//! first and parks its hijacked transport here; `RDG_IN_DATA` arrives
//! second, claims the entry by `Rdg-Connection-Id`, and runs the state
//! machine. WebSocket sessions never touch the registry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::rdg::SharedTransport;

/// How long a parked OUT transport waits for its IN counterpart.
pub const PENDING_TTL: Duration = Duration::from_secs(300);

/// The server→client half of a legacy session waiting for its IN stream.
pub struct PendingSession {
    pub transport_out: SharedTransport,
    pub client_ip: String,
    created_at: Instant,
}

/// Mutex-guarded map from connection id to parked OUT transport. Entries
/// are claimed exactly once; stale entries are pruned on every touch.
pub struct SessionRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingSession>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_ttl(PENDING_TTL)
    }
}

impl SessionRegistry {
    pub fn with_ttl(ttl: Duration) -> Self {
        SessionRegistry {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Park the OUT transport under the connection id, replacing any
    /// previous entry for the same id.
    pub fn register(&self, conn_id: &str, transport_out: SharedTransport, client_ip: String) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, p| now.duration_since(p.created_at) <= self.ttl);
        entries.insert(
            conn_id.to_string(),
            PendingSession {
                transport_out,
                client_ip,
                created_at: now,
            },
        );
    }

    /// Claim the parked session for the connection id, if it exists and
    /// has not expired.
    pub fn take(&self, conn_id: &str) -> Option<PendingSession> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let pending = entries.remove(conn_id)?;
        if now.duration_since(pending.created_at) > self.ttl {
            return None;
        }
        Some(pending)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

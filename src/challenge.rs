//! Server challenge cache for the NTLM exchange.
//!
//! A challenge is issued per connection key when a NEGOTIATE arrives and
//! consumed when the matching AUTHENTICATE is verified. Entries expire
//! after a short TTL; expired entries are pruned opportunistically on
//! issue and discarded on lookup.

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long an issued challenge stays valid.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(120);

struct ChallengeState {
    challenge: [u8; 8],
    issued_at: Instant,
}

/// Mutex-guarded challenge store. Per key there is at most one live
/// challenge; a new issue overwrites the previous one.
pub struct ChallengeCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, ChallengeState>>,
}

impl Default for ChallengeCache {
    fn default() -> Self {
        Self::with_ttl(CHALLENGE_TTL)
    }
}

impl ChallengeCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        ChallengeCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a fresh 8-byte challenge and store it under `key`,
    /// evicting any expired entries first.
    pub fn issue(&self, key: &str) -> [u8; 8] {
        let mut challenge = [0u8; 8];
        OsRng.fill_bytes(&mut challenge);
        let now = Instant::now();

        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, state| now.duration_since(state.issued_at) <= self.ttl);
        entries.insert(
            key.to_string(),
            ChallengeState { challenge, issued_at: now },
        );
        challenge
    }

    /// Remove and return the challenge for `key` if it exists and has not
    /// expired. Expired entries are removed but not returned; a second
    /// take for the same key yields nothing.
    pub fn take(&self, key: &str) -> Option<[u8; 8]> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let state = entries.remove(key)?;
        if now.duration_since(state.issued_at) > self.ttl {
            return None;
        }
        Some(state.challenge)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

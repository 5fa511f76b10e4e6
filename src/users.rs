//! User records and the config-backed policy hooks.
//!
//! The core consumes three interfaces: a credential validator for Basic
//! auth, a lookup by user name for the NTLM exchange, and the target
//! resolution/verification hooks of the session state machine. All are
//! backed by the static tables in the TOML config.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, UserConfig};
use crate::crypto::ntlm_v2_hash;
use crate::rdg::server::GatewayPolicy;

/// An authenticated principal. The NTLMv2 hash is derived once at load
/// time and never recomputed per request.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: String,
    pub ntlm_v2_hash: [u8; 16],
}

struct StoredUser {
    record: UserRecord,
    password: String,
}

/// Static user table.
pub struct UserStore {
    users: Vec<StoredUser>,
}

impl UserStore {
    pub fn from_config(users: &[UserConfig]) -> Self {
        let users = users
            .iter()
            .map(|u| StoredUser {
                record: UserRecord {
                    name: u.username.clone(),
                    ntlm_v2_hash: ntlm_v2_hash(&u.password, &u.username, &u.domain),
                },
                password: u.password.clone(),
            })
            .collect();
        UserStore { users }
    }

    /// Validate Basic credentials, returning the matched record.
    pub fn validate_basic(&self, username: &str, password: &str) -> Option<UserRecord> {
        let normalized = normalize_user(username);
        self.users
            .iter()
            .find(|u| u.record.name.eq_ignore_ascii_case(&normalized) && u.password == password)
            .map(|u| u.record.clone())
    }

    /// Look up a user by name for NTLM verification. The password never
    /// enters this path; only the stored hash does.
    pub fn lookup(&self, name: &str) -> Option<UserRecord> {
        let normalized = normalize_user(name);
        self.users
            .iter()
            .find(|u| u.record.name.eq_ignore_ascii_case(&normalized))
            .map(|u| u.record.clone())
    }
}

/// Strip the `DOMAIN\` prefix and `@realm` suffix from a user name.
pub fn normalize_user(user: &str) -> String {
    let mut user = user.trim();
    if let Some(idx) = user.rfind('\\') {
        user = &user[idx + 1..];
    }
    if let Some(idx) = user.find('@') {
        if idx > 0 {
            user = &user[..idx];
        }
    }
    user.to_string()
}

/// Policy hooks backed by the static `user → target` table.
pub struct StaticPolicy {
    targets: HashMap<String, String>,
}

impl StaticPolicy {
    pub fn from_config(config: &Config) -> Arc<Self> {
        Arc::new(StaticPolicy {
            targets: config.targets.clone(),
        })
    }

    fn target_for(&self, user: &str) -> Option<String> {
        let normalized = normalize_user(user);
        self.targets
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&normalized))
            .map(|(_, target)| target.clone())
    }
}

impl GatewayPolicy for StaticPolicy {
    /// An empty client name is tolerated; otherwise it must match the
    /// authenticated user.
    fn verify_tunnel_auth(&self, user: &str, client_name: &str) -> bool {
        if client_name.is_empty() {
            debug!(user, "empty client name in tunnel auth; allowing");
            return true;
        }
        normalize_user(client_name).eq_ignore_ascii_case(user)
    }

    /// The requested host is ignored: each user lands on their assigned
    /// target.
    fn resolve_target(&self, user: &str, _requested_host: &str) -> Option<String> {
        self.target_for(user)
    }

    fn verify_server(&self, user: &str, host_port: &str) -> bool {
        match self.target_for(user) {
            Some(target) => target.eq_ignore_ascii_case(host_port),
            None => false,
        }
    }
}

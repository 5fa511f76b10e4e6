//! HTTP authentication for the gateway.
//!
//! Routes the `Authorization` header to Basic or NTLM handling. The NTLM
//! three-leg handshake runs at the HTTP layer:
//!   1. Client sends NEGOTIATE in an `Authorization: NTLM <b64>` header
//!   2. Server answers 401 with a CHALLENGE in `WWW-Authenticate`
//!   3. Client repeats the request with an AUTHENTICATE message
//!
//! A challenge is not a failure: it surfaces as `AuthError::Challenge`
//! carrying the ready-made header value, and the dispatcher turns it into
//! the 401 response. `Negotiate` is accepted only as a SPNEGO wrapper
//! around NTLMSSP; there is no Kerberos.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::challenge::ChallengeCache;
use crate::crypto::verify_ntlm_v2;
use crate::error::AuthError;
use crate::ntlm;
use crate::users::{normalize_user, UserStore};

pub struct Authenticator {
    users: Arc<UserStore>,
    challenges: ChallengeCache,
}

impl Authenticator {
    pub fn new(users: Arc<UserStore>) -> Self {
        Authenticator {
            users,
            challenges: ChallengeCache::default(),
        }
    }

    /// Authenticate one request. `challenge_key` ties the NTLM legs of a
    /// connection together (see `challenge_key`); `target_name` seeds the
    /// CHALLENGE message and derives from the Host header.
    pub fn authenticate(
        &self,
        authorization: Option<&str>,
        challenge_key: &str,
        target_name: &str,
    ) -> Result<String, AuthError> {
        let header = authorization.map(str::trim).unwrap_or_default();
        if header.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let (scheme, token) = split_auth_header(header);
        if scheme.eq_ignore_ascii_case("NTLM") || scheme.eq_ignore_ascii_case("Negotiate") {
            return self.authenticate_ntlm(canonical_scheme(scheme), token, challenge_key, target_name);
        }
        if scheme.eq_ignore_ascii_case("Basic") {
            return self.authenticate_basic(token);
        }
        Err(AuthError::MissingCredentials)
    }

    fn authenticate_basic(&self, token: &str) -> Result<String, AuthError> {
        let decoded = BASE64
            .decode(token)
            .map_err(|_| AuthError::InvalidCredentials)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or(AuthError::InvalidCredentials)?;
        let record = self
            .users
            .validate_basic(username, password)
            .ok_or(AuthError::InvalidCredentials)?;
        Ok(record.name)
    }

    fn authenticate_ntlm(
        &self,
        scheme: &'static str,
        token: &str,
        key: &str,
        target_name: &str,
    ) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Challenge(scheme.to_string()));
        }
        let decoded = match BASE64.decode(token) {
            Ok(d) => d,
            Err(e) => {
                debug!(scheme, "token decode failed: {}", e);
                return Err(AuthError::Challenge(scheme.to_string()));
            }
        };

        let ntlm_token: &[u8] = if scheme == "Negotiate" {
            match ntlm::extract_token(&decoded) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Negotiate token missing NTLMSSP payload: {}", e);
                    return Err(AuthError::Challenge(scheme.to_string()));
                }
            }
        } else {
            &decoded
        };

        let msg_type = match ntlm::message_type(ntlm_token) {
            Ok(t) => t,
            Err(e) => {
                debug!("invalid NTLM message: {}", e);
                return Err(AuthError::Challenge(scheme.to_string()));
            }
        };

        match msg_type {
            ntlm::MESSAGE_TYPE_NEGOTIATE => {
                let client_flags = ntlm::parse_negotiate_flags(ntlm_token).ok();
                debug!(key, flags = ?client_flags, "NTLM negotiate");
                Err(self.challenge_error(scheme, key, target_name, client_flags))
            }
            ntlm::MESSAGE_TYPE_AUTHENTICATE => {
                self.verify_authenticate(scheme, ntlm_token, key, target_name)
            }
            _ => Err(AuthError::Challenge(scheme.to_string())),
        }
    }

    fn verify_authenticate(
        &self,
        scheme: &'static str,
        token: &[u8],
        key: &str,
        target_name: &str,
    ) -> Result<String, AuthError> {
        let msg = match ntlm::parse_authenticate(token) {
            Ok(m) => m,
            Err(e) => {
                warn!(key, "invalid NTLM authenticate message: {}", e);
                return Err(self.challenge_error(scheme, key, target_name, None));
            }
        };

        let Some(challenge) = self.challenges.take(key) else {
            warn!(key, "missing NTLM challenge");
            return Err(self.challenge_error(scheme, key, target_name, None));
        };

        let Some(record) = self.users.lookup(&msg.user_name) else {
            warn!(user = %msg.user_name, "NTLM auth failed, unknown user");
            return Err(self.challenge_error(scheme, key, target_name, None));
        };

        if !verify_ntlm_v2(&challenge, &record.ntlm_v2_hash, &msg.nt_response) {
            warn!(
                user = %msg.user_name,
                domain = %msg.domain_name,
                key,
                response_len = msg.nt_response.len(),
                "NTLM auth failed"
            );
            return Err(self.challenge_error(scheme, key, target_name, None));
        }

        Ok(normalize_user(&msg.user_name))
    }

    /// Issue a fresh server challenge and wrap it as the typed error the
    /// dispatcher answers 401 with.
    fn challenge_error(
        &self,
        scheme: &'static str,
        key: &str,
        target_name: &str,
        client_flags: Option<u32>,
    ) -> AuthError {
        let challenge = self.challenges.issue(key);
        let msg = ntlm::build_challenge_message(&challenge, target_name, client_flags);
        debug!(scheme, key, "NTLM auth challenge issued");
        AuthError::Challenge(format!("{} {}", scheme, BASE64.encode(msg)))
    }

    #[cfg(test)]
    pub(crate) fn cached_challenges(&self) -> usize {
        self.challenges.len()
    }
}

/// Split an `Authorization` value at the first whitespace into scheme and
/// token; either part may be empty.
pub fn split_auth_header(header: &str) -> (&str, &str) {
    let header = header.trim();
    match header.split_once(|c: char| c == ' ' || c == '\t') {
        Some((scheme, token)) => (scheme, token.trim()),
        None => (header, ""),
    }
}

fn canonical_scheme(scheme: &str) -> &'static str {
    if scheme.eq_ignore_ascii_case("Negotiate") {
        "Negotiate"
    } else {
        "NTLM"
    }
}

/// Key the challenge cache by connection id when the client provides one,
/// otherwise by peer address.
pub fn challenge_key(conn_id: Option<&str>, remote_addr: &str) -> String {
    match conn_id.map(str::trim) {
        Some(id) if !id.is_empty() => format!("rdg:{}", id),
        _ => format!("remote:{}", remote_addr),
    }
}

/// Derive the NTLM target name from the Host header: port stripped, with
/// a fixed fallback when no usable host is present.
pub fn target_name_from_host(host: Option<&str>) -> String {
    let host = host.map(str::trim).unwrap_or_default();
    let name = if let Some(rest) = host.strip_prefix('[') {
        // bracketed IPv6 literal, with or without a port
        rest.split_once(']').map(|(h, _)| h).unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split_once(':').map(|(h, _)| h).unwrap_or(host)
    } else {
        // bare hostname, or a bare IPv6 literal with no port to strip
        host
    };
    if name.is_empty() {
        ntlm::DEFAULT_TARGET_NAME.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::crypto::{hmac_md5, ntlm_v2_hash};

    fn authenticator() -> Authenticator {
        let store = UserStore::from_config(&[UserConfig {
            username: "testuser".to_string(),
            password: "dogood".to_string(),
            domain: "DOMAIN".to_string(),
        }]);
        Authenticator::new(Arc::new(store))
    }

    fn ntlm_header(token: &[u8]) -> String {
        format!("NTLM {}", BASE64.encode(token))
    }

    /// Pull the 8-byte server challenge back out of a challenge header.
    fn challenge_from_header(header: &str) -> [u8; 8] {
        let (_, token) = split_auth_header(header);
        let msg = BASE64.decode(token).unwrap();
        msg[24..32].try_into().unwrap()
    }

    #[test]
    fn test_missing_credentials() {
        let auth = authenticator();
        assert!(matches!(
            auth.authenticate(None, "rdg:c1", "gw"),
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            auth.authenticate(Some("  "), "rdg:c1", "gw"),
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            auth.authenticate(Some("Bearer xyz"), "rdg:c1", "gw"),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn test_basic_auth() {
        let auth = authenticator();
        let header = format!("Basic {}", BASE64.encode("testuser:dogood"));
        assert_eq!(
            auth.authenticate(Some(&header), "rdg:c1", "gw").unwrap(),
            "testuser"
        );

        let header = format!("Basic {}", BASE64.encode("testuser:wrong"));
        assert!(matches!(
            auth.authenticate(Some(&header), "rdg:c1", "gw"),
            Err(AuthError::InvalidCredentials)
        ));

        assert!(matches!(
            auth.authenticate(Some("Basic %%%"), "rdg:c1", "gw"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_negotiate_message_yields_challenge() {
        let auth = authenticator();
        let mut token = ntlm::build_test_token(ntlm::MESSAGE_TYPE_NEGOTIATE);
        token.extend_from_slice(&0u32.to_le_bytes());

        let err = auth
            .authenticate(Some(&ntlm_header(&token)), "rdg:c1", "gw")
            .unwrap_err();
        let AuthError::Challenge(header) = err else {
            panic!("expected challenge");
        };
        assert!(header.starts_with("NTLM "));
        assert_eq!(auth.cached_challenges(), 1);
    }

    #[test]
    fn test_empty_token_is_bare_challenge() {
        let auth = authenticator();
        let err = auth.authenticate(Some("NTLM"), "rdg:c1", "gw").unwrap_err();
        let AuthError::Challenge(header) = err else {
            panic!("expected challenge");
        };
        // no message was parsed: the challenge carries the bare scheme
        assert_eq!(header, "NTLM");
        assert_eq!(auth.cached_challenges(), 0);
    }

    #[test]
    fn test_full_ntlmv2_exchange() {
        let auth = authenticator();
        let key = "rdg:conn-42";

        // leg 1: NEGOTIATE earns a challenge
        let mut negotiate = ntlm::build_test_token(ntlm::MESSAGE_TYPE_NEGOTIATE);
        negotiate.extend_from_slice(&ntlm::NEGOTIATE_UNICODE.to_le_bytes());
        let err = auth
            .authenticate(Some(&ntlm_header(&negotiate)), key, "gw")
            .unwrap_err();
        let AuthError::Challenge(header) = err else {
            panic!("expected challenge");
        };
        let server_challenge = challenge_from_header(&header);

        // leg 2: compute a valid NTLMv2 response against it
        let hash = ntlm_v2_hash("dogood", "testuser", "DOMAIN");
        let temp = [0x10, 0x20, 0x30, 0x40];
        let proof = hmac_md5(&hash, &[&server_challenge, &temp]);
        let mut nt_response = proof.to_vec();
        nt_response.extend_from_slice(&temp);

        let authenticate =
            ntlm::build_test_authenticate_message("testuser", "DOMAIN", &nt_response, true);
        let user = auth
            .authenticate(Some(&ntlm_header(&authenticate)), key, "gw")
            .unwrap();
        assert_eq!(user, "testuser");
        // the challenge was consumed with the verification
        assert_eq!(auth.cached_challenges(), 0);
    }

    #[test]
    fn test_tampered_response_yields_fresh_challenge() {
        let auth = authenticator();
        let key = "rdg:conn-43";

        let mut negotiate = ntlm::build_test_token(ntlm::MESSAGE_TYPE_NEGOTIATE);
        negotiate.extend_from_slice(&ntlm::NEGOTIATE_UNICODE.to_le_bytes());
        let AuthError::Challenge(header) = auth
            .authenticate(Some(&ntlm_header(&negotiate)), key, "gw")
            .unwrap_err()
        else {
            panic!("expected challenge");
        };
        let server_challenge = challenge_from_header(&header);

        let hash = ntlm_v2_hash("dogood", "testuser", "DOMAIN");
        let temp = [0x10, 0x20, 0x30, 0x40];
        let proof = hmac_md5(&hash, &[&server_challenge, &temp]);
        let mut nt_response = proof.to_vec();
        nt_response.extend_from_slice(&temp);
        nt_response[0] ^= 0x01;

        let authenticate =
            ntlm::build_test_authenticate_message("testuser", "DOMAIN", &nt_response, true);
        let err = auth
            .authenticate(Some(&ntlm_header(&authenticate)), key, "gw")
            .unwrap_err();
        assert!(matches!(err, AuthError::Challenge(_)));
        // the failure re-issued a challenge for the next attempt
        assert_eq!(auth.cached_challenges(), 1);
    }

    #[test]
    fn test_authenticate_without_challenge_yields_challenge() {
        let auth = authenticator();
        let authenticate =
            ntlm::build_test_authenticate_message("testuser", "DOMAIN", &[0u8; 24], true);
        let err = auth
            .authenticate(Some(&ntlm_header(&authenticate)), "rdg:cold", "gw")
            .unwrap_err();
        assert!(matches!(err, AuthError::Challenge(_)));
    }

    #[test]
    fn test_negotiate_scheme_wraps_and_preserves_scheme() {
        let auth = authenticator();
        let mut negotiate = ntlm::build_test_token(ntlm::MESSAGE_TYPE_NEGOTIATE);
        negotiate.extend_from_slice(&0u32.to_le_bytes());

        // SPNEGO-ish wrapper around the NTLMSSP token
        let mut wrapped = vec![0x60, 0x30, 0x06, 0x06, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
        wrapped.extend_from_slice(&negotiate);
        let header = format!("Negotiate {}", BASE64.encode(&wrapped));

        let AuthError::Challenge(challenge) =
            auth.authenticate(Some(&header), "rdg:c1", "gw").unwrap_err()
        else {
            panic!("expected challenge");
        };
        assert!(challenge.starts_with("Negotiate "));

        // a Negotiate token with no NTLMSSP inside fails to a bare challenge
        let header = format!("Negotiate {}", BASE64.encode(b"kerberos-things"));
        let AuthError::Challenge(challenge) =
            auth.authenticate(Some(&header), "rdg:c1", "gw").unwrap_err()
        else {
            panic!("expected challenge");
        };
        assert_eq!(challenge, "Negotiate");
    }

    #[test]
    fn test_split_auth_header() {
        assert_eq!(split_auth_header("NTLM abc"), ("NTLM", "abc"));
        assert_eq!(split_auth_header("NTLM\tabc"), ("NTLM", "abc"));
        assert_eq!(split_auth_header("  NTLM  "), ("NTLM", ""));
        assert_eq!(split_auth_header(""), ("", ""));
    }

    #[test]
    fn test_challenge_key() {
        assert_eq!(challenge_key(Some("abc-123"), "1.2.3.4:55"), "rdg:abc-123");
        assert_eq!(challenge_key(Some("  "), "1.2.3.4:55"), "remote:1.2.3.4:55");
        assert_eq!(challenge_key(None, "1.2.3.4:55"), "remote:1.2.3.4:55");
    }

    #[test]
    fn test_target_name_from_host() {
        assert_eq!(target_name_from_host(Some("gw.example.com:8443")), "gw.example.com");
        assert_eq!(target_name_from_host(Some("gw.example.com")), "gw.example.com");
        assert_eq!(target_name_from_host(Some("[::1]:8443")), "::1");
        assert_eq!(target_name_from_host(Some("::1")), "::1");
        assert_eq!(target_name_from_host(Some("")), "RDPGW");
        assert_eq!(target_name_from_host(None), "RDPGW");
    }
}

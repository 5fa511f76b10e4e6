//! NTLMv2 hash chain and response verification.
//!
//! The NTLMv2 hash is `HMAC-MD5(MD4(UTF-16LE(password)),
//! UTF-16LE(UPPER(user) + domain))`. A client response is the 16-byte
//! proof followed by the "temp" blob; the proof must equal
//! `HMAC-MD5(hash, server_challenge || temp)`.
//!
//! MS-NLMP Section 3.3.2 (NTLM v2 Authentication)

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use subtle::ConstantTimeEq;

use crate::rdg::encode_utf16;

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 over the concatenation of the given parts.
pub fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(key).expect("HMAC accepts any key size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// MD4 of the UTF-16LE password: the classic NT hash.
fn nt_hash(password: &str) -> [u8; 16] {
    let mut hash = Md4::new();
    hash.update(encode_utf16(password));
    hash.finalize().into()
}

/// Derive the NTLMv2 hash for a user. The username is uppercased, the
/// domain is used verbatim.
pub fn ntlm_v2_hash(password: &str, username: &str, domain: &str) -> [u8; 16] {
    let identity = encode_utf16(&format!("{}{}", username.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &[&identity])
}

/// Verify an NTLMv2 response against the issued server challenge.
///
/// `nt_response` is proof (16 bytes) followed by the temp blob. The proof
/// comparison is constant time.
pub fn verify_ntlm_v2(server_challenge: &[u8], ntlm_v2_hash: &[u8], nt_response: &[u8]) -> bool {
    if server_challenge.len() != 8 || nt_response.len() < 16 {
        return false;
    }
    let proof = &nt_response[..16];
    let temp = &nt_response[16..];
    let expected = hmac_md5(ntlm_v2_hash, &[server_challenge, temp]);
    expected[..].ct_eq(proof).into()
}

//! QR token generation
//!
//! A token is the SHA-256 hex digest of the identity id, the current time and
//! 16 random bytes. Verification is a plain equality lookup, so the token
//! carries no structure of its own.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::codec::to_hex;
use crate::record::IdentityId;

/// Length of a token in hex characters
pub const TOKEN_LEN: usize = 64;

/// Generate a fresh, unguessable token for an identity
pub fn generate_token(id: IdentityId) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut hasher = Sha256::new();
    hasher.update(format!("{}-{}-{}", id, nanos, to_hex(&nonce)).as_bytes());
    to_hex(&hasher.finalize())
}

/// Shape check applied before a lookup
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

//! hpfeeds authentication handshake
//!
//! ```text
//! Client                                   Broker
//!   |                                        |
//!   |<------ INFO (name, nonce) -------------|
//!   |                                        |
//!   |------- AUTH (ident, SHA1(nonce+secret))>|
//!   |                                        |
//!   |     [broker looks up ident, compares]  |
//!   |                                        |
//!   |<------ ERROR "authfail" (on mismatch) -|
//! ```
//!
//! There is no explicit success message; a client is authenticated once the
//! broker stops objecting.

use sha1::{Digest, Sha1};

use super::constants::{HASH_SIZE, NONCE_SIZE};

/// Generate a fresh nonce for an INFO frame
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    rand::random()
}

/// Compute the auth hash a client sends for `nonce` and `secret`
pub fn auth_hash(nonce: &[u8], secret: &str) -> [u8; HASH_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(secret.as_bytes());
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Check a client's auth hash against the expected secret
pub fn verify(nonce: &[u8], secret: &str, hash: &[u8]) -> bool {
    let expected = auth_hash(nonce, secret);
    if hash.len() != expected.len() {
        return false;
    }
    // Compare every byte regardless of where the first mismatch is
    expected
        .iter()
        .zip(hash)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_hash_known_value() {
        // SHA1("abc") with the nonce and secret split across the input
        let hash = auth_hash(b"a", "bc");
        assert_eq!(
            hash,
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
                0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }

    #[test]
    fn test_verify() {
        let nonce = generate_nonce();
        let hash = auth_hash(&nonce, "s3cret");

        assert!(verify(&nonce, "s3cret", &hash));
        assert!(!verify(&nonce, "wrong", &hash));
        assert!(!verify(&nonce, "s3cret", &hash[..10]));
        assert!(!verify(&[0, 0, 0, 0], "s3cret", &[0u8; HASH_SIZE]));
    }

    #[test]
    fn test_nonces_differ() {
        // 4 random bytes colliding three times in a row is not a realistic outcome
        let a = generate_nonce();
        let b = generate_nonce();
        let c = generate_nonce();
        assert!(a != b || b != c);
    }
}

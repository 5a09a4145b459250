//! Password hashing and constant-time comparison.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Fixed HMAC key used to blind hashes before comparison, so the comparison
/// itself never touches attacker-influenced bytes directly.
const COMPARE_KEY: &[u8] = b"gantry-password-compare-v1";

/// Hash a password: PBKDF2-HMAC-SHA256, 100 000 iterations, random 16-byte
/// salt, 32-byte output, stored as `base64url(salt).base64url(hash)`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let derived = derive(password, &salt);
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(derived)
    )
}

/// Verify a password against a stored hash string.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_b64, hash_b64)) = stored.split_once('.') else {
        return false;
    };
    let Ok(salt) = URL_SAFE_NO_PAD.decode(salt_b64) else {
        return false;
    };
    let Ok(expected) = URL_SAFE_NO_PAD.decode(hash_b64) else {
        return false;
    };

    let candidate = derive(password, &salt);
    constant_time_eq(
        &hmac_sha256(COMPARE_KEY, &expected),
        &hmac_sha256(COMPARE_KEY, &candidate),
    )
}

fn derive(password: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    out
}

/// HMAC-SHA256 helper shared by the auth stack.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Bytewise constant-time equality.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let stored = hash_password("correct horse battery staple");
        assert!(verify_password("correct horse battery staple", &stored));
        assert!(!verify_password("wrong password", &stored));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("same password");
        let b = hash_password("same password");
        assert_ne!(a, b);
        assert!(verify_password("same password", &a));
        assert!(verify_password("same password", &b));
    }

    #[test]
    fn stored_format_is_salt_dot_hash() {
        let stored = hash_password("pw");
        let (salt, hash) = stored.split_once('.').unwrap();
        assert_eq!(URL_SAFE_NO_PAD.decode(salt).unwrap().len(), SALT_LEN);
        assert_eq!(URL_SAFE_NO_PAD.decode(hash).unwrap().len(), HASH_LEN);
    }

    #[test]
    fn malformed_stored_hash_rejected() {
        assert!(!verify_password("pw", "no-dot-here"));
        assert!(!verify_password("pw", "!!!.###"));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}

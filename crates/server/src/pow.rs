//! Proof-of-work challenge gate.
//!
//! Challenges are `<unixSeconds>:<uuid>` signed with a process-ephemeral
//! HMAC key (regenerated on restart, which invalidates outstanding
//! challenges). A nonce satisfies difficulty `D` when
//! `SHA-256(challenge + nonce)` has `D` leading zero bits. Challenges are
//! one-shot within their TTL; the replay set is process-local.

use crate::password::{constant_time_eq, hmac_sha256};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

/// Challenge lifetime.
const CHALLENGE_TTL_SECS: i64 = 60;

/// Replay-set size that triggers a prune of expired entries.
const REPLAY_PRUNE_THRESHOLD: usize = 1024;

/// An issued challenge.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Challenge {
    pub challenge: String,
    pub difficulty: u32,
}

/// Errors surfaced to the client as 400s.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PowError {
    #[error("malformed challenge")]
    Malformed,
    #[error("challenge signature invalid")]
    BadSignature,
    #[error("challenge expired")]
    Expired,
    #[error("challenge already used")]
    Replayed,
    #[error("nonce does not meet difficulty")]
    InsufficientWork,
}

pub struct PowGate {
    key: [u8; 32],
    difficulty: u32,
    used: Mutex<HashMap<String, i64>>,
}

impl PowGate {
    /// Create a gate with a fresh process-ephemeral signing key.
    pub fn new(difficulty: u32) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            key,
            difficulty: difficulty.clamp(16, 24),
            used: Mutex::new(HashMap::new()),
        }
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Issue a signed challenge: `<ts>:<uuid>:<base64urlHmac>`.
    pub fn issue(&self) -> Challenge {
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let body = format!("{ts}:{}", Uuid::new_v4());
        let sig = URL_SAFE_NO_PAD.encode(hmac_sha256(&self.key, body.as_bytes()));
        Challenge {
            challenge: format!("{body}:{sig}"),
            difficulty: self.difficulty,
        }
    }

    /// Validate a `(challenge, nonce)` pair and consume the challenge.
    pub fn verify(&self, challenge: &str, nonce: &str) -> Result<(), PowError> {
        let mut split = challenge.rsplitn(2, ':');
        let sig_b64 = split.next().ok_or(PowError::Malformed)?;
        let body = split.next().ok_or(PowError::Malformed)?;

        let (ts_str, _uuid) = body.split_once(':').ok_or(PowError::Malformed)?;
        let ts: i64 = ts_str.parse().map_err(|_| PowError::Malformed)?;

        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| PowError::Malformed)?;
        if !constant_time_eq(&sig, &hmac_sha256(&self.key, body.as_bytes())) {
            return Err(PowError::BadSignature);
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if now - ts > CHALLENGE_TTL_SECS || ts - now > CHALLENGE_TTL_SECS {
            return Err(PowError::Expired);
        }

        let mut hasher = Sha256::new();
        hasher.update(challenge.as_bytes());
        hasher.update(nonce.as_bytes());
        let digest = hasher.finalize();
        if leading_zero_bits(&digest) < self.difficulty {
            return Err(PowError::InsufficientWork);
        }

        // One-shot within the TTL.
        let mut used = self.used.lock().expect("replay set lock poisoned");
        if used.contains_key(body) {
            return Err(PowError::Replayed);
        }
        if used.len() >= REPLAY_PRUNE_THRESHOLD {
            used.retain(|_, expiry| *expiry > now);
        }
        used.insert(body.to_string(), ts + CHALLENGE_TTL_SECS);

        Ok(())
    }
}

fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in bytes {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Brute-force a nonce for `challenge`. Test support; difficulty 16 takes
/// ~65k hashes.
pub fn solve(challenge: &str, difficulty: u32) -> String {
    let mut counter: u64 = 0;
    loop {
        let nonce = counter.to_string();
        let mut hasher = Sha256::new();
        hasher.update(challenge.as_bytes());
        hasher.update(nonce.as_bytes());
        if leading_zero_bits(&hasher.finalize()) >= difficulty {
            return nonce;
        }
        counter += 1;
    }
}

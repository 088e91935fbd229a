//! Proof-of-work admission gate for HELLO.
//!
//! Admission cost is a SHA-256 preimage search: the digest of
//! `str(nonce) + node_id` must start with `difficulty_k` hex zero
//! characters. Verification recomputes the digest from the claimed nonce
//! and the *observed* sender id, so a proof mined for one identity cannot
//! be replayed for another.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash algorithm tag accepted on the wire.
pub const POW_HASH_ALG: &str = "sha256";

/// Wire form of a proof-of-work, carried in the HELLO payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowProof {
    pub hash_alg: String,
    pub difficulty_k: u32,
    pub nonce: u64,
    pub digest_hex: String,
}

impl PowProof {
    /// Parse a proof out of an arbitrary JSON value. `None` means the value
    /// does not have the expected shape (which verification treats the same
    /// as an invalid proof).
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

fn digest_hex(nonce: u64, node_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(node_id.as_bytes());
    hex::encode(hasher.finalize())
}

fn leading_hex_zeros(digest: &str) -> u32 {
    digest.chars().take_while(|c| *c == '0').count() as u32
}

/// Mine a proof for `node_id` at difficulty `k`.
///
/// Iterates the nonce from zero, so the result is deterministic for a given
/// identity. At `k == 0` the very first nonce qualifies. Expected work is
/// `16^k` digests; the experiment range (`k <= 5`) completes in well under a
/// second on commodity hardware.
pub fn compute(node_id: &str, k: u32) -> PowProof {
    let mut nonce: u64 = 0;
    loop {
        let digest = digest_hex(nonce, node_id);
        if leading_hex_zeros(&digest) >= k {
            return PowProof {
                hash_alg: POW_HASH_ALG.to_string(),
                difficulty_k: k,
                nonce,
                digest_hex: digest,
            };
        }
        nonce += 1;
    }
}

/// Verify a proof claimed by `sender_id` against the local difficulty.
///
/// All four checks must pass: algorithm tag, exact difficulty match, digest
/// recomputation, and the leading-zero count.
pub fn verify(sender_id: &str, proof: &PowProof, k: u32) -> bool {
    if proof.hash_alg != POW_HASH_ALG {
        return false;
    }
    if proof.difficulty_k != k {
        return false;
    }
    let expected = digest_hex(proof.nonce, sender_id);
    if proof.digest_hex != expected {
        return false;
    }
    leading_hex_zeros(&proof.digest_hex) >= k
}

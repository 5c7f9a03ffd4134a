//! Content hash of an effective policy.
//!
//! Every decision entry records which policy produced it; the hash lets an
//! auditor tell two decisions apart when the documents changed in between.

use sha2::{Digest, Sha256};

use super::merge::EffectivePolicy;

/// Number of hex characters kept in the version string
const VERSION_HEX_LEN: usize = 16;

/// Compute `sha256:<16 hex>` over the canonical JSON form of the policy.
///
/// The `version` field itself is excluded so the hash is stable.
pub fn policy_version(policy: &EffectivePolicy) -> String {
    let mut unversioned = policy.clone();
    unversioned.version = String::new();

    let mut hasher = Sha256::new();
    match serde_json::to_vec(&unversioned) {
        Ok(bytes) => hasher.update(&bytes),
        Err(e) => {
            tracing::warn!("Failed to serialize policy for hashing: {}", e);
            hasher.update(format!("{:?}", unversioned).as_bytes());
        }
    }
    let digest = hex::encode(hasher.finalize());
    format!("sha256:{}", &digest[..VERSION_HEX_LEN])
}

/// Check that a policy's recorded version matches its content
pub fn verify(policy: &EffectivePolicy) -> bool {
    policy_version(policy) == policy.version
}

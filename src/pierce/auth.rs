use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

// Hex chars of the digest kept in a trial key.
const DIGEST_PREFIX_LEN: usize = 16;

/// Whether a presented key grants access: either the server key itself, or
/// a trial key derived from it that has not expired.
pub fn check_key(server_key: &str, presented: &str) -> bool {
    let server_key = server_key.trim();
    let presented = presented.trim();
    if server_key.is_empty() || presented.is_empty() {
        return false;
    }
    if presented == server_key {
        return true;
    }
    check_trial_key(server_key, presented)
}

/// A trial key is `<digest prefix>-<unix expiry seconds>` where the digest
/// is sha256 of `seed:expiry`. Anyone holding the server key can mint one;
/// the relay verifies it without any stored state.
pub fn generate_key(seed: &str, valid_for: Duration) -> String {
    let expiry = unix_now() + valid_for.as_secs();
    format!("{}-{expiry}", digest_prefix(seed.trim(), expiry))
}

/// Expiry of a trial key as a unix timestamp, if it parses as one.
pub fn key_expiry(key: &str) -> Option<u64> {
    let (_, expiry) = key.trim().rsplit_once('-')?;
    expiry.parse().ok()
}

fn check_trial_key(seed: &str, presented: &str) -> bool {
    let Some((prefix, expiry)) = presented.rsplit_once('-') else {
        return false;
    };
    let Ok(expiry) = expiry.parse::<u64>() else {
        return false;
    };
    if expiry <= unix_now() {
        return false;
    }
    prefix == digest_prefix(seed, expiry)
}

fn digest_prefix(seed: &str, expiry: u64) -> String {
    let digest = Sha256::digest(format!("{seed}:{expiry}").as_bytes());
    hex::encode(digest)[..DIGEST_PREFIX_LEN].to_string()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

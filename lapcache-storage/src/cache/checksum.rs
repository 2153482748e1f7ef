//! Integrity digest for stored payloads.
//!
//! xxHash64 is fast, single-pass and order-sensitive. It only guards against
//! local corruption; it is not a security boundary.

use xxhash_rust::xxh64::xxh64;

/// Seed mixed into every digest. Changing it invalidates every stored checksum.
const DIGEST_SEED: u64 = 0x4c41_5043_4143_4845;

/// Digest a payload into a 16-character lowercase hex string.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:016x}", xxh64(bytes, DIGEST_SEED))
}

/// Check a payload against a stored digest.
pub fn verify(bytes: &[u8], expected: &str) -> bool {
    digest(bytes) == expected
}

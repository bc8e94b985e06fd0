/// Keccak-256 helpers for cache-key derivation.
///
/// Digests are rendered as lowercase, 0x-prefixed hex so that truncated
/// prefixes line up with keys written by the browser frontend.
use alloy::primitives::keccak256;

/// Hash arbitrary data and return the full 0x-prefixed hex digest.
pub fn keccak_hex(data: &[u8]) -> String {
    format!("{:#x}", keccak256(data))
}

/// First `width` characters of the 0x-prefixed digest (prefix included).
pub fn short_keccak(data: &[u8], width: usize) -> String {
    let mut digest = keccak_hex(data);
    digest.truncate(width);
    digest
}

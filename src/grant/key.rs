/// Cache-key derivation for issued grants.
///
/// Keys have the shape
/// `{namespace}_{signer}_{contracts-hash}[_{public-key-hash}]`, where the
/// hashes are 10-character (0x + 8 hex) keccak prefixes. Scope matching is
/// exact: a grant for `{A, B, C}` is stored under a different key than one
/// for `{A, B}`.
use std::fmt;

use alloy::primitives::Address;

use crate::crypto::hash::short_keccak;

/// Width of the truncated digests embedded in a key.
pub const DIGEST_PREFIX_LEN: usize = 10;

/// Deterministic identifier of a stored grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Sorted, deduplicated copy of a contract scope.
///
/// `Address` ordering is byte ordering, which matches the ordering of the
/// lowercase hex forms.
pub fn normalize_contracts(contracts: &[Address]) -> Vec<Address> {
    let mut sorted = contracts.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

/// Derive the cache key for `(signer, contracts, public_key)`.
pub fn derive(
    namespace: &str,
    signer: &Address,
    contracts: &[Address],
    public_key: Option<&str>,
) -> CacheKey {
    let joined = normalize_contracts(contracts)
        .iter()
        .map(|c| format!("{c:#x}"))
        .collect::<Vec<_>>()
        .join(",");

    let mut key = format!(
        "{namespace}_{signer:#x}_{}",
        short_keccak(joined.as_bytes(), DIGEST_PREFIX_LEN)
    );
    if let Some(pk) = public_key {
        key.push('_');
        key.push_str(&short_keccak(pk.as_bytes(), DIGEST_PREFIX_LEN));
    }
    CacheKey(key)
}

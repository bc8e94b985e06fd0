/// Runtime configuration for the authorization lifecycle.
///
/// All structs deserialize from JSON and carry defaults matching the
/// exam frontend (365-day grants, Sepolia decryption domain).
use std::path::PathBuf;

use alloy::primitives::{address, Address};
use serde::{Deserialize, Serialize};

/// Default lifetime of an issued grant, in days.
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Namespace tag that prefixes every derived cache key.
pub const DEFAULT_KEY_NAMESPACE: &str = "fhevm_decryption_signature";

/// Policy for issuing and caching grants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GrantConfig {
    /// Validity window written into every new grant.
    pub validity_days: u32,
    /// Namespace tag used by the key deriver.
    pub key_namespace: String,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            validity_days: DEFAULT_VALIDITY_DAYS,
            key_namespace: DEFAULT_KEY_NAMESPACE.to_string(),
        }
    }
}

/// Which cache backend the store factory should try first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    File,
}

/// Cache store selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Directory holding one file per cached grant (file backend only).
    pub dir: PathBuf,
    /// Prefix applied to every stored entry so unrelated data never collides.
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            dir: PathBuf::from(".fhevm-grant"),
            namespace: "anonexam_".to_string(),
        }
    }
}

/// EIP-712 domain of the decryption verifier contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct DomainConfig {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: "Decryption".to_string(),
            version: "1".to_string(),
            chain_id: 11_155_111,
            verifying_contract: address!("5ffdaAB0373E62E2ea2944776209aEf29E631A64"),
        }
    }
}

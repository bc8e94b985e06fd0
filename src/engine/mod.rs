/// Decryption engine abstraction.
///
/// The engine is supplied by the surrounding FHE runtime: it generates
/// ephemeral keypairs, builds the grant message for its verifier domain,
/// and performs the actual user decryption once a signed grant exists.
pub mod local;

use std::collections::HashMap;

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::keys::EphemeralKeyPair;
use crate::crypto::sensitive::SensitiveString;
use crate::error::Result;
use crate::grant::message::StructuredMessage;

/// One encrypted value to decrypt, identified by its ciphertext handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleRequest {
    pub handle: String,
    pub contract_address: Address,
}

impl HandleRequest {
    pub fn new(handle: impl Into<String>, contract_address: Address) -> Self {
        Self {
            handle: handle.into(),
            contract_address,
        }
    }
}

/// A decrypted plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearValue {
    Bool(bool),
    Uint(U256),
    Address(Address),
    Bytes(Bytes),
}

/// Everything the engine needs from a grant to run a user decryption.
#[derive(Debug, Clone, Copy)]
pub struct UserDecryptParams<'a> {
    pub private_key: &'a SensitiveString,
    pub public_key: &'a str,
    pub signature: &'a Bytes,
    pub contracts: &'a [Address],
    pub user_address: Address,
    pub start_timestamp: u64,
    pub duration_days: u32,
}

#[async_trait]
pub trait DecryptionEngine: Send + Sync {
    /// Produce a fresh ephemeral keypair.
    fn generate_keypair(&self) -> Result<EphemeralKeyPair>;

    /// Build the grant message for this engine's verifier domain.
    fn create_structured_message(
        &self,
        public_key: &str,
        contracts: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> Result<StructuredMessage>;

    /// Decrypt the requested handles, returning plaintexts keyed by handle.
    async fn decrypt(
        &self,
        requests: &[HandleRequest],
        params: &UserDecryptParams<'_>,
    ) -> Result<HashMap<String, ClearValue>>;
}

/// Decryption authorizations ("grants").
///
/// A grant is an immutable, user-signed permission to decrypt values held
/// by a fixed set of contracts, bound to a fresh ephemeral keypair and a
/// validity window. Refreshing a grant always produces a new value.
///
/// Persisted layout (JSON):
/// `publicKey, privateKey, signature, startTimestamp, durationDays,
/// userAddress, contractAddresses, eip712`.
pub mod key;
pub mod manager;
pub mod message;

use alloy::primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::crypto::keys::EphemeralKeyPair;
use crate::crypto::sensitive::SensitiveString;
use crate::crypto::sign::recover_signer;
use crate::engine::{DecryptionEngine, UserDecryptParams};
use crate::error::{GrantError, Result};
use crate::signer::StructuredSigner;

use self::key::normalize_contracts;
use self::message::StructuredMessage;

pub const SECONDS_PER_DAY: u64 = 86_400;

/// Unix second at which a window starting at `start` stops being valid.
pub fn expires_at(start: u64, duration_days: u32) -> u64 {
    start.saturating_add(u64::from(duration_days) * SECONDS_PER_DAY)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DecryptionAuthorization {
    public_key: String,
    private_key: SensitiveString,
    signature: Bytes,
    #[serde(rename = "startTimestamp")]
    issued_at: u64,
    duration_days: u32,
    #[serde(rename = "userAddress")]
    granted_by: Address,
    #[serde(rename = "contractAddresses")]
    contracts: Vec<Address>,
    #[serde(rename = "eip712")]
    message: StructuredMessage,
}

impl DecryptionAuthorization {
    /// Issue a new grant: build the message, then ask the user to sign it.
    pub async fn issue(
        engine: &dyn DecryptionEngine,
        signer: Option<&dyn StructuredSigner>,
        contracts: &[Address],
        key_pair: EphemeralKeyPair,
        issued_at: u64,
        duration_days: u32,
    ) -> Result<Self> {
        let signer = signer.ok_or(GrantError::SignerUnavailable)?;
        let granted_by = signer.address().await?;
        Self::issue_as(engine, signer, granted_by, contracts, key_pair, issued_at, duration_days)
            .await
    }

    /// `issue` for a signer whose address the caller already resolved.
    ///
    /// This is the only place a signature prompt originates. The signature
    /// must recover to `granted_by`; a wallet that switched accounts in
    /// between yields `SignerMismatch`.
    pub async fn issue_as(
        engine: &dyn DecryptionEngine,
        signer: &dyn StructuredSigner,
        granted_by: Address,
        contracts: &[Address],
        key_pair: EphemeralKeyPair,
        issued_at: u64,
        duration_days: u32,
    ) -> Result<Self> {
        let contracts = normalize_contracts(contracts);
        if contracts.is_empty() {
            return Err(GrantError::EmptyScope);
        }

        let message = engine.create_structured_message(
            &key_pair.public_key,
            &contracts,
            issued_at,
            duration_days,
        )?;
        message.validate()?;
        if !message.binds(&key_pair.public_key, &contracts, issued_at, duration_days) {
            return Err(GrantError::InvalidMessage(
                "engine message does not match the requested grant".into(),
            ));
        }

        info!(
            signer = %granted_by,
            contracts = contracts.len(),
            duration_days,
            "Requesting user signature for decryption grant"
        );
        let signature = signer.sign_structured_message(&message).await?;

        let signed_by = recover_signer(&message.signing_hash()?, &signature)?;
        if signed_by != granted_by {
            warn!(expected = %granted_by, actual = %signed_by, "Grant signed by a different account");
            return Err(GrantError::SignerMismatch);
        }
        info!(signer = %granted_by, "User signature obtained");

        let EphemeralKeyPair {
            public_key,
            private_key,
        } = key_pair;

        Ok(Self {
            public_key,
            private_key,
            signature,
            issued_at,
            duration_days,
            granted_by,
            contracts,
            message,
        })
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Ephemeral private key. Hand this only to the decryption engine.
    pub fn private_key(&self) -> &SensitiveString {
        &self.private_key
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }

    pub fn duration_days(&self) -> u32 {
        self.duration_days
    }

    pub fn granted_by(&self) -> Address {
        self.granted_by
    }

    /// Sorted, deduplicated contract scope.
    pub fn contracts(&self) -> &[Address] {
        &self.contracts
    }

    pub fn message(&self) -> &StructuredMessage {
        &self.message
    }

    pub fn expires_at(&self) -> u64 {
        expires_at(self.issued_at, self.duration_days)
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at()
    }

    /// Validity against the system clock, evaluated at call time.
    pub fn is_currently_valid(&self) -> bool {
        self.is_valid_at(SystemClock.now())
    }

    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at().saturating_sub(now)
    }

    pub fn covers(&self, contract: &Address) -> bool {
        self.contracts.binary_search(contract).is_ok()
    }

    /// Recompute the EIP-712 digest and check it recovers to `granted_by`.
    pub fn verify_signature(&self) -> Result<()> {
        let digest = self.message.signing_hash()?;
        if recover_signer(&digest, &self.signature)? != self.granted_by {
            return Err(GrantError::SignatureVerification);
        }
        Ok(())
    }

    pub fn decrypt_params(&self) -> UserDecryptParams<'_> {
        UserDecryptParams {
            private_key: &self.private_key,
            public_key: &self.public_key,
            signature: &self.signature,
            contracts: &self.contracts,
            user_address: self.granted_by,
            start_timestamp: self.issued_at,
            duration_days: self.duration_days,
        }
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| GrantError::Serialization(e.to_string()))
    }

    /// Parse a stored record. Anything that doesn't describe a
    /// self-consistent grant is a `CorruptCacheEntry`.
    pub fn deserialize(raw: &str) -> Result<Self> {
        let auth: Self = serde_json::from_str(raw)
            .map_err(|e| GrantError::CorruptCacheEntry(e.to_string()))?;

        if auth.contracts.is_empty() || auth.contracts != normalize_contracts(&auth.contracts) {
            return Err(GrantError::CorruptCacheEntry(
                "contract scope is empty or not normalized".into(),
            ));
        }
        if auth.signature.len() != 65 {
            return Err(GrantError::CorruptCacheEntry(format!(
                "signature is {} bytes",
                auth.signature.len()
            )));
        }
        auth.message
            .validate()
            .map_err(|e| GrantError::CorruptCacheEntry(e.to_string()))?;
        if !auth.message.binds(
            &auth.public_key,
            &auth.contracts,
            auth.issued_at,
            auth.duration_days,
        ) {
            return Err(GrantError::CorruptCacheEntry(
                "signed message does not match record".into(),
            ));
        }
        Ok(auth)
    }
}

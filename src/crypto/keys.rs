/// Ephemeral keypairs used for user decryption.
///
/// A fresh keypair is generated per authorization and is never derived
/// from the wallet key. The private half only ever goes to the local
/// decryption engine.
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use super::sensitive::SensitiveString;
use crate::error::{GrantError, Result};

/// Hex-encoded (0x-prefixed) ephemeral keypair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralKeyPair {
    pub public_key: String,
    pub private_key: SensitiveString,
}

impl EphemeralKeyPair {
    /// Generate a fresh X25519 keypair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from its hex-encoded private half.
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let raw = hex::decode(private_key.trim_start_matches("0x"))
            .map_err(|e| GrantError::KeyGeneration(format!("Invalid private key encoding: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| GrantError::KeyGeneration("Private key must be 32 bytes".into()))?;
        Ok(Self::from_secret(StaticSecret::from(bytes)))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            public_key: format!("0x{}", hex::encode(public.as_bytes())),
            private_key: SensitiveString::new(format!("0x{}", hex::encode(secret.to_bytes()))),
        }
    }
}

/// Signer backed by a local secp256k1 key.
///
/// Signs without any prompt. Useful for scripts, bots and tests; browser
/// wallets go through `RpcWalletSigner` instead.
use alloy::primitives::{Address, Bytes};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;

use super::StructuredSigner;
use crate::crypto::sign::sign_prehash;
use crate::error::{GrantError, Result};
use crate::grant::message::StructuredMessage;

pub struct LocalWalletSigner {
    inner: PrivateKeySigner,
}

impl LocalWalletSigner {
    pub fn new(inner: PrivateKeySigner) -> Self {
        Self { inner }
    }

    /// Parse a hex private key (with or without 0x prefix).
    pub fn from_hex(private_key_hex: &str) -> Result<Self> {
        let inner: PrivateKeySigner = private_key_hex
            .parse()
            .map_err(|e| GrantError::SignerFailed(format!("Invalid private key: {e}")))?;
        Ok(Self { inner })
    }

    pub fn random() -> Self {
        Self {
            inner: PrivateKeySigner::random(),
        }
    }

    pub fn wallet_address(&self) -> Address {
        self.inner.address()
    }
}

#[async_trait]
impl StructuredSigner for LocalWalletSigner {
    async fn address(&self) -> Result<Address> {
        Ok(self.inner.address())
    }

    async fn sign_structured_message(&self, message: &StructuredMessage) -> Result<Bytes> {
        let digest = message.signing_hash()?;
        sign_prehash(&self.inner, &digest).await
    }
}

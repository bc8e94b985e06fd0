/// Structured-data signers.
///
/// A signer owns the user's wallet identity. Signing a grant normally
/// requires interactive approval, so implementations may suspend for a
/// long time and may be declined.
pub mod local;
pub mod rpc;

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;

use crate::error::Result;
use crate::grant::message::StructuredMessage;

#[async_trait]
pub trait StructuredSigner: Send + Sync {
    /// Address of the wallet that will sign.
    async fn address(&self) -> Result<Address>;

    /// Sign the EIP-712 payload, returning the 65-byte signature.
    ///
    /// Fails with `SignatureDeclined` when the user rejects the prompt and
    /// with `SignerFailed` on transport errors.
    async fn sign_structured_message(&self, message: &StructuredMessage) -> Result<Bytes>;
}

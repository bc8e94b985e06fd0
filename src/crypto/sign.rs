/// secp256k1 signing and recovery over EIP-712 digests.
///
/// Signatures are the 65-byte `r || s || v` encoding that wallets return
/// from `eth_signTypedData_v4`.
use alloy::primitives::{Address, Bytes, Signature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;

use crate::error::{GrantError, Result};

/// Sign a precomputed digest with a local wallet key.
pub async fn sign_prehash(signer: &PrivateKeySigner, digest: &B256) -> Result<Bytes> {
    let sig = signer
        .sign_hash(digest)
        .await
        .map_err(|e| GrantError::SignerFailed(format!("Local signing failed: {e}")))?;
    Ok(Bytes::copy_from_slice(&sig.as_bytes()))
}

/// Recover the address that produced `signature` over `digest`.
pub fn recover_signer(digest: &B256, signature: &[u8]) -> Result<Address> {
    let sig = Signature::from_raw(signature).map_err(|_| GrantError::SignatureVerification)?;
    sig.recover_address_from_prehash(digest)
        .map_err(|_| GrantError::SignatureVerification)
}

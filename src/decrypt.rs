/// User decryption at the call site.
///
/// Checks a grant against the current moment, the current signer and the
/// requested handles before handing it to the engine. The grant itself
/// is never modified.
use std::collections::HashMap;

use alloy::primitives::Address;
use tracing::debug;

use crate::engine::{ClearValue, DecryptionEngine, HandleRequest};
use crate::error::{GrantError, Result};
use crate::grant::DecryptionAuthorization;

pub async fn user_decrypt(
    engine: &dyn DecryptionEngine,
    authorization: &DecryptionAuthorization,
    signer_address: Address,
    requests: &[HandleRequest],
    now: u64,
) -> Result<HashMap<String, ClearValue>> {
    if !authorization.is_valid_at(now) {
        return Err(GrantError::Expired);
    }
    if authorization.granted_by() != signer_address {
        return Err(GrantError::SignerMismatch);
    }
    if let Some(req) = requests
        .iter()
        .find(|r| !authorization.covers(&r.contract_address))
    {
        return Err(GrantError::OutOfScope(req.contract_address));
    }
    if requests.is_empty() {
        return Ok(HashMap::new());
    }

    debug!(
        signer = %signer_address,
        handles = requests.len(),
        "Decrypting with cached grant"
    );
    engine
        .decrypt(requests, &authorization.decrypt_params())
        .await
}

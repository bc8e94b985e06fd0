/// In-process decryption engine for development and tests.
///
/// Plays the part of the FHEVM relayer + KMS: values are "sealed" under a
/// handle together with the contract that owns them and the users allowed
/// to read them. `decrypt` enforces the checks the real KMS performs on a
/// user-decrypt request before releasing plaintexts.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use alloy::primitives::Address;
use async_trait::async_trait;
use tracing::debug;

use super::{ClearValue, DecryptionEngine, HandleRequest, UserDecryptParams};
use crate::clock::Clock;
use crate::config::DomainConfig;
use crate::crypto::keys::EphemeralKeyPair;
use crate::crypto::sign::recover_signer;
use crate::error::{GrantError, Result};
use crate::grant::expires_at;
use crate::grant::message::{MessageDomain, StructuredMessage};

#[derive(Debug, Clone)]
struct SealedValue {
    contract: Address,
    value: ClearValue,
    readers: HashSet<Address>,
}

pub struct LocalEngine {
    domain: MessageDomain,
    clock: Arc<dyn Clock>,
    sealed: RwLock<HashMap<String, SealedValue>>,
}

impl LocalEngine {
    pub fn new(domain: &DomainConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            domain: MessageDomain::from(domain),
            clock,
            sealed: RwLock::new(HashMap::new()),
        }
    }

    /// Register a confidential value readable by `readers`.
    pub fn seal(
        &self,
        handle: impl Into<String>,
        contract: Address,
        value: ClearValue,
        readers: &[Address],
    ) {
        let entry = SealedValue {
            contract,
            value,
            readers: readers.iter().copied().collect(),
        };
        self.sealed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.into(), entry);
    }

    fn check_keypair(params: &UserDecryptParams<'_>) -> Result<()> {
        let derived = EphemeralKeyPair::from_private_key(params.private_key.expose())
            .map_err(|e| GrantError::Decryption(e.to_string()))?;
        if !derived.public_key.eq_ignore_ascii_case(params.public_key) {
            return Err(GrantError::Decryption(
                "private key does not match public key".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DecryptionEngine for LocalEngine {
    fn generate_keypair(&self) -> Result<EphemeralKeyPair> {
        Ok(EphemeralKeyPair::generate())
    }

    fn create_structured_message(
        &self,
        public_key: &str,
        contracts: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> Result<StructuredMessage> {
        if contracts.is_empty() {
            return Err(GrantError::EmptyScope);
        }
        Ok(StructuredMessage::new(
            self.domain.clone(),
            public_key,
            contracts,
            start_timestamp,
            duration_days,
        ))
    }

    async fn decrypt(
        &self,
        requests: &[HandleRequest],
        params: &UserDecryptParams<'_>,
    ) -> Result<HashMap<String, ClearValue>> {
        let message = self.create_structured_message(
            params.public_key,
            params.contracts,
            params.start_timestamp,
            params.duration_days,
        )?;
        let recovered = recover_signer(&message.signing_hash()?, params.signature)?;
        if recovered != params.user_address {
            return Err(GrantError::SignatureVerification);
        }

        if self.clock.now() >= expires_at(params.start_timestamp, params.duration_days) {
            return Err(GrantError::Expired);
        }

        Self::check_keypair(params)?;

        let scope = &message.body().contract_addresses;
        let sealed = self.sealed.read().unwrap_or_else(|e| e.into_inner());

        let mut out = HashMap::with_capacity(requests.len());
        for req in requests {
            if !scope.contains(&req.contract_address) {
                return Err(GrantError::OutOfScope(req.contract_address));
            }
            let entry = sealed
                .get(&req.handle)
                .ok_or_else(|| GrantError::Decryption(format!("Unknown handle {}", req.handle)))?;
            if entry.contract != req.contract_address {
                return Err(GrantError::Decryption(format!(
                    "Handle {} does not belong to {}",
                    req.handle, req.contract_address
                )));
            }
            if !entry.readers.contains(&params.user_address) {
                return Err(GrantError::Decryption(format!(
                    "{} is not allowed to read {}",
                    params.user_address, req.handle
                )));
            }
            out.insert(req.handle.clone(), entry.value.clone());
        }

        debug!(
            user = %params.user_address,
            handles = out.len(),
            "User decryption served"
        );
        Ok(out)
    }
}

/// Typed EIP-712 message that a user signs to grant decryption rights.
///
/// The message binds the ephemeral public key, the contract scope and the
/// validity window. It is kept verbatim inside every authorization so the
/// signature can be re-verified later.
use std::borrow::Cow;
use std::str::FromStr;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolStruct};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::key::normalize_contracts;
use crate::config::DomainConfig;
use crate::error::{GrantError, Result};

/// Bumped whenever the signed field list changes.
pub const SCHEMA_VERSION: u32 = 1;

pub const PRIMARY_TYPE: &str = "UserDecryptRequestVerification";

sol! {
    /// On-chain shape of the decryption grant, as checked by the KMS.
    #[derive(Debug, PartialEq, Eq)]
    struct UserDecryptRequestVerification {
        bytes publicKey;
        address[] contractAddresses;
        uint256 startTimestamp;
        uint256 durationDays;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl From<&DomainConfig> for MessageDomain {
    fn from(cfg: &DomainConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            version: cfg.version.clone(),
            chain_id: cfg.chain_id,
            verifying_contract: cfg.verifying_contract,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl TypedField {
    fn new(name: &str, ty: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: ty.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTypes {
    #[serde(rename = "UserDecryptRequestVerification")]
    pub user_decrypt_request_verification: Vec<TypedField>,
}

impl MessageTypes {
    /// The only field list this crate signs or accepts.
    pub fn canonical() -> Self {
        Self {
            user_decrypt_request_verification: vec![
                TypedField::new("publicKey", "bytes"),
                TypedField::new("contractAddresses", "address[]"),
                TypedField::new("startTimestamp", "uint256"),
                TypedField::new("durationDays", "uint256"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub public_key: String,
    pub contract_addresses: Vec<Address>,
    pub start_timestamp: u64,
    pub duration_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    pub schema_version: u32,
    pub domain: MessageDomain,
    pub types: MessageTypes,
    pub message: MessageBody,
}

/// Structured-signing payload, tagged by its EIP-712 primary type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "primaryType")]
pub enum StructuredMessage {
    UserDecryptRequestVerification(DecryptRequest),
}

impl StructuredMessage {
    /// Build the canonical grant message. Contracts are sorted and deduplicated.
    pub fn new(
        domain: MessageDomain,
        public_key: &str,
        contracts: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> Self {
        StructuredMessage::UserDecryptRequestVerification(DecryptRequest {
            schema_version: SCHEMA_VERSION,
            domain,
            types: MessageTypes::canonical(),
            message: MessageBody {
                public_key: public_key.to_string(),
                contract_addresses: normalize_contracts(contracts),
                start_timestamp,
                duration_days,
            },
        })
    }

    pub fn request(&self) -> &DecryptRequest {
        match self {
            StructuredMessage::UserDecryptRequestVerification(req) => req,
        }
    }

    pub fn domain(&self) -> &MessageDomain {
        &self.request().domain
    }

    pub fn body(&self) -> &MessageBody {
        &self.request().message
    }

    /// Reject payloads whose schema differs from the one this build signs.
    pub fn validate(&self) -> Result<()> {
        let req = self.request();
        if req.schema_version != SCHEMA_VERSION {
            return Err(GrantError::InvalidMessage(format!(
                "unsupported schema version {}",
                req.schema_version
            )));
        }
        if req.types != MessageTypes::canonical() {
            return Err(GrantError::InvalidMessage(
                "unexpected type schema".to_string(),
            ));
        }
        Ok(())
    }

    /// True if the message signs exactly this key, scope and window.
    pub fn binds(
        &self,
        public_key: &str,
        contracts: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> bool {
        let body = self.body();
        body.public_key == public_key
            && body.contract_addresses == contracts
            && body.start_timestamp == start_timestamp
            && body.duration_days == duration_days
    }

    pub fn eip712_domain(&self) -> Eip712Domain {
        let d = self.domain();
        Eip712Domain::new(
            Some(Cow::Owned(d.name.clone())),
            Some(Cow::Owned(d.version.clone())),
            Some(U256::from(d.chain_id)),
            Some(d.verifying_contract),
            None,
        )
    }

    pub fn to_sol(&self) -> Result<UserDecryptRequestVerification> {
        let body = self.body();
        let public_key = Bytes::from_str(&body.public_key)
            .map_err(|e| GrantError::InvalidMessage(format!("public key is not hex: {e}")))?;
        Ok(UserDecryptRequestVerification {
            publicKey: public_key,
            contractAddresses: body.contract_addresses.clone(),
            startTimestamp: U256::from(body.start_timestamp),
            durationDays: U256::from(body.duration_days),
        })
    }

    /// EIP-712 digest that the wallet signs.
    pub fn signing_hash(&self) -> Result<B256> {
        self.validate()?;
        Ok(self.to_sol()?.eip712_signing_hash(&self.eip712_domain()))
    }

    /// JSON payload for `eth_signTypedData_v4`.
    pub fn to_typed_data_json(&self) -> serde_json::Value {
        let req = self.request();
        json!({
            "types": {
                "EIP712Domain": [
                    { "name": "name", "type": "string" },
                    { "name": "version", "type": "string" },
                    { "name": "chainId", "type": "uint256" },
                    { "name": "verifyingContract", "type": "address" },
                ],
                PRIMARY_TYPE: req.types.user_decrypt_request_verification,
            },
            "primaryType": PRIMARY_TYPE,
            "domain": req.domain,
            "message": req.message,
        })
    }
}

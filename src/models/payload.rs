//! Canonical ERC-3009 authorization payload.
//!
//! The typed-data schema must match the token's on-chain verifier byte for byte:
//! reordering a field or changing a type invalidates every captured signature.

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, Eip712Domain, SolCall, SolStruct};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::request::{AuthorizationSignature, PaymentAuthorizationRequest};

sol! {
    /// EIP-712 message signed by the payer.
    #[derive(Debug)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

sol! {
    /// The (v, r, s) overload of ERC-3009 `transferWithAuthorization`.
    #[allow(missing_docs)]
    #[derive(Debug)]
    interface IEIP3009 {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

/// EIP-712 domain of the token contract that verifies authorizations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl TokenDomain {
    pub fn eip712(&self) -> Eip712Domain {
        Eip712Domain::new(
            Some(self.name.clone().into()),
            Some(self.version.clone().into()),
            Some(U256::from(self.chain_id)),
            Some(self.verifying_contract),
            None,
        )
    }
}

/// Every field the payer commits to, in on-chain order.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationPayload {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: i64,
    pub valid_before: i64,
    pub nonce: B256,
}

impl AuthorizationPayload {
    pub fn for_request(request: &PaymentAuthorizationRequest, payer: Address) -> Self {
        Self {
            from: payer,
            to: request.payee_address,
            value: request.amount,
            valid_after: request.valid_after,
            valid_before: request.valid_before,
            nonce: request.nonce,
        }
    }

    pub fn message(&self) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.from,
            to: self.to,
            value: self.value,
            validAfter: unix_to_u256(self.valid_after),
            validBefore: unix_to_u256(self.valid_before),
            nonce: self.nonce,
        }
    }

    /// The digest the payer's wallet signs.
    pub fn signing_hash(&self, domain: &TokenDomain) -> B256 {
        self.message().eip712_signing_hash(&domain.eip712())
    }

    /// ABI-encoded `transferWithAuthorization` call for the relay.
    pub fn calldata(&self, signature: &AuthorizationSignature) -> Bytes {
        IEIP3009::transferWithAuthorizationCall {
            from: self.from,
            to: self.to,
            value: self.value,
            validAfter: unix_to_u256(self.valid_after),
            validBefore: unix_to_u256(self.valid_before),
            nonce: self.nonce,
            v: signature.v,
            r: signature.r,
            s: signature.s,
        }
        .abi_encode()
        .into()
    }

    /// `eth_signTypedData_v4` document handed to the payer's wallet.
    pub fn typed_data(&self, domain: &TokenDomain) -> serde_json::Value {
        json!({
            "types": {
                "EIP712Domain": [
                    { "name": "name", "type": "string" },
                    { "name": "version", "type": "string" },
                    { "name": "chainId", "type": "uint256" },
                    { "name": "verifyingContract", "type": "address" },
                ],
                "TransferWithAuthorization": [
                    { "name": "from", "type": "address" },
                    { "name": "to", "type": "address" },
                    { "name": "value", "type": "uint256" },
                    { "name": "validAfter", "type": "uint256" },
                    { "name": "validBefore", "type": "uint256" },
                    { "name": "nonce", "type": "bytes32" },
                ],
            },
            "primaryType": "TransferWithAuthorization",
            "domain": {
                "name": domain.name,
                "version": domain.version,
                "chainId": domain.chain_id,
                "verifyingContract": domain.verifying_contract.to_string(),
            },
            "message": {
                "from": self.from.to_string(),
                "to": self.to.to_string(),
                "value": self.value.to_string(),
                "validAfter": self.valid_after.to_string(),
                "validBefore": self.valid_before.to_string(),
                "nonce": self.nonce.to_string(),
            },
            "signingHash": self.signing_hash(domain).to_string(),
        })
    }
}

fn unix_to_u256(ts: i64) -> U256 {
    U256::from(ts.max(0) as u64)
}

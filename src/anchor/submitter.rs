// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Submission of key updates to the trust anchor.

use std::sync::Arc;
use std::time::Duration;

use alloy::{
    network::EthereumWallet,
    primitives::{Address, Bytes, FixedBytes},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolCall,
};
use async_trait::async_trait;
use k256::SecretKey;
use tokio::time::{sleep, Instant};

use super::{AnchorError, AnchorVerifier, KeyUpdate};

sol! {
    #[sol(rpc)]
    interface ITrustAnchor {
        event MasterKeyUpdated(bytes32 pubKeyHash, bytes32 attestationHash, uint256 nonce);

        function setMasterKey(
            bytes pubKey,
            bytes32 pubKeyHash,
            bytes32 attestationHash,
            uint256 nonce,
            bytes signature
        ) external;

        function masterPubKey() external view returns (bytes);
        function usedNonces(uint256 nonce) external view returns (bool);
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorReceipt {
    pub tx_id: String,
    /// False when the transaction was sent but not yet confirmed.
    pub confirmed: bool,
}

#[async_trait]
pub trait AnchorSubmitter: Send + Sync {
    async fn submit(&self, update: &KeyUpdate) -> Result<AnchorReceipt, AnchorError>;

    fn kind(&self) -> &'static str;
}

// =============================================================================
// Local verifier
// =============================================================================

/// Applies updates to an in-process [`AnchorVerifier`]. Confirmation is immediate.
pub struct LocalAnchorSubmitter {
    verifier: Arc<AnchorVerifier>,
    caller: Address,
}

impl LocalAnchorSubmitter {
    pub fn new(verifier: Arc<AnchorVerifier>, caller: Address) -> Self {
        Self {
            verifier,
            caller,
        }
    }

    pub fn caller(&self) -> Address {
        self.caller
    }
}

#[async_trait]
impl AnchorSubmitter for LocalAnchorSubmitter {
    async fn submit(&self, update: &KeyUpdate) -> Result<AnchorReceipt, AnchorError> {
        let event = self.verifier.set_master_key(self.caller, update)?;
        Ok(AnchorReceipt {
            tx_id: format!("local-{}", event.sequence),
            confirmed: true,
        })
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

// =============================================================================
// EVM contract
// =============================================================================

/// Sends `setMasterKey` to a deployed `TrustAnchor` contract.
pub struct EvmAnchorSubmitter {
    provider: DynProvider,
    contract: Address,
    receipt_timeout: Duration,
    poll_interval: Duration,
}

impl EvmAnchorSubmitter {
    pub fn new(
        rpc_url: &str,
        contract: Address,
        signer: PrivateKeySigner,
        receipt_timeout: Duration,
    ) -> Result<Self, AnchorError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e: url::ParseError| AnchorError::Config(format!("invalid RPC URL: {e}")))?;

        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(url)
            .erased();

        Ok(Self {
            provider,
            contract,
            receipt_timeout,
            poll_interval: Duration::from_secs(2),
        })
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    async fn wait_for_receipt(
        &self,
        hash: FixedBytes<32>,
    ) -> Result<Option<bool>, AnchorError> {
        let deadline = Instant::now() + self.receipt_timeout;
        loop {
            let receipt = self
                .provider
                .get_transaction_receipt(hash)
                .await
                .map_err(|e| AnchorError::Submission(format!("failed to get receipt: {e}")))?;
            if let Some(receipt) = receipt {
                return Ok(Some(receipt.status()));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval).await;
        }
    }
}

/// Calldata for `setMasterKey`.
pub fn encode_set_master_key(update: &KeyUpdate) -> Result<Vec<u8>, AnchorError> {
    let to_bytes32 = |field: &'static str, value: &[u8]| {
        <[u8; 32]>::try_from(value)
            .map(FixedBytes::from)
            .map_err(|_| AnchorError::InvalidKey(format!("{field} must be 32 bytes")))
    };

    let call = ITrustAnchor::setMasterKeyCall {
        pubKey: Bytes::copy_from_slice(&update.public_key),
        pubKeyHash: to_bytes32("public_key_hash", &update.public_key_hash)?,
        attestationHash: to_bytes32("attestation_hash", &update.attestation_hash)?,
        nonce: update.nonce,
        signature: Bytes::copy_from_slice(&update.signature),
    };
    Ok(call.abi_encode())
}

#[async_trait]
impl AnchorSubmitter for EvmAnchorSubmitter {
    async fn submit(&self, update: &KeyUpdate) -> Result<AnchorReceipt, AnchorError> {
        let input = encode_set_master_key(update)?;
        let tx = TransactionRequest::default()
            .to(self.contract)
            .input(input.into());

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| AnchorError::Submission(format!("failed to send: {e}")))?;
        let hash = *pending.tx_hash();
        let tx_id = format!("{hash:?}");
        tracing::info!(tx_hash = %tx_id, contract = %self.contract, "Submitted anchor update");

        match self.wait_for_receipt(hash).await? {
            Some(true) => Ok(AnchorReceipt {
                tx_id,
                confirmed: true,
            }),
            Some(false) => Err(AnchorError::Rejected(tx_id)),
            None => {
                tracing::warn!(tx_hash = %tx_id, "Anchor transaction not confirmed before timeout");
                Ok(AnchorReceipt {
                    tx_id,
                    confirmed: false,
                })
            }
        }
    }

    fn kind(&self) -> &'static str {
        "evm"
    }
}

/// Load the transaction-paying key from a PEM file (SEC1 or PKCS#8).
pub fn signer_from_pem(pem_bytes: &[u8]) -> Result<PrivateKeySigner, AnchorError> {
    use k256::pkcs8::DecodePrivateKey;

    let pem_str = std::str::from_utf8(pem_bytes)
        .map_err(|e| AnchorError::Config(format!("invalid UTF-8 in key file: {e}")))?;
    let pem = pem::parse(pem_str)
        .map_err(|e| AnchorError::Config(format!("invalid PEM: {e}")))?;
    let secret = match SecretKey::from_sec1_der(pem.contents()) {
        Ok(secret) => secret,
        Err(_) => SecretKey::from_pkcs8_der(pem.contents())
            .map_err(|e| AnchorError::Config(format!("invalid key format: {e}")))?,
    };

    PrivateKeySigner::from_slice(&secret.to_bytes())
        .map_err(|e| AnchorError::Config(format!("invalid signer key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::caller_address;
    use crate::keys::kdf::{derive, MasterSeed};
    use crate::keys::KeyLabel;
    use alloy::primitives::U256;

    fn update() -> (Arc<AnchorVerifier>, Address, KeyUpdate) {
        let seed = MasterSeed::new(vec![8u8; 32]).unwrap();
        let v1 = derive(&seed, &KeyLabel::bootstrap(), "signing", "").unwrap();
        let v2 = derive(&seed, &KeyLabel::parse("v2").unwrap(), "signing", "").unwrap();

        let verifier = Arc::new(AnchorVerifier::new());
        let caller = caller_address(v1.public_key()).unwrap();
        verifier.register(caller, v1.public_key()).unwrap();

        let update = KeyUpdate::signed_by(&v1, v2.public_key(), [4u8; 32], U256::from(11)).unwrap();
        (verifier, caller, update)
    }

    #[tokio::test]
    async fn local_submitter_confirms_immediately() {
        let (verifier, caller, update) = update();
        let submitter = LocalAnchorSubmitter::new(Arc::clone(&verifier), caller);

        let receipt = submitter.submit(&update).await.unwrap();
        assert!(receipt.confirmed);
        assert_eq!(receipt.tx_id, "local-1");

        let replay = submitter.submit(&update).await.unwrap_err();
        assert!(matches!(replay, AnchorError::NonceReused(_)));
    }

    #[test]
    fn calldata_starts_with_selector() {
        let (_, _, update) = update();
        let calldata = encode_set_master_key(&update).unwrap();
        assert_eq!(&calldata[..4], ITrustAnchor::setMasterKeyCall::SELECTOR.as_slice());
    }

    #[test]
    fn calldata_rejects_short_hashes() {
        let (_, _, mut update) = update();
        update.public_key_hash.truncate(10);
        assert!(encode_set_master_key(&update).is_err());
    }

    #[test]
    fn signer_loads_from_pkcs8_pem() {
        use k256::elliptic_curve::rand_core::OsRng;
        use k256::pkcs8::{EncodePrivateKey, LineEnding};

        let secret = SecretKey::random(&mut OsRng);
        let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        let signer = signer_from_pem(pem.as_bytes()).unwrap();
        assert_ne!(signer.address(), Address::ZERO);
    }
}

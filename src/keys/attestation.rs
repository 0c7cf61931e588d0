// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! SGX attestation of newly generated public keys.
//!
//! Gramine exposes the attestation interface as pseudo-files:
//!
//! ```text
//! /dev/attestation/user_report_data   write 64 bytes
//! /dev/attestation/quote              read the DCAP quote
//! ```
//!
//! Report data is `SHA-256(compressed public key)` zero-padded to 64 bytes,
//! so the quote binds the key to the enclave measurement.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::kdf::public_key_hash;
use super::{Attestation, KeyError, KeyLabel};

/// Size of the SGX report data field.
pub const REPORT_DATA_SIZE: usize = 64;

// SGX quote v3: 48-byte header followed by the 384-byte report body.
const QUOTE_HEADER_SIZE: usize = 48;
const MRENCLAVE_OFFSET: usize = QUOTE_HEADER_SIZE + 64;
const REPORT_DATA_OFFSET: usize = QUOTE_HEADER_SIZE + 320;
const MIN_QUOTE_SIZE: usize = REPORT_DATA_OFFSET + REPORT_DATA_SIZE;

/// Raw attestation evidence.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub quote: Vec<u8>,
    pub measurement: [u8; 32],
    pub simulated: bool,
}

/// Produces a quote over caller-supplied report data.
pub trait Attestor: Send + Sync {
    fn attest(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> Result<Evidence, KeyError>;

    fn kind(&self) -> &'static str;
}

/// Gramine `/dev/attestation` attestor.
#[derive(Debug, Clone)]
pub struct GramineAttestor {
    root: PathBuf,
}

impl GramineAttestor {
    pub fn new() -> Self {
        Self::with_root("/dev/attestation")
    }

    /// Use a different pseudo-filesystem root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Whether the attestation interface is present.
    pub fn is_available(&self) -> bool {
        self.root.join("quote").exists()
    }
}

impl Default for GramineAttestor {
    fn default() -> Self {
        Self::new()
    }
}

impl Attestor for GramineAttestor {
    fn attest(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> Result<Evidence, KeyError> {
        fs::write(self.root.join("user_report_data"), report_data)
            .map_err(|e| KeyError::Attestation(format!("write user_report_data: {e}")))?;
        let quote = fs::read(self.root.join("quote"))
            .map_err(|e| KeyError::Attestation(format!("read quote: {e}")))?;
        let measurement = measurement_from_quote(&quote)?;

        Ok(Evidence {
            quote,
            measurement,
            simulated: false,
        })
    }

    fn kind(&self) -> &'static str {
        "gramine"
    }
}

/// Produces quote-shaped evidence outside an enclave. Never trust it.
#[derive(Debug, Clone)]
pub struct SimulatedAttestor {
    measurement: [u8; 32],
}

impl SimulatedAttestor {
    pub fn new() -> Self {
        Self {
            measurement: Sha256::digest(b"relational-tee-signer/simulated").into(),
        }
    }

    pub fn with_measurement(measurement: [u8; 32]) -> Self {
        Self { measurement }
    }
}

impl Default for SimulatedAttestor {
    fn default() -> Self {
        Self::new()
    }
}

impl Attestor for SimulatedAttestor {
    fn attest(&self, report_data: &[u8; REPORT_DATA_SIZE]) -> Result<Evidence, KeyError> {
        let mut quote = vec![0u8; MIN_QUOTE_SIZE];
        quote[..2].copy_from_slice(&3u16.to_le_bytes());
        quote[MRENCLAVE_OFFSET..MRENCLAVE_OFFSET + 32].copy_from_slice(&self.measurement);
        quote[REPORT_DATA_OFFSET..REPORT_DATA_OFFSET + REPORT_DATA_SIZE]
            .copy_from_slice(report_data);

        Ok(Evidence {
            quote,
            measurement: self.measurement,
            simulated: true,
        })
    }

    fn kind(&self) -> &'static str {
        "simulated"
    }
}

/// Report data binding a public key: `SHA-256(pk)` padded with zeros.
pub fn report_data_for(public_key: &[u8]) -> [u8; REPORT_DATA_SIZE] {
    let mut data = [0u8; REPORT_DATA_SIZE];
    data[..32].copy_from_slice(&public_key_hash(public_key));
    data
}

/// Extract MRENCLAVE from a v3 quote.
pub fn measurement_from_quote(quote: &[u8]) -> Result<[u8; 32], KeyError> {
    if quote.len() < MIN_QUOTE_SIZE {
        return Err(KeyError::Attestation(format!(
            "quote too short: {} bytes",
            quote.len()
        )));
    }
    let mut measurement = [0u8; 32];
    measurement.copy_from_slice(&quote[MRENCLAVE_OFFSET..MRENCLAVE_OFFSET + 32]);
    Ok(measurement)
}

/// Report data carried inside a v3 quote.
pub fn report_data_from_quote(quote: &[u8]) -> Result<[u8; REPORT_DATA_SIZE], KeyError> {
    if quote.len() < MIN_QUOTE_SIZE {
        return Err(KeyError::Attestation(format!(
            "quote too short: {} bytes",
            quote.len()
        )));
    }
    let mut data = [0u8; REPORT_DATA_SIZE];
    data.copy_from_slice(&quote[REPORT_DATA_OFFSET..MIN_QUOTE_SIZE]);
    Ok(data)
}

/// Attest a freshly derived public key.
pub fn attest_public_key(
    attestor: &dyn Attestor,
    label: &KeyLabel,
    public_key: &[u8],
    now: DateTime<Utc>,
) -> Result<Attestation, KeyError> {
    let report_data = report_data_for(public_key);
    let evidence = attestor.attest(&report_data)?;

    Ok(Attestation {
        key_version: label.clone(),
        public_key_hash: alloy::hex::encode(public_key_hash(public_key)),
        quote: alloy::hex::encode(&evidence.quote),
        enclave_measurement: alloy::hex::encode(evidence.measurement),
        timestamp: now,
        simulated: evidence.simulated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn simulated_quote_binds_report_data() {
        let attestor = SimulatedAttestor::with_measurement([9u8; 32]);
        let report_data = report_data_for(&[2u8; 33]);
        let evidence = attestor.attest(&report_data).unwrap();

        assert!(evidence.simulated);
        assert_eq!(measurement_from_quote(&evidence.quote).unwrap(), [9u8; 32]);
        assert_eq!(report_data_from_quote(&evidence.quote).unwrap(), report_data);
        assert_eq!(&report_data[32..], &[0u8; 32]);
    }

    #[test]
    fn gramine_attestor_uses_pseudo_files() {
        let dir = TempDir::new().unwrap();
        let mut quote = vec![0u8; MIN_QUOTE_SIZE];
        quote[MRENCLAVE_OFFSET..MRENCLAVE_OFFSET + 32].copy_from_slice(&[5u8; 32]);
        fs::write(dir.path().join("quote"), &quote).unwrap();

        let attestor = GramineAttestor::with_root(dir.path());
        assert!(attestor.is_available());

        let report_data = [1u8; REPORT_DATA_SIZE];
        let evidence = attestor.attest(&report_data).unwrap();
        assert!(!evidence.simulated);
        assert_eq!(evidence.measurement, [5u8; 32]);

        let written = fs::read(dir.path().join("user_report_data")).unwrap();
        assert_eq!(written, report_data.to_vec());
    }

    #[test]
    fn gramine_attestor_fails_outside_enclave() {
        let dir = TempDir::new().unwrap();
        let attestor = GramineAttestor::with_root(dir.path().join("missing"));
        assert!(!attestor.is_available());
        assert!(attestor.attest(&[0u8; REPORT_DATA_SIZE]).is_err());
    }

    #[test]
    fn attestation_records_public_key_hash() {
        let public_key = [3u8; 33];
        let attestation = attest_public_key(
            &SimulatedAttestor::new(),
            &KeyLabel::bootstrap(),
            &public_key,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(
            attestation.public_key_hash,
            alloy::hex::encode(public_key_hash(&public_key))
        );
        assert!(attestation.simulated);
        assert_eq!(attestation.digest().unwrap().len(), 32);
    }
}

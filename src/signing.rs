//! Envelope signing for the messaging transport.
//!
//! Every envelope carries an EIP-191 personal-sign signature over
//! [`envelope_message`]. The receiving side recovers the signer address and
//! compares it with the claimed sender, so a wallet session can only be driven
//! by the key that owns the sender address. The signed bytes include the
//! message id and timestamp, which the transport uses to drop replays.

use alloy_primitives::{Address, B256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use tiny_keccak::{Hasher, Keccak};
use tracing::debug;

use crate::identity::Identity;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("failed to read private key from {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// Bytes covered by an envelope signature. The message id is included so a
/// receiver can reject a redelivered or replayed envelope by id.
pub fn envelope_message(id: &str, conversation_id: &str, sent_at: i64, content: &str) -> Vec<u8> {
    format!("{}\n{}\n{}\n{}", id, conversation_id, sent_at, content).into_bytes()
}

/// Sign `message` with EIP-191 personal-sign framing. Returns `0x`-prefixed r||s||v hex.
pub async fn sign_message(
    signer: &PrivateKeySigner,
    message: &[u8],
) -> Result<String, SigningError> {
    let digest = B256::from(eip191_hash(message));
    let signature = signer
        .sign_hash(&digest)
        .await
        .map_err(|e| SigningError::Sign(e.to_string()))?;

    let mut bytes = signature.as_bytes();
    // normalize v to 27/28
    if bytes[64] < 27 {
        bytes[64] += 27;
    }

    debug!(signer = %signer.address(), "signed envelope");
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Recover the canonical identity of whoever signed `message`.
pub fn recover_signer(message: &[u8], signature_hex: &str) -> Result<Identity, SigningError> {
    let raw = hex::decode(signature_hex.trim().trim_start_matches("0x"))
        .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;
    if raw.len() != 65 {
        return Err(SigningError::InvalidSignature(format!(
            "expected 65 bytes, got {}",
            raw.len()
        )));
    }

    let signature = Signature::from_slice(&raw[..64])
        .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;
    let v = raw[64];
    let recovery_id = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })
        .ok_or_else(|| SigningError::InvalidSignature(format!("bad recovery id {}", v)))?;

    let digest = eip191_hash(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;

    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let address = Address::from_slice(&hash[12..]);
    Ok(Identity::from(address.to_string()))
}

/// keccak256("\x19Ethereum Signed Message:\n" || len(message) || message)
fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut data = Vec::with_capacity(prefix.len() + message.len());
    data.extend_from_slice(prefix.as_bytes());
    data.extend_from_slice(message);
    keccak256(&data)
}

/// Compute keccak256 hash
fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    output
}

/// Load a private key from a file
pub fn load_private_key(path: &str) -> Result<String, SigningError> {
    let key = std::fs::read_to_string(path)
        .map_err(|source| SigningError::KeyFile {
            path: path.to_string(),
            source,
        })?
        .trim()
        .to_string();
    Ok(key)
}

/// Parse a hex private key into a signer.
pub fn parse_signer(private_key_hex: &str) -> Result<PrivateKeySigner, SigningError> {
    private_key_hex
        .trim()
        .parse::<PrivateKeySigner>()
        .map_err(|e| SigningError::InvalidKey(e.to_string()))
}

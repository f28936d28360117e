//! Hashing, signing, and recovery helpers shared by the codec and the
//! probes. Kept free of any async or socket concerns so it can be unit
//! tested in isolation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use crate::types::NodeId;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    keccak_hash::keccak(data).0
}

/// A node's id is the Keccak256 hash of its uncompressed public key, with the
/// leading `0x04` SEC1 tag stripped.
pub fn node_id(public_key: &PublicKey) -> NodeId {
    let encoded = public_key.serialize_uncompressed();
    NodeId(keccak256(&encoded[1..]))
}

pub fn public_key_bytes(public_key: &PublicKey) -> [u8; 64] {
    let encoded = public_key.serialize_uncompressed();
    let mut out = [0u8; 64];
    out.copy_from_slice(&encoded[1..]);
    out
}

pub fn current_unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn expiration_from_now(ttl: Duration) -> u64 {
    (SystemTime::now() + ttl)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A negative expiration, once cast back to `i64`, must still compare as
/// expired rather than wrapping around to a huge `u64` and passing.
pub fn is_expired(expiration: u64) -> bool {
    (expiration as i64) < (current_unix_time() as i64)
}

/// Signs `message_hash` and serializes the recoverable signature as the
/// 65-byte `r ‖ s ‖ v` form used on the wire: 64 bytes of compact signature
/// followed by a single recovery-id byte.
pub fn sign_recoverable(signer: &SecretKey, message_hash: &[u8; 32]) -> [u8; 65] {
    let message = Message::from_digest(*message_hash);
    let signature = SECP256K1.sign_ecdsa_recoverable(&message, signer);
    let (recovery_id, compact) = signature.serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    out
}

#[derive(Debug, thiserror::Error)]
pub enum RecoverError {
    #[error("invalid recovery id byte {0}")]
    BadRecoveryId(u8),
    #[error("secp256k1 rejected the signature: {0}")]
    Secp256k1(#[from] secp256k1::Error),
}

/// Recovers the sender's public key from a 65-byte recoverable signature and
/// the hash it was produced over.
pub fn recover_signer(
    signature: &[u8; 65],
    message_hash: &[u8; 32],
) -> Result<PublicKey, RecoverError> {
    let recovery_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| RecoverError::BadRecoveryId(signature[64]))?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)?;
    let message = Message::from_digest(*message_hash);
    Ok(SECP256K1.recover_ecdsa(&message, &recoverable)?)
}

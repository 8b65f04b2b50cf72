//! Worker authentication: EIP-191 personal-sign verification.
//!
//! The first frame on a worker socket declares `{address, model, timestamp,
//! signature}`. The signature must recover to the declared address over the
//! canonical serialization of the other three fields.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};

use crate::relay::protocol::{
    CLOSE_INVALID_SIGNATURE, CLOSE_MISSING_FIELDS, CLOSE_TIMESTAMP_DRIFT,
};

/// Allowed distance between the auth timestamp and wall clock.
pub const MAX_TIMESTAMP_DRIFT_MS: i64 = 5 * 60 * 1000;

/// Why an auth frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingFields,
    TimestampDrift,
    InvalidSignature,
}

impl AuthRejection {
    pub fn close_code(&self) -> u16 {
        match self {
            AuthRejection::MissingFields => CLOSE_MISSING_FIELDS,
            AuthRejection::TimestampDrift => CLOSE_TIMESTAMP_DRIFT,
            AuthRejection::InvalidSignature => CLOSE_INVALID_SIGNATURE,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AuthRejection::MissingFields => "auth frame missing required fields",
            AuthRejection::TimestampDrift => "auth timestamp outside allowed window",
            AuthRejection::InvalidSignature => "signature does not match address",
        }
    }
}

/// Canonical serialization signed by the worker.
pub fn canonical_message(address: &str, model: &str, timestamp: i64) -> String {
    format!("{}:{}:{}", address.to_lowercase(), model, timestamp)
}

/// Keccak-256 over the EIP-191 prefixed message.
pub fn personal_sign_digest(message: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()));
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// Recover the signer address from a 65-byte `r||s||v` hex signature.
pub fn recover_address(digest: &[u8; 32], signature: &str) -> Option<String> {
    let bytes = hex::decode(signature.trim_start_matches("0x")).ok()?;
    if bytes.len() != 65 {
        return None;
    }
    let v = bytes[64];
    let recovery = RecoveryId::try_from(if v >= 27 { v - 27 } else { v }).ok()?;
    let signature = Signature::from_slice(&bytes[..64]).ok()?;
    let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery).ok()?;

    let point = key.to_encoded_point(false);
    let mut hasher = Keccak256::new();
    hasher.update(&point.as_bytes()[1..]);
    let hash = hasher.finalize();
    Some(format!("0x{}", hex::encode(&hash[12..])))
}

/// Validate an auth frame. Returns the lowercased address and the declared
/// model on success. `now_ms` is injected for the drift check.
pub fn verify_auth(
    address: Option<&str>,
    model: Option<&str>,
    timestamp: Option<i64>,
    signature: Option<&str>,
    now_ms: i64,
) -> Result<(String, String), AuthRejection> {
    let (Some(address), Some(model), Some(timestamp), Some(signature)) =
        (address, model, timestamp, signature)
    else {
        return Err(AuthRejection::MissingFields);
    };
    if address.is_empty() || model.is_empty() || signature.is_empty() {
        return Err(AuthRejection::MissingFields);
    }

    if (now_ms - timestamp).abs() > MAX_TIMESTAMP_DRIFT_MS {
        return Err(AuthRejection::TimestampDrift);
    }

    let digest = personal_sign_digest(&canonical_message(address, model, timestamp));
    let recovered = recover_address(&digest, signature).ok_or(AuthRejection::InvalidSignature)?;
    if recovered != address.to_lowercase() {
        return Err(AuthRejection::InvalidSignature);
    }

    Ok((address.to_lowercase(), model.to_string()))
}

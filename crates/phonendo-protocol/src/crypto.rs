use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{ProtocolError, SignatureEnvelope};

/// Generate a new Ed25519 signing key.
pub fn generate_signing_key() -> SigningKey {
    let mut rng = rand::thread_rng();
    SigningKey::generate(&mut rng)
}

/// Canonical serialization of a JSON value: compact, object keys sorted.
///
/// Signer and verifier must agree byte-for-byte, so both go through here.
pub fn canonical_json(value: &Value) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&sort_keys(value))?)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Sign `source` and wrap it in an envelope with a hex signature.
pub fn sign_source(
    signing_key: &SigningKey,
    source: Value,
) -> Result<SignatureEnvelope, ProtocolError> {
    let payload = canonical_json(&source)?;
    let signature = signing_key.sign(payload.as_bytes());
    Ok(SignatureEnvelope {
        source,
        signature: hex::encode(signature.to_bytes()),
    })
}

/// Verify an envelope against the verifier's public key.
pub fn verify_envelope(
    verifying_key: &VerifyingKey,
    envelope: &SignatureEnvelope,
) -> Result<(), ProtocolError> {
    let bytes = hex::decode(envelope.signature.trim())
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidSignature("signature must be 64 bytes".into()))?;
    let signature = Signature::from_bytes(&bytes);
    let payload = canonical_json(&envelope.source)?;
    verifying_key
        .verify(payload.as_bytes(), &signature)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))
}

/// Export a public key as SPKI PEM, the format served on `/pk/1.0.0`.
pub fn public_key_to_pem(verifying_key: &VerifyingKey) -> Result<String, ProtocolError> {
    verifying_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| ProtocolError::InvalidKey(e.to_string()))
}

/// Parse an SPKI PEM public key.
pub fn public_key_from_pem(pem: &str) -> Result<VerifyingKey, ProtocolError> {
    VerifyingKey::from_public_key_pem(pem.trim())
        .map_err(|e| ProtocolError::InvalidKey(e.to_string()))
}

/// Export a signing key as PKCS#8 PEM for the verifier's key file.
pub fn signing_key_to_pem(signing_key: &SigningKey) -> Result<String, ProtocolError> {
    signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|e| ProtocolError::InvalidKey(e.to_string()))
}

/// Parse a PKCS#8 PEM signing key.
pub fn signing_key_from_pem(pem: &str) -> Result<SigningKey, ProtocolError> {
    SigningKey::from_pkcs8_pem(pem.trim()).map_err(|e| ProtocolError::InvalidKey(e.to_string()))
}

/// Short SHA-256 fingerprint of a public key, for logs.
pub fn key_fingerprint(verifying_key: &VerifyingKey) -> String {
    let hash = Sha256::digest(verifying_key.as_bytes());
    hex::encode(&hash[..8])
}

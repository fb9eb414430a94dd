//! Verifier role: signs records and serves its public key.

use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use serde_json::Value;

use phonendo_mesh::{handler, DispatcherBuilder, MeshError};
use phonendo_protocol::{crypto, Protocol, SignatureEnvelope};

/// Holds the signing key for the verifier role.
#[derive(Clone)]
pub struct VerifierService {
    signing_key: Arc<SigningKey>,
    public_pem: Arc<String>,
}

impl VerifierService {
    pub fn new(signing_key: SigningKey) -> Result<Self, MeshError> {
        let public_pem = crypto::public_key_to_pem(&signing_key.verifying_key())?;
        tracing::info!(
            fingerprint = %crypto::key_fingerprint(&signing_key.verifying_key()),
            "Verifier key ready"
        );
        Ok(Self {
            signing_key: Arc::new(signing_key),
            public_pem: Arc::new(public_pem),
        })
    }

    /// Load the key at `path`, or generate one (persisting it when a path is
    /// configured).
    pub async fn load_or_generate(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let signing_key = match path {
            Some(path) if path.exists() => {
                let pem = tokio::fs::read_to_string(path).await?;
                tracing::info!(path = %path.display(), "Loaded verifier key");
                crypto::signing_key_from_pem(&pem)?
            }
            Some(path) => {
                let key = crypto::generate_signing_key();
                tokio::fs::write(path, crypto::signing_key_to_pem(&key)?).await?;
                tracing::info!(path = %path.display(), "Generated new verifier key");
                key
            }
            None => {
                tracing::warn!("No verifier key path configured, using an ephemeral key");
                crypto::generate_signing_key()
            }
        };
        Ok(Self::new(signing_key)?)
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn sign(&self, source: Value) -> Result<SignatureEnvelope, MeshError> {
        Ok(crypto::sign_source(&self.signing_key, source)?)
    }
}

/// Attach `pk` and `verify` to a dispatcher.
pub fn routes(builder: DispatcherBuilder, service: VerifierService) -> DispatcherBuilder {
    let pk = service.clone();
    let verify = service;

    builder
        .route(
            Protocol::Pk,
            handler(move |call| {
                let service = pk.clone();
                async move {
                    tracing::debug!(peer = %call.peer, "Serving public key");
                    Ok(service.public_pem().to_string())
                }
            }),
        )
        .route(
            Protocol::Verify,
            handler(move |call| {
                let service = verify.clone();
                async move {
                    let source: Value =
                        serde_json::from_str(&call.payload).map_err(MeshError::malformed)?;
                    let envelope = service.sign(source)?;
                    serde_json::to_string(&envelope).map_err(MeshError::malformed)
                }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_signature_checks_against_served_key() {
        let service = VerifierService::new(crypto::generate_signing_key()).unwrap();
        let envelope = service.sign(json!({"bpm": 64, "at": "2024"})).unwrap();

        let key = crypto::public_key_from_pem(service.public_pem()).unwrap();
        assert!(crypto::verify_envelope(&key, &envelope).is_ok());
    }

    #[tokio::test]
    async fn test_key_file_is_reused() {
        let path = std::env::temp_dir().join(format!("phonendo-key-{}.pem", uuid::Uuid::new_v4()));

        let first = VerifierService::load_or_generate(Some(&path)).await.unwrap();
        let second = VerifierService::load_or_generate(Some(&path)).await.unwrap();
        assert_eq!(first.public_pem(), second.public_pem());

        let _ = std::fs::remove_file(&path);
    }
}

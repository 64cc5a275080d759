//! Secrets Store: envelope-encrypted credentials at rest.
//!
//! Each secret gets its own random salt. A per-secret AES-256-GCM key is
//! derived from the master key and that salt with PBKDF2-HMAC-SHA256, so equal
//! plaintexts never share ciphertext and a single leaked derived key exposes
//! a single secret.

mod keys;
mod mask;

pub use keys::KeyMaterial;
pub use mask::mask;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::store::{JsonDocument, StoreError};

type HmacSha256 = hmac::Hmac<Sha256>;

const KDF_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret '{0}' could not be decrypted (tampered data or master key mismatch)")]
    Decryption(String),
    #[error("key material at {} is unusable: {reason}", path.display())]
    KeyMaterial { path: PathBuf, reason: String },
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VaultError {
    fn key_material(path: &Path, reason: impl std::fmt::Display) -> Self {
        VaultError::KeyMaterial {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SecretRecord {
    id: String,
    name: String,
    /// base64 salt
    salt: String,
    /// base64(nonce || ciphertext)
    ciphertext: String,
}

/// Id and name of a stored secret, without any secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretEntry {
    pub id: String,
    pub name: String,
}

pub struct SecretsVault {
    records: JsonDocument<Vec<SecretRecord>>,
    master_key: [u8; 32],
    iterations: u32,
}

impl SecretsVault {
    pub fn new(secrets_path: impl Into<PathBuf>, keys: &KeyMaterial) -> Result<Self, VaultError> {
        let records = JsonDocument::new(secrets_path);
        let master_key = keys
            .master_key()
            .map_err(|reason| VaultError::key_material(records.path(), reason))?;
        records.load()?;
        Ok(Self {
            records,
            master_key,
            iterations: KDF_ITERATIONS,
        })
    }

    /// Cheaper KDF for tests; records written this way only open with the same count.
    #[cfg(test)]
    pub(crate) fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Encrypt and persist `plaintext`, returning the new secret id.
    pub async fn store(&self, name: &str, plaintext: &str) -> Result<String, VaultError> {
        let salt: [u8; SALT_LEN] = rand::random();
        let cipher = self.derive_cipher(&salt).await?;

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        let engine = base64::engine::general_purpose::STANDARD;
        let record = SecretRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            salt: engine.encode(salt),
            ciphertext: engine.encode(&combined),
        };
        let id = record.id.clone();

        self.records
            .update(|records| {
                records.push(record);
                Ok::<_, VaultError>(())
            })
            .await?;
        debug!("Stored secret '{}' as {}", name, id);
        Ok(id)
    }

    /// Decrypt the secret `id`.
    pub async fn get(&self, id: &str) -> Result<String, VaultError> {
        let record = self
            .records
            .load()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;

        let engine = base64::engine::general_purpose::STANDARD;
        let decryption_failed = || VaultError::Decryption(id.to_string());
        let salt = engine.decode(&record.salt).map_err(|_| decryption_failed())?;
        let combined = engine
            .decode(&record.ciphertext)
            .map_err(|_| decryption_failed())?;
        if combined.len() <= NONCE_LEN {
            return Err(decryption_failed());
        }

        let cipher = self.derive_cipher(&salt).await?;
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| decryption_failed())?;

        String::from_utf8(plaintext).map_err(|_| decryption_failed())
    }

    /// Remove the secret `id`. Absent ids are a no-op.
    pub async fn delete(&self, id: &str) -> Result<(), VaultError> {
        let removed = self
            .records
            .update(|records| {
                let before = records.len();
                records.retain(|r| r.id != id);
                Ok::<_, VaultError>(before != records.len())
            })
            .await?;
        if removed {
            debug!("Deleted secret {}", id);
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<SecretEntry>, VaultError> {
        Ok(self
            .records
            .load()?
            .into_iter()
            .map(|r| SecretEntry {
                id: r.id,
                name: r.name,
            })
            .collect())
    }

    /// PBKDF2 is deliberately slow; keep it off the async workers.
    async fn derive_cipher(&self, salt: &[u8]) -> Result<Aes256Gcm, VaultError> {
        let master_key = self.master_key;
        let salt = salt.to_vec();
        let iterations = self.iterations;
        let key = tokio::task::spawn_blocking(move || {
            let mut key = [0u8; 32];
            pbkdf2::pbkdf2::<HmacSha256>(&master_key, &salt, iterations, &mut key)
                .map(|_| key)
                .map_err(|e| VaultError::Encryption(e.to_string()))
        })
        .await
        .map_err(|e| VaultError::Encryption(e.to_string()))??;

        Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::Encryption(e.to_string()))
    }
}

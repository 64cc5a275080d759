use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::info;

use super::VaultError;
use crate::platform::{NativePlatform, Platform};

const MASTER_KEY_LEN: usize = 32;

/// API token plus the master encryption key. Generated once, never rotated.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub api_token: String,
    encryption_key: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

impl KeyMaterial {
    pub fn generate() -> Self {
        let key: [u8; MASTER_KEY_LEN] = rand::random();
        Self {
            api_token: uuid::Uuid::new_v4().simple().to_string(),
            encryption_key: base64::engine::general_purpose::STANDARD.encode(key),
        }
    }

    /// Load key material from `path`, generating it on first start.
    ///
    /// An existing file that cannot be read or decoded is fatal: no stored
    /// secret could be decrypted and silently regenerating would orphan them.
    pub fn load_or_create(path: &Path) -> Result<Self, VaultError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let keys: KeyMaterial =
                    serde_json::from_str(&content).map_err(|e| VaultError::key_material(path, e))?;
                keys.master_key()
                    .map_err(|reason| VaultError::key_material(path, reason))?;
                if keys.api_token.trim().is_empty() {
                    return Err(VaultError::key_material(path, "api_token is empty"));
                }
                Ok(keys)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keys = Self::generate();
                keys.write_new(path)?;
                info!("Generated new key material at {}", path.display());
                Ok(keys)
            }
            Err(e) => Err(VaultError::key_material(path, e)),
        }
    }

    pub(super) fn master_key(&self) -> Result<[u8; MASTER_KEY_LEN], String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.encryption_key)
            .map_err(|e| format!("encryption_key is not valid base64: {}", e))?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("encryption_key has {} bytes, expected 32", b.len()))
    }

    fn write_new(&self, path: &Path) -> Result<(), VaultError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::key_material(path, e))?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| VaultError::key_material(path, e))?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| VaultError::key_material(path, e))?;
        NativePlatform::restrict_file_permissions(path);
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| VaultError::key_material(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_start_generates_and_second_start_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let first = KeyMaterial::load_or_create(&path).unwrap();
        let second = KeyMaterial::load_or_create(&path).unwrap();
        assert_eq!(first.api_token, second.api_token);
        assert_eq!(first.master_key().unwrap(), second.master_key().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn generated_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        KeyMaterial::load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn corrupted_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, "{\"api_token\": \"abc\"").unwrap();
        assert!(matches!(
            KeyMaterial::load_or_create(&path),
            Err(VaultError::KeyMaterial { .. })
        ));
        // Must not be silently replaced.
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"api_token\": \"abc\""
        );
    }

    #[test]
    fn short_master_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, r#"{"api_token":"t","encryption_key":"c2hvcnQ="}"#).unwrap();
        assert!(matches!(
            KeyMaterial::load_or_create(&path),
            Err(VaultError::KeyMaterial { .. })
        ));
    }
}

use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use thiserror::Error;
use tracing::info;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to read key file {0}: {1}")]
    KeyRead(String, String),
    #[error("failed to write key file {0}: {1}")]
    KeyWrite(String, String),
    #[error("key file {0} is corrupt: expected 32 bytes")]
    KeyCorrupt(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("stored secret is corrupt or was written with a different key")]
    Decrypt,
}

/// AEAD wrapper around the api_key column. Blobs are
/// `base64(nonce || ciphertext)` with a fresh nonce per write, so two rows
/// holding the same plaintext never store the same blob.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Loads the 32-byte key from `path`, generating and persisting one with
    /// owner-only permissions on first start.
    pub fn load_or_create(path: &Path) -> Result<Self, SecretError> {
        let key_bytes: Vec<u8> = if path.exists() {
            let raw = fs::read(path)
                .map_err(|e| SecretError::KeyRead(path.display().to_string(), e.to_string()))?;
            // Key files written by hand tend to grow a trailing newline.
            let raw: Vec<u8> = B64
                .decode(String::from_utf8_lossy(&raw).trim())
                .map_err(|_| SecretError::KeyCorrupt(path.display().to_string()))?;
            if raw.len() != 32 {
                return Err(SecretError::KeyCorrupt(path.display().to_string()));
            }
            raw
        } else {
            let key = Aes256Gcm::generate_key(&mut OsRng);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    SecretError::KeyWrite(path.display().to_string(), e.to_string())
                })?;
            }
            fs::write(path, B64.encode(key))
                .map_err(|e| SecretError::KeyWrite(path.display().to_string(), e.to_string()))?;
            restrict_permissions(path)?;
            info!(path = %path.display(), "generated new encryption key");
            key.to_vec()
        };

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(SecretCipher {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Empty plaintext stays empty: key-less services store no blob at all.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(B64.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, SecretError> {
        if blob.is_empty() {
            return Ok(String::new());
        }
        let raw = B64.decode(blob).map_err(|_| SecretError::Decrypt)?;
        if raw.len() <= NONCE_LEN {
            return Err(SecretError::Decrypt);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Decrypt)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), SecretError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| SecretError::KeyWrite(path.display().to_string(), e.to_string()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), SecretError> {
    Ok(())
}

/// Display form for config listings: first and last four characters with a
/// starred middle. Short keys are fully starred.
pub fn mask_api_key(plaintext: &str) -> String {
    if plaintext.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = plaintext.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}

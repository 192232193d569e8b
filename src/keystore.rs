//! Encrypted key share storage
//!
//! The node's active DistKey is encrypted at rest using AES-256-GCM with a
//! password-derived key.

use crate::types::{DistKeyJson, PartnerId};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

/// Key store errors
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("key not found")]
    KeyNotFound,
    #[error("invalid password")]
    InvalidPassword,
}

/// Encrypted key file format
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    /// Version for future format changes
    version: u8,
    /// Partner id the share belongs to
    index: PartnerId,
    /// Id of the MPC run that produced the key
    key_id: String,
    /// Salt for key derivation (hex-encoded)
    salt: String,
    /// Nonce for AES-GCM (hex-encoded)
    nonce: String,
    /// Encrypted DistKeyJson (hex-encoded)
    ciphertext: String,
    /// Group public key (hex-encoded, readable without the password)
    public_key: String,
}

/// Encrypted keystore manager
pub struct Keystore {
    key_path: std::path::PathBuf,
    index: PartnerId,
}

impl Keystore {
    pub fn new(key_path: impl AsRef<Path>, index: PartnerId) -> Self {
        Self {
            key_path: key_path.as_ref().to_path_buf(),
            index,
        }
    }

    pub fn exists(&self) -> bool {
        self.key_path.exists()
    }

    /// Derive encryption key from password using SHA-256
    fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt);
        hasher.update(b"mpc-node-keystore-v1");
        hasher.finalize().into()
    }

    /// Save the key encrypted with password
    pub fn save(
        &self,
        key_id: &str,
        key: &DistKeyJson,
        password: &str,
    ) -> Result<(), KeystoreError> {
        if key.index != self.index {
            return Err(KeystoreError::Encryption(format!(
                "share index {} does not belong to node {}",
                key.index, self.index
            )));
        }
        let plaintext = serde_json::to_vec(key)?;

        let mut salt = [0u8; 16];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let derived = Self::derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| KeystoreError::Encryption(e.to_string()))?;

        let encrypted = EncryptedKeyFile {
            version: 1,
            index: self.index,
            key_id: key_id.to_string(),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
            public_key: key.public_key.clone(),
        };

        let json = serde_json::to_string_pretty(&encrypted)?;
        if let Some(parent) = self.key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.key_path, json)?;

        tracing::info!(
            index = self.index,
            key_id = %key_id,
            path = %self.key_path.display(),
            "Saved encrypted key share"
        );

        Ok(())
    }

    /// Load and decrypt; returns the key id and the key
    pub fn load(&self, password: &str) -> Result<(String, DistKeyJson), KeystoreError> {
        if !self.exists() {
            return Err(KeystoreError::KeyNotFound);
        }

        let json = std::fs::read_to_string(&self.key_path)?;
        let encrypted: EncryptedKeyFile = serde_json::from_str(&json)?;

        if encrypted.index != self.index {
            return Err(KeystoreError::Decryption(format!(
                "index mismatch: expected {}, got {}",
                self.index, encrypted.index
            )));
        }

        let salt = hex::decode(&encrypted.salt)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let nonce_bytes = hex::decode(&encrypted.nonce)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let ciphertext = hex::decode(&encrypted.ciphertext)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(KeystoreError::Decryption("nonce must be 12 bytes".into()));
        }

        let derived = Self::derive_key(password, &salt);
        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| KeystoreError::Decryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| KeystoreError::InvalidPassword)?;

        let key: DistKeyJson = serde_json::from_slice(&plaintext)?;

        tracing::info!(
            index = self.index,
            key_id = %encrypted.key_id,
            path = %self.key_path.display(),
            "Loaded key share"
        );

        Ok((encrypted.key_id, key))
    }

    /// Group public key from the file without decryption
    pub fn public_key(&self) -> Result<String, KeystoreError> {
        if !self.exists() {
            return Err(KeystoreError::KeyNotFound);
        }
        let json = std::fs::read_to_string(&self.key_path)?;
        let encrypted: EncryptedKeyFile = serde_json::from_str(&json)?;
        Ok(encrypted.public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_key(index: PartnerId) -> DistKeyJson {
        DistKeyJson {
            index,
            share: "11".repeat(32),
            address: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".into(),
            public_key: "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798".into(),
            partners: vec![1, 2, 3],
            polynomial: None,
        }
    }

    #[test]
    fn test_key_derivation_deterministic() {
        let key1 = Keystore::derive_key("password123", b"salt");
        let key2 = Keystore::derive_key("password123", b"salt");
        assert_eq!(key1, key2);

        let key3 = Keystore::derive_key("password123", b"different_salt");
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_keystore_round_trip() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(dir.path().join("node2.key.enc"), 2);

        let key = sample_key(2);
        keystore.save("main", &key, "test_password").unwrap();
        assert!(keystore.exists());
        assert_eq!(keystore.public_key().unwrap(), key.public_key);

        let (key_id, loaded) = keystore.load("test_password").unwrap();
        assert_eq!(key_id, "main");
        assert_eq!(loaded, key);
    }

    #[test]
    fn test_keystore_wrong_password() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(dir.path().join("node1.key.enc"), 1);
        keystore.save("main", &sample_key(1), "correct").unwrap();

        let result = keystore.load("wrong");
        assert!(matches!(result, Err(KeystoreError::InvalidPassword)));
    }

    #[test]
    fn test_keystore_rejects_foreign_share() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(dir.path().join("node1.key.enc"), 1);
        assert!(keystore.save("main", &sample_key(3), "pw").is_err());
        assert!(matches!(keystore.load("pw"), Err(KeystoreError::KeyNotFound)));
    }
}

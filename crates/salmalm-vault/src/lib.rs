// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Encrypted key/value store for API keys and other secrets.
//!
//! # On-disk format
//!
//! ```text
//! byte 0      version  (0x03 = AES-256-GCM, 0x02 = legacy HMAC-CTR)
//! bytes 1-16  PBKDF2 salt
//! 0x03:       nonce (12 bytes) | AES-GCM ciphertext+tag
//! 0x02:       HMAC-SHA256 tag (32 bytes) | CTR ciphertext
//! ```
//!
//! Keys are derived with PBKDF2-SHA256. New vaults are always written as
//! version 0x03; version 0x02 files (written by installs without an AES
//! implementation) remain readable and are upgraded on the next save.
//!
//! A wrong password fails [`Vault::unlock`] silently (`false`) — decryption
//! and tag verification never reveal which byte differed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

pub const PBKDF2_ITERATIONS: u32 = 200_000;
const VERSION_GCM: u8 = 0x03;
const VERSION_CTR: u8 = 0x02;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault is locked")]
    Locked,
    #[error("vault I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vault encryption failed")]
    Crypto,
}

/// Encrypted key/value store, loaded into memory while unlocked.
pub struct Vault {
    path: PathBuf,
    data: BTreeMap<String, String>,
    password: Option<String>,
    salt: Option<[u8; SALT_LEN]>,
}

impl Vault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: BTreeMap::new(),
            password: None,
            salt: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_unlocked(&self) -> bool {
        self.password.is_some()
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Create a fresh vault with a new random salt, replacing any file on disk.
    pub fn create(&mut self, password: &str) -> Result<(), VaultError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        self.password = Some(password.to_string());
        self.salt = Some(salt);
        self.data.clear();
        self.save()
    }

    /// Unlock the vault. Returns `false` on a wrong password or an unreadable
    /// file; no detail about the failure is exposed.
    pub fn unlock(&mut self, password: &str) -> bool {
        let raw = match std::fs::read(&self.path) {
            Ok(r) => r,
            Err(_) => return false,
        };
        if raw.len() < 1 + SALT_LEN + 1 {
            return false;
        }
        let version = raw[0];
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&raw[1..1 + SALT_LEN]);
        let body = &raw[1 + SALT_LEN..];

        let plaintext = match version {
            VERSION_GCM => decrypt_gcm(password, &salt, body),
            VERSION_CTR => decrypt_ctr(password, &salt, body),
            _ => None,
        };
        let Some(plaintext) = plaintext else {
            return false;
        };
        let Ok(data) = serde_json::from_slice::<BTreeMap<String, String>>(&plaintext) else {
            return false;
        };
        self.data = data;
        self.password = Some(password.to_string());
        self.salt = Some(salt);
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), VaultError> {
        if !self.is_unlocked() {
            return Err(VaultError::Locked);
        }
        self.data.insert(key.to_string(), value.to_string());
        self.save()
    }

    pub fn delete(&mut self, key: &str) -> Result<(), VaultError> {
        if !self.is_unlocked() {
            return Err(VaultError::Locked);
        }
        self.data.remove(key);
        self.save()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    fn save(&self) -> Result<(), VaultError> {
        let (Some(password), Some(salt)) = (self.password.as_deref(), self.salt.as_ref()) else {
            return Err(VaultError::Locked);
        };
        let plaintext = serde_json::to_vec(&self.data).map_err(|_| VaultError::Crypto)?;
        let key = derive_key(password, salt);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| VaultError::Crypto)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|_| VaultError::Crypto)?;

        let mut out = Vec::with_capacity(1 + SALT_LEN + NONCE_LEN + ct.len());
        out.push(VERSION_GCM);
        out.extend_from_slice(salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &out)?;
        restrict_permissions(&self.path);
        Ok(())
    }
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn decrypt_gcm(password: &str, salt: &[u8], body: &[u8]) -> Option<Vec<u8>> {
    if body.len() < NONCE_LEN {
        return None;
    }
    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).ok()?;
    cipher
        .decrypt(Nonce::from_slice(&body[..NONCE_LEN]), &body[NONCE_LEN..])
        .ok()
}

/// Legacy format: HMAC-SHA256 over the ciphertext, then a keystream built
/// from HMAC(key, counter) blocks XORed with the plaintext.
fn decrypt_ctr(password: &str, salt: &[u8], body: &[u8]) -> Option<Vec<u8>> {
    if body.len() < TAG_LEN {
        return None;
    }
    let (tag, ct) = body.split_at(TAG_LEN);
    let hmac_key = derive_subkey(password, salt, b"hmac");
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&hmac_key).ok()?;
    mac.update(ct);
    let expected = mac.finalize().into_bytes();
    if expected.ct_eq(tag).unwrap_u8() != 1 {
        return None;
    }
    let enc_key = derive_subkey(password, salt, b"enc");
    Some(ctr_xor(&enc_key, ct))
}

fn derive_subkey(password: &str, salt: &[u8], label: &[u8]) -> [u8; 32] {
    let mut salted = Vec::with_capacity(salt.len() + label.len());
    salted.extend_from_slice(salt);
    salted.extend_from_slice(label);
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salted, PBKDF2_ITERATIONS, &mut key);
    key
}

fn ctr_xor(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (counter, chunk) in data.chunks(32).enumerate() {
        let mut mac = match <Hmac<Sha256> as Mac>::new_from_slice(key) {
            Ok(m) => m,
            Err(_) => return out,
        };
        mac.update(&(counter as u64).to_be_bytes());
        let block = mac.finalize().into_bytes();
        out.extend(chunk.iter().zip(block.iter()).map(|(b, k)| b ^ k));
    }
    out
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), "could not restrict vault permissions: {e}");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path().join("vault"));
        (dir, vault)
    }

    #[test]
    fn create_set_reload_get_round_trip() {
        let (_dir, mut v) = temp_vault();
        v.create("hunter2").unwrap();
        v.set("anthropic_api_key", "sk-ant-test").unwrap();

        let mut v2 = Vault::new(v.path().to_path_buf());
        assert!(v2.unlock("hunter2"));
        assert_eq!(v2.get("anthropic_api_key"), Some("sk-ant-test"));
    }

    #[test]
    fn wrong_password_fails_silently() {
        let (_dir, mut v) = temp_vault();
        v.create("correct").unwrap();
        v.set("k", "v").unwrap();

        let mut v2 = Vault::new(v.path().to_path_buf());
        assert!(!v2.unlock("incorrect"));
        assert!(!v2.is_unlocked());
        assert!(v2.get("k").is_none());
    }

    #[test]
    fn unlock_missing_file_returns_false() {
        let (_dir, mut v) = temp_vault();
        assert!(!v.unlock("anything"));
    }

    #[test]
    fn truncated_file_returns_false() {
        let (_dir, mut v) = temp_vault();
        std::fs::write(v.path(), [0x03, 0x00, 0x01]).unwrap();
        assert!(!v.unlock("pw"));
    }

    #[test]
    fn delete_removes_key() {
        let (_dir, mut v) = temp_vault();
        v.create("pw").unwrap();
        v.set("a", "1").unwrap();
        v.set("b", "2").unwrap();
        v.delete("a").unwrap();
        assert!(v.get("a").is_none());
        assert_eq!(v.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn set_on_locked_vault_errors() {
        let (_dir, mut v) = temp_vault();
        assert!(matches!(v.set("k", "v"), Err(VaultError::Locked)));
    }

    #[test]
    fn legacy_ctr_format_still_unlocks() {
        // Build a version-0x02 file by hand the way the old writer did.
        let (_dir, mut v) = temp_vault();
        let password = "legacy-pw";
        let salt = [7u8; SALT_LEN];
        let plaintext = serde_json::to_vec(&BTreeMap::from([(
            "openai_api_key".to_string(),
            "sk-legacy".to_string(),
        )]))
        .unwrap();
        let enc_key = derive_subkey(password, &salt, b"enc");
        let ct = ctr_xor(&enc_key, &plaintext);
        let hmac_key = derive_subkey(password, &salt, b"hmac");
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&hmac_key).unwrap();
        mac.update(&ct);
        let tag = mac.finalize().into_bytes();

        let mut raw = vec![VERSION_CTR];
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&tag);
        raw.extend_from_slice(&ct);
        std::fs::write(v.path(), &raw).unwrap();

        assert!(v.unlock(password));
        assert_eq!(v.get("openai_api_key"), Some("sk-legacy"));
    }

    #[test]
    fn legacy_ctr_wrong_password_fails() {
        let (_dir, mut v) = temp_vault();
        let salt = [9u8; SALT_LEN];
        let enc_key = derive_subkey("right", &salt, b"enc");
        let ct = ctr_xor(&enc_key, b"{}");
        let hmac_key = derive_subkey("right", &salt, b"hmac");
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&hmac_key).unwrap();
        mac.update(&ct);
        let tag = mac.finalize().into_bytes();
        let mut raw = vec![VERSION_CTR];
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&tag);
        raw.extend_from_slice(&ct);
        std::fs::write(v.path(), &raw).unwrap();

        assert!(!v.unlock("wrong"));
    }

    #[test]
    fn save_rewrites_as_gcm() {
        let (_dir, mut v) = temp_vault();
        v.create("pw").unwrap();
        v.set("k", "v").unwrap();
        let raw = std::fs::read(v.path()).unwrap();
        assert_eq!(raw[0], VERSION_GCM);
    }

    #[test]
    fn ctr_xor_is_symmetric() {
        let key = [42u8; 32];
        let data = b"some data longer than one 32-byte keystream block for coverage";
        let ct = ctr_xor(&key, data);
        assert_ne!(&ct[..], &data[..]);
        assert_eq!(ctr_xor(&key, &ct), data);
    }
}

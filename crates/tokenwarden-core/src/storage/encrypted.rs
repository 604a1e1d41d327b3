//! Session snapshot sealed with a passphrase.
//!
//! Layout: `TWS1` magic, 16-byte Argon2 salt, 12-byte nonce, then the
//! ChaCha20-Poly1305 ciphertext of the session JSON. A fresh salt and nonce
//! are drawn on every write.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use super::SessionStorage;
use crate::auth::Session;

/// Encrypted session file name in cache directory
pub const ENCRYPTED_SESSION_FILE: &str = "session.sealed";

const MAGIC: &[u8; 4] = b"TWS1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_LEN;

pub struct EncryptedFileStorage {
    path: PathBuf,
    passphrase: String,
}

impl EncryptedFileStorage {
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: passphrase.into(),
        }
    }

    pub fn in_dir(cache_dir: &Path, passphrase: impl Into<String>) -> Self {
        Self::new(cache_dir.join(ENCRYPTED_SESSION_FILE), passphrase)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self, salt: &[u8]) -> Result<ChaCha20Poly1305> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| anyhow!("Failed to derive session key: {e}"))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher(&salt)?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| anyhow!("Failed to encrypt session: {e}"))?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        sealed.extend_from_slice(MAGIC);
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < HEADER_LEN || &sealed[..MAGIC.len()] != MAGIC {
            bail!("Session file is not a sealed session");
        }
        let salt = &sealed[MAGIC.len()..MAGIC.len() + SALT_LEN];
        let nonce = &sealed[MAGIC.len() + SALT_LEN..HEADER_LEN];

        self.cipher(salt)?
            .decrypt(Nonce::from_slice(nonce), &sealed[HEADER_LEN..])
            .map_err(|_| anyhow!("Failed to decrypt session: wrong passphrase or corrupted file"))
    }
}

impl SessionStorage for EncryptedFileStorage {
    fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let sealed = std::fs::read(&self.path).context("Failed to read sealed session file")?;
        let plaintext = self.open(&sealed)?;
        let session = serde_json::from_slice(&plaintext)
            .context("Failed to parse decrypted session")?;
        Ok(Some(session))
    }

    fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session directory")?;
        }
        let plaintext = serde_json::to_vec(session)?;
        let sealed = self.seal(&plaintext)?;
        std::fs::write(&self.path, sealed).context("Failed to write sealed session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove sealed session file")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionUpdate;
    use chrono::Utc;

    fn session() -> Session {
        Session::default().merged(
            SessionUpdate::access("a1", 600).with_refresh_token("r1", None),
            Utc::now(),
            chrono::Duration::seconds(5),
        )
    }

    #[test]
    fn test_sealed_file_hides_tokens() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let storage = EncryptedFileStorage::in_dir(dir.path(), "correct horse");
        let saved = session();

        storage.save(&saved).expect("save should succeed");

        let raw = std::fs::read(storage.path()).expect("Failed to read sealed file");
        assert!(raw.starts_with(MAGIC));
        assert!(!String::from_utf8_lossy(&raw).contains("refreshToken"));
        assert_eq!(storage.load().expect("load should succeed"), Some(saved));
    }

    #[test]
    fn test_wrong_passphrase_fails_to_load() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        EncryptedFileStorage::in_dir(dir.path(), "correct horse")
            .save(&session())
            .expect("save should succeed");

        let intruder = EncryptedFileStorage::in_dir(dir.path(), "battery staple");
        assert!(intruder.load().is_err());
    }

    #[test]
    fn test_tampered_file_fails_to_load() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let storage = EncryptedFileStorage::in_dir(dir.path(), "correct horse");
        storage.save(&session()).expect("save should succeed");

        let mut raw = std::fs::read(storage.path()).expect("Failed to read sealed file");
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(storage.path(), raw).expect("Failed to write tampered file");

        assert!(storage.load().is_err());
    }

    #[test]
    fn test_plain_json_is_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let storage = EncryptedFileStorage::in_dir(dir.path(), "correct horse");
        std::fs::write(storage.path(), "{}").expect("Failed to write test file");

        assert!(storage.load().is_err());
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let storage = EncryptedFileStorage::in_dir(dir.path(), "correct horse");
        storage.save(&session()).expect("save should succeed");

        storage.clear().expect("clear should succeed");

        assert!(!storage.path().exists());
        assert!(storage.load().expect("load should succeed").is_none());
    }
}

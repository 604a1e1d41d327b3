//! Durable storage for the session snapshot.
//!
//! This module provides:
//! - `SessionStorage`: the load/save/clear contract the session store persists through
//! - `MemoryStorage`: process-local storage, used by tests
//! - `FileStorage`: plain JSON in the cache directory
//! - `KeyringStorage`: the OS keychain via keyring
//! - `EncryptedFileStorage`: ChaCha20-Poly1305 sealed file, Argon2-derived key

pub mod encrypted;
pub mod file;
pub mod keyring;

use std::sync::Mutex;

use anyhow::Result;

use crate::auth::Session;

pub use encrypted::EncryptedFileStorage;
pub use file::FileStorage;
pub use keyring::KeyringStorage;

/// A durable key-value slot holding one session snapshot.
///
/// Calls are synchronous: every session mutation is written through before
/// the mutation returns.
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> Result<Option<Session>>;
    fn save(&self, session: &Session) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Storage that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    slot: Mutex<Option<Session>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a snapshot already stored, as if written by a previous run
    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self) -> Result<Option<Session>> {
        Ok(self.snapshot())
    }

    fn save(&self, session: &Session) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

impl<S: SessionStorage + ?Sized> SessionStorage for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<Session>> {
        (**self).load()
    }

    fn save(&self, session: &Session) -> Result<()> {
        (**self).save(session)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

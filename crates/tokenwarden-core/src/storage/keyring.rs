use anyhow::{Context, Result};
use keyring::Entry;

use super::SessionStorage;
use crate::auth::Session;

/// Keychain service name the session is filed under
pub const SERVICE_NAME: &str = "tokenwarden";

/// Session snapshot stored as a secret in the OS keychain.
pub struct KeyringStorage {
    account: String,
}

impl KeyringStorage {
    /// One keychain entry per `account` (e.g. the API host)
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account).context("Failed to create keyring entry")
    }
}

impl SessionStorage for KeyringStorage {
    fn load(&self) -> Result<Option<Session>> {
        match self.entry()?.get_password() {
            Ok(secret) => {
                let session = serde_json::from_str(&secret)
                    .context("Failed to parse session from keychain")?;
                Ok(Some(session))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        }
    }

    fn save(&self, session: &Session) -> Result<()> {
        let secret = serde_json::to_string(session)?;
        self.entry()?
            .set_password(&secret)
            .context("Failed to store session in keychain")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::SessionStorage;
use crate::auth::Session;

/// Session file name in cache directory
pub const SESSION_FILE: &str = "session.json";

/// Plain JSON session snapshot on disk.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `session.json` inside `cache_dir`
    pub fn in_dir(cache_dir: &Path) -> Self {
        Self::new(cache_dir.join(SESSION_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStorage for FileStorage {
    fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read session file")?;
        let session = serde_json::from_str(&contents)
            .context("Failed to parse session file")?;
        Ok(Some(session))
    }

    fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create session directory")?;
        }
        let contents = serde_json::to_string_pretty(session)?;
        std::fs::write(&self.path, contents)
            .context("Failed to write session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .context("Failed to remove session file")?;
        }
        Ok(())
    }
}

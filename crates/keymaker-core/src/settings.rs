use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::autolock::AutolockTimeout;
use crate::crypto::KdfParams;

pub const DEFAULT_SERVICE_NAME: &str = "Keymaker";
pub const DEFAULT_MAX_FAILED_UNLOCKS: u32 = 10;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings parse: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeymakerSettings {
    pub service_name: String,
    pub autolock: AutolockTimeout,
    pub pin_kdf: KdfParams,
    /// Consecutive failed significant unlocks before the main key is wiped. 0 disables.
    pub max_failed_unlocks: u32,
}

impl Default for KeymakerSettings {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.into(),
            autolock: AutolockTimeout::default(),
            pin_kdf: KdfParams::default(),
            max_failed_unlocks: DEFAULT_MAX_FAILED_UNLOCKS,
        }
    }
}

impl KeymakerSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "keymaker";
pub const APP_NAME: &str = "keymaker";

pub const SETTINGS_ENV: &str = "KEYMAKER_SETTINGS";

pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn settings_path() -> Option<PathBuf> {
    if let Ok(override_path) = std::env::var(SETTINGS_ENV) {
        return Some(PathBuf::from(override_path));
    }
    config_dir().map(|dir| dir.join("settings.json"))
}

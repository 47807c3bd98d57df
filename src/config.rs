use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::MlhubError;

pub const API_KEY_ENV_VARIABLE: &str = "MLHUB_API_KEY";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Profiles {
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub api_key: String,
}

pub struct ProfileStore;

impl ProfileStore {
    pub fn profiles_path() -> Result<PathBuf, MlhubError> {
        let dirs = BaseDirs::new().ok_or_else(|| {
            MlhubError::Filesystem("unable to resolve home directory".to_string())
        })?;
        Ok(dirs.home_dir().join(".mlhub").join("profiles.json"))
    }

    pub fn load() -> Result<Profiles, MlhubError> {
        let path = Self::profiles_path()?;
        if !path.exists() {
            return Ok(Profiles::default());
        }
        let content =
            fs::read_to_string(&path).map_err(|_| MlhubError::ProfilesRead(path.clone()))?;
        serde_json::from_str(&content).map_err(|err| MlhubError::ProfilesParse(err.to_string()))
    }

    /// Write or replace one profile, keeping the rest of the file intact.
    pub fn save_profile(name: &str, api_key: &str) -> Result<PathBuf, MlhubError> {
        let path = Self::profiles_path()?;
        let mut profiles = Self::load()?;
        profiles.profiles.insert(
            name.to_string(),
            Profile {
                api_key: api_key.trim().to_string(),
            },
        );
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| MlhubError::Filesystem(err.to_string()))?;
        }
        let content = serde_json::to_vec_pretty(&profiles)
            .map_err(|err| MlhubError::Filesystem(err.to_string()))?;
        fs::write(&path, content).map_err(|err| MlhubError::Filesystem(err.to_string()))?;
        Ok(path)
    }
}

/// Resolve an API key: explicit argument, then environment, then the named
/// (or default) profile.
pub fn resolve_api_key(
    api_key: Option<&str>,
    profile: Option<&str>,
) -> Result<String, MlhubError> {
    if let Some(key) = api_key {
        if !key.trim().is_empty() {
            return Ok(key.trim().to_string());
        }
    }
    if let Ok(key) = std::env::var(API_KEY_ENV_VARIABLE) {
        if !key.trim().is_empty() {
            return Ok(key.trim().to_string());
        }
    }
    let profiles = ProfileStore::load()?;
    let name = profile.unwrap_or("default");
    profiles
        .profiles
        .get(name)
        .map(|profile| profile.api_key.clone())
        .ok_or_else(|| {
            MlhubError::ApiKeyNotFound(format!(
                "no \"{name}\" profile configured and {API_KEY_ENV_VARIABLE} is not set"
            ))
        })
}

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "stagehand.yaml";

/// Deployment configuration, loaded once per invocation.
/// Keys are camelCase and case-sensitive.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub custom_packages: Vec<CustomPackage>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub platform_image: Option<String>,
}

/// A package outside the curated catalog, fetched ad hoc from a local path,
/// git remote, or HTTP archive. Identity for matching is `id` if present,
/// else `path`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CustomPackage {
    #[serde(default)]
    pub id: Option<String>,
    pub path: String,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default)]
    pub ssh_password: Option<String>,
}

impl CustomPackage {
    pub fn ad_hoc(path: impl Into<String>) -> Self {
        CustomPackage {
            id: None,
            path: path.into(),
            ssh_key: None,
            ssh_password: None,
        }
    }

    /// Does a command-line custom path select this entry?
    pub fn matches(&self, value: &str) -> bool {
        self.id.as_deref() == Some(value) || self.path == value
    }
}

/// A named, reusable bundle of deployment options. `dev`/`only` left out of
/// the config declare nothing and cannot conflict with an explicit flag.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub env_files: Vec<PathBuf>,
    #[serde(default)]
    pub env_vars: Vec<String>,
    #[serde(default)]
    pub dev: Option<bool>,
    #[serde(default)]
    pub only: Option<bool>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Name prefix for the reserved container and volume.
    pub fn project(&self) -> &str {
        self.project_name.as_deref().unwrap_or("stagehand")
    }
}

/// `--config` wins; otherwise `./stagehand.yaml`, falling back to the
/// per-user config directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        let user = dir.join("stagehand").join(DEFAULT_CONFIG_FILE);
        if user.exists() {
            return user;
        }
    }
    local
}

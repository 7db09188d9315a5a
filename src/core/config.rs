use crate::{AppManError, Result, constants::*};
use crate::core::profile::Architecture;
use crate::utils::fs::{get_config_dir, get_data_dir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppManConfig {
    /// Where `data.json` lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Directory holding manifest profiles (`*.toml`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles_dir: Option<PathBuf>,
    /// Parent of the per-profile temp directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub keep_failed_temp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub path: PathConfig,
    /// Profile groups, expanded on the command line
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    HTTP_TIMEOUT.as_secs()
}

fn default_user_agent() -> String {
    USER_AGENT.to_string()
}

fn default_chunk_size() -> usize {
    CHUNK_SIZE
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PathStoreKind {
    Registry,
    File,
}

impl Default for PathStoreKind {
    fn default() -> Self {
        if cfg!(windows) {
            PathStoreKind::Registry
        } else {
            PathStoreKind::File
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathConfig {
    #[serde(default)]
    pub store: PathStoreKind,
    /// Backing file of the file store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Command run after every PATH write; empty disables notification
    #[serde(default = "default_refresh_command")]
    pub refresh_command: Vec<String>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            store: PathStoreKind::default(),
            file: None,
            refresh_command: default_refresh_command(),
        }
    }
}

fn default_refresh_command() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string(), "/c".to_string(), "RefreshEnv.bat".to_string()]
    } else {
        Vec::new()
    }
}

impl AppManConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| AppManError::fs(path, e))?;
        let config: AppManConfig = toml::from_str(&contents)
            .map_err(|e| AppManError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the default location; a missing file means defaults
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        if fs::try_exists(&path).await.unwrap_or(false) {
            Self::load(&path).await
        } else {
            Ok(Self::default())
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| AppManError::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| AppManError::fs(parent, e))?;
        }
        fs::write(path, contents).await.map_err(|e| AppManError::fs(path, e))?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(get_config_dir()?.join(CONFIG_FILE))
    }

    fn validate(&self) -> Result<()> {
        if self.network.chunk_size == 0 {
            return Err(AppManError::Config("network.chunk_size must be positive".to_string()));
        }
        if self.network.timeout_secs == 0 {
            return Err(AppManError::Config("network.timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_data_dir(),
        }
    }

    pub fn profiles_dir(&self) -> Result<PathBuf> {
        match &self.profiles_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_config_dir()?.join("profiles")),
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DATABASE_FILE))
    }

    /// Backing file of the file PATH store
    pub fn path_file(&self) -> Result<PathBuf> {
        match &self.path.file {
            Some(file) => Ok(file.clone()),
            None => Ok(self.data_dir()?.join("path.txt")),
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture.unwrap_or_else(Architecture::host)
    }
}

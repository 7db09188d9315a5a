use crate::{AppManError, Result};
use crate::utils::fs::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// What is known about one installed program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledProgram {
    pub version: String,
    pub path: PathBuf,
    #[serde(default)]
    pub executables: Vec<PathBuf>,
    pub installed_at: DateTime<Utc>,
}

impl InstalledProgram {
    pub fn new(version: impl Into<String>, path: impl Into<PathBuf>, executables: Vec<PathBuf>) -> Self {
        Self {
            version: version.into(),
            path: path.into(),
            executables,
            installed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Contents {
    #[serde(default)]
    installed: BTreeMap<String, InstalledProgram>,
    /// dependency -> installed programs that declared it
    #[serde(default)]
    dependents: BTreeMap<String, BTreeSet<String>>,
}

/// Installed programs and reverse dependencies, persisted as JSON
#[derive(Debug)]
pub struct ProgramDatabase {
    path: PathBuf,
    contents: Contents,
}

impl ProgramDatabase {
    /// Open the database at `path`; a missing file is an empty database
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AppManError::Database(format!("Cannot parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no database yet");
                Contents::default()
            }
            Err(e) => {
                return Err(AppManError::Database(format!(
                    "Cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    pub async fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.contents)
            .map_err(|e| AppManError::Database(format!("Cannot serialize database: {}", e)))?;
        atomic_write(&self.path, &json).await?;
        debug!(path = %self.path.display(), "database saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&InstalledProgram> {
        self.contents.installed.get(name)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.contents.installed.contains_key(name)
    }

    pub fn installed_version(&self, name: &str) -> Option<&str> {
        self.get(name).map(|p| p.version.as_str())
    }

    pub fn installed_names(&self) -> Vec<String> {
        self.contents.installed.keys().cloned().collect()
    }

    pub fn installed(&self) -> impl Iterator<Item = (&String, &InstalledProgram)> {
        self.contents.installed.iter()
    }

    pub fn record_install<'a>(
        &mut self,
        name: &str,
        record: InstalledProgram,
        dependencies: impl IntoIterator<Item = &'a String>,
    ) {
        self.contents.installed.insert(name.to_string(), record);
        for dep in dependencies {
            self.contents
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(name.to_string());
        }
    }

    /// Replace version and executables, keeping the install timestamp
    pub fn record_update(&mut self, name: &str, version: &str, executables: Vec<PathBuf>) -> Result<()> {
        let record = self
            .contents
            .installed
            .get_mut(name)
            .ok_or_else(|| AppManError::Database(format!("\"{}\" is not installed", name)))?;
        record.version = version.to_string();
        record.executables = executables;
        Ok(())
    }

    /// Drop a program and every reverse-dependency mention of it
    pub fn forget(&mut self, name: &str) -> Option<InstalledProgram> {
        let removed = self.contents.installed.remove(name);
        self.contents.dependents.remove(name);
        for users in self.contents.dependents.values_mut() {
            users.remove(name);
        }
        self.contents.dependents.retain(|_, users| !users.is_empty());
        removed
    }

    /// Installed programs that still need `name`
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.contents
            .dependents
            .get(name)
            .map(|users| {
                users
                    .iter()
                    .filter(|user| self.is_installed(user))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

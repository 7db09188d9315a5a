//! Profile implementations shipped with AppMan

pub mod manifest;

use crate::{AppManError, Result};
use crate::core::profile::Profile;
use crate::core::registry::ProfileRegistry;
use manifest::ManifestProfile;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Load every `*.toml` manifest of `dir`, sorted by file name.
/// A missing directory holds no profiles.
pub async fn load_manifests(dir: &Path) -> Result<Vec<Arc<dyn Profile>>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "no profiles directory");
            return Ok(Vec::new());
        }
        Err(e) => return Err(AppManError::fs(dir, e)),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| AppManError::fs(dir, e))? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "toml") && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut profiles: Vec<Arc<dyn Profile>> = Vec::with_capacity(paths.len());
    for path in paths {
        profiles.push(Arc::new(ManifestProfile::load(&path).await?));
    }
    info!(count = profiles.len(), dir = %dir.display(), "profiles loaded");
    Ok(profiles)
}

/// Registry holding the manifests of `dir` and the configured groups
pub async fn build_registry(dir: &Path, groups: &BTreeMap<String, Vec<String>>) -> Result<ProfileRegistry> {
    let mut registry = ProfileRegistry::new();
    for profile in load_manifests(dir).await? {
        registry.register(profile)?;
    }
    for (name, members) in groups {
        registry.add_group(name, members)?;
    }
    Ok(registry)
}

use crate::{AppManError, Result};
use crate::core::profile::Profile;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Every known profile, keyed by lower-case name, plus profile groups
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: Vec<Arc<dyn Profile>>,
    index: FxHashMap<String, usize>,
    groups: BTreeMap<String, Vec<String>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: Arc<dyn Profile>) -> Result<()> {
        let name = profile.name().to_string();
        if name.is_empty() {
            return Err(AppManError::Config("Profile with an empty name".to_string()));
        }
        if self.index.contains_key(&name) {
            return Err(AppManError::Config(format!("Profile \"{}\" registered twice", name)));
        }
        if self.groups.contains_key(&name) {
            return Err(AppManError::Config(format!(
                "Profile \"{}\" collides with a group of the same name",
                name
            )));
        }
        debug!(profile = %name, "registered");
        self.index.insert(name, self.profiles.len());
        self.profiles.push(profile);
        Ok(())
    }

    /// Register a group of profiles, expanded wherever names are accepted
    pub fn add_group(&mut self, name: &str, members: &[String]) -> Result<()> {
        let name = name.trim().to_lowercase();
        if self.index.contains_key(&name) {
            return Err(AppManError::Config(format!(
                "Group \"{}\" collides with a profile of the same name",
                name
            )));
        }
        if self.groups.contains_key(&name) {
            return Err(AppManError::Config(format!("Group \"{}\" defined twice", name)));
        }
        if members.is_empty() {
            return Err(AppManError::Config(format!("Group \"{}\" is empty", name)));
        }

        let mut normalized = Vec::with_capacity(members.len());
        for member in members {
            let member = member.trim().to_lowercase();
            if member == name {
                return Err(AppManError::Config(format!("Group \"{}\" contains itself", name)));
            }
            if !self.index.contains_key(&member) {
                return Err(AppManError::Config(format!(
                    "Group \"{}\" references unknown profile \"{}\"",
                    name, member
                )));
            }
            if !normalized.contains(&member) {
                normalized.push(member);
            }
        }

        self.groups.insert(name, normalized);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Profile>> {
        self.index
            .get(&name.to_lowercase())
            .map(|&i| Arc::clone(&self.profiles[i]))
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn Profile>> {
        self.get(name)
            .ok_or_else(|| AppManError::ProfileNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_lowercase())
    }

    /// Profile names in registration order
    pub fn names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name().to_string()).collect()
    }

    /// Registration position, used to keep independent profiles stable
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Replace group names by their members, lower-case and without
    /// duplicates. Unknown names are an error.
    pub fn expand(&self, names: &[String]) -> Result<Vec<String>> {
        let mut expanded: Vec<String> = Vec::new();
        for name in names {
            let key = name.trim().to_lowercase();
            let members = if let Some(members) = self.groups.get(&key) {
                members.clone()
            } else if self.index.contains_key(&key) {
                vec![key]
            } else {
                return Err(AppManError::ProfileNotFound(name.clone()));
            };
            for member in members {
                if !expanded.contains(&member) {
                    expanded.push(member);
                }
            }
        }
        Ok(expanded)
    }
}

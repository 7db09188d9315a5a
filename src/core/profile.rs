use crate::Result;
use crate::net::client::WebClient;
use crate::net::request::DownloadRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Bitness of the machine programs are installed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "32")]
    X86,
    #[serde(rename = "64")]
    X64,
}

impl Architecture {
    pub fn host() -> Self {
        if std::env::consts::ARCH.contains("64") {
            Architecture::X64
        } else {
            Architecture::X86
        }
    }

    pub fn is_64bit(self) -> bool {
        self == Architecture::X64
    }

    /// Short name used in download URLs
    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "32-bit"),
            Architecture::X64 => write!(f, "64-bit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Install,
    Update,
    Remove,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Install => "install",
            Mode::Update => "update",
            Mode::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// Desktop shortcut a profile wants after registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutSpec {
    /// Relative to the install path
    pub executable: PathBuf,
    pub display_name: String,
}

/// Static description of a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSpec {
    name: String,
    default_install_path: PathBuf,
    dependencies: BTreeSet<String>,
    portable: bool,
    can_update: bool,
    x64_only: bool,
    shortcut: Option<ShortcutSpec>,
}

impl ProfileSpec {
    pub fn new(name: &str, default_install_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            default_install_path: default_install_path.into(),
            dependencies: BTreeSet::new(),
            portable: true,
            can_update: true,
            x64_only: false,
            shortcut: None,
        }
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.dependencies.insert(name.trim().to_lowercase());
        self
    }

    pub fn portable(mut self, yes: bool) -> Self {
        self.portable = yes;
        self
    }

    pub fn can_update(mut self, yes: bool) -> Self {
        self.can_update = yes;
        self
    }

    pub fn x64_only(mut self, yes: bool) -> Self {
        self.x64_only = yes;
        self
    }

    pub fn shortcut(mut self, shortcut: ShortcutSpec) -> Self {
        self.shortcut = Some(shortcut);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_install_path(&self) -> &Path {
        &self.default_install_path
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn is_portable(&self) -> bool {
        self.portable
    }

    pub fn is_updatable(&self) -> bool {
        self.can_update
    }

    pub fn is_x64_only(&self) -> bool {
        self.x64_only
    }

    pub fn shortcut_spec(&self) -> Option<&ShortcutSpec> {
        self.shortcut.as_ref()
    }
}

/// Everything a hook may know about the current run
#[derive(Clone)]
pub struct RunContext {
    pub mode: Mode,
    pub architecture: Architecture,
    pub install_path: PathBuf,
    /// Scratch directory, deleted when the run ends
    pub temp_dir: PathBuf,
    pub installed_version: Option<String>,
    pub client: WebClient,
}

/// Version picked by discovery, with the files fetched for it
#[derive(Debug, Clone)]
pub struct Release {
    pub version: String,
    pub downloads: Vec<DownloadRequest>,
}

impl Release {
    /// Files that were actually written by the downloader
    pub fn downloaded_files(&self) -> impl Iterator<Item = &Path> {
        self.downloads
            .iter()
            .map(DownloadRequest::path)
            .filter(|path| path.is_file())
    }
}

/// Program-specific knowledge behind a fixed lifecycle contract.
///
/// Only `spec`, `latest_version` and `download_requests` are mandatory; the
/// other hooks default to doing nothing.
#[async_trait]
pub trait Profile: Send + Sync {
    fn spec(&self) -> &ProfileSpec;

    fn name(&self) -> &str {
        self.spec().name()
    }

    async fn latest_version(&self, ctx: &RunContext) -> Result<String>;

    /// Files to fetch for `version`; must not be empty
    fn download_requests(&self, ctx: &RunContext, version: &str) -> Result<Vec<DownloadRequest>>;

    async fn extract(&self, _ctx: &RunContext, _release: &Release) -> Result<()> {
        Ok(())
    }

    async fn install(&self, ctx: &RunContext, release: &Release) -> Result<()> {
        self.update(ctx, release).await
    }

    async fn update(&self, _ctx: &RunContext, _release: &Release) -> Result<()> {
        Ok(())
    }

    /// Absolute directories to put on PATH
    fn executable_dirs(&self, _ctx: &RunContext) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    async fn remove(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
}

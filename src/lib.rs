//! AppMan - application manager for portable Windows programs
//!
//! Every program is described by a profile that knows how to discover its
//! latest version and where to download it. The crate drives those profiles
//! through a uniform lifecycle:
//! - Dependency-ordered install, update and remove runs
//! - Sequential chunked downloads with progress accounting
//! - Merge-copy extraction that collects per-entry failures
//! - Atomic edits of the machine-wide PATH variable

// Use mimalloc for better memory performance
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod cli;
pub mod core;
pub mod net;
pub mod profiles;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{
    config::AppManConfig,
    database::ProgramDatabase,
    orchestrator::{Orchestrator, Outcome, ProfileReport, RunReport, Selection, SkipReason},
    path_env::PathEnvironment,
    profile::{Architecture, Mode, Profile, ProfileSpec, Release, RunContext},
    registry::ProfileRegistry,
    resolver::{DependencyResolver, Scope},
};

pub use net::{
    client::WebClient,
    downloader::Downloader,
    request::{BodyData, DownloadRequest, Method, QueryData},
};

pub use utils::{
    archive::ArchiveExtractor,
    fs::{atomic_write, CopyFailure, TreeMerger},
    progress::{ProgressSink, ProgressTracker, TransferProgress},
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppManError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Profile \"{profile}\" depends on unknown profile \"{dependency}\"")]
    UnknownDependency { profile: String, dependency: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Download of {url} failed: {reason}")]
    Transfer { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Copy failed for {} entries", .0.len())]
    TreeCopy(Vec<CopyFailure>),

    #[error("Archive extraction error: {0}")]
    Archive(String),

    #[error("Path store error: {0}")]
    PathStore(String),

    #[error("PATH updated, but running shells were not notified ({0}); restart open shells to see the changes")]
    Propagation(String),

    #[error("Program database error: {0}")]
    Database(String),

    #[error("{profile}: {stage} failed: {reason}")]
    Hook {
        profile: String,
        stage: &'static str,
        reason: String,
    },
}

impl AppManError {
    /// Configuration errors are never retried and fail only the affected profile.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AppManError::Config(_)
                | AppManError::InvalidField { .. }
                | AppManError::ProfileNotFound(_)
                | AppManError::UnknownDependency { .. }
                | AppManError::DependencyCycle(_)
        )
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        AppManError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppManError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppManError>;

/// Global constants for tuning
pub mod constants {
    use std::time::Duration;

    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(12);
    pub const CHUNK_SIZE: usize = 1024;
    pub const USER_AGENT: &str = concat!("appman/", env!("CARGO_PKG_VERSION"));
    pub const DATABASE_FILE: &str = "data.json";
    pub const CONFIG_FILE: &str = "appman.toml";

    /// Separator of PATH-like variables on the running platform
    #[cfg(windows)]
    pub const PATH_SEPARATOR: char = ';';
    #[cfg(not(windows))]
    pub const PATH_SEPARATOR: char = ':';
}

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use filetime::FileTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;
use crate::{Result, AppManError};

/// Atomic write operation - write to temp file then rename
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name()
        .ok_or_else(|| AppManError::fs(path, io::Error::new(
            io::ErrorKind::InvalidInput,
            "path has no file name"
        )))?;

    tokio::fs::create_dir_all(parent).await
        .map_err(|e| AppManError::fs(parent, e))?;

    // Write to temporary file first
    let temp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut file = tokio::fs::File::create(&temp_path).await
        .map_err(|e| AppManError::fs(&temp_path, e))?;
    file.write_all(contents).await
        .map_err(|e| AppManError::fs(&temp_path, e))?;
    file.sync_all().await
        .map_err(|e| AppManError::fs(&temp_path, e))?;
    drop(file);

    // Atomic rename
    tokio::fs::rename(&temp_path, path).await
        .map_err(|e| AppManError::fs(path, e))?;
    Ok(())
}

/// One entry that could not be copied
#[derive(Debug, Clone, PartialEq)]
pub struct CopyFailure {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub reason: String,
}

impl fmt::Display for CopyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.source.display(), self.destination.display(), self.reason)
    }
}

/// Recursive copy that merges into an existing destination.
///
/// Unlike a plain recursive copy the destination may already exist;
/// conflicting files are overwritten. Failures are collected per entry and
/// the walk always visits every sibling before reporting.
#[derive(Debug, Clone, Default)]
pub struct TreeMerger {
    preserve_symlinks: bool,
    ignore_dangling_symlinks: bool,
    ignore: Vec<String>,
}

impl TreeMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recreate symbolic links instead of copying what they point to
    pub fn preserve_symlinks(mut self, yes: bool) -> Self {
        self.preserve_symlinks = yes;
        self
    }

    /// Skip links whose target does not exist instead of reporting them
    pub fn ignore_dangling_symlinks(mut self, yes: bool) -> Self {
        self.ignore_dangling_symlinks = yes;
        self
    }

    /// Skip entries with this exact file name, at any depth
    pub fn ignore(mut self, name: impl Into<String>) -> Self {
        self.ignore.push(name.into());
        self
    }

    /// Merge `src` into `dst`, failing with every collected entry error.
    pub fn merge(&self, src: &Path, dst: &Path) -> Result<()> {
        let failures = self.merge_collect(src, dst);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppManError::TreeCopy(failures))
        }
    }

    /// Merge `src` into `dst` and return the failed entries.
    pub fn merge_collect(&self, src: &Path, dst: &Path) -> Vec<CopyFailure> {
        debug!(src = %src.display(), dst = %dst.display(), "merge copy");
        let mut failures = Vec::new();
        self.merge_dir(src, dst, true, &mut failures);
        failures
    }

    fn merge_dir(&self, src: &Path, dst: &Path, is_root: bool, failures: &mut Vec<CopyFailure>) {
        let entries = match fs::read_dir(src) {
            Ok(entries) => entries,
            Err(e) => {
                failures.push(failure(src, dst, e));
                return;
            }
        };

        // The destination is reused when present
        if !dst.is_dir() {
            if let Err(e) = fs::create_dir_all(dst) {
                failures.push(failure(src, dst, e));
                return;
            }
        }

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    failures.push(failure(src, dst, e));
                    continue;
                }
            };

            let name = entry.file_name();
            if self.ignore.iter().any(|ignored| name.to_string_lossy() == ignored.as_str()) {
                continue;
            }

            let src_path = entry.path();
            let dst_path = dst.join(&name);

            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    failures.push(failure(&src_path, &dst_path, e));
                    continue;
                }
            };

            if file_type.is_symlink() {
                self.copy_symlink(&src_path, &dst_path, failures);
            } else if file_type.is_dir() {
                self.merge_dir(&src_path, &dst_path, false, failures);
            } else if file_type.is_file() {
                if let Err(e) = copy_file(&src_path, &dst_path) {
                    failures.push(failure(&src_path, &dst_path, e));
                }
            } else {
                failures.push(CopyFailure {
                    source: src_path,
                    destination: dst_path,
                    reason: "unsupported special file".to_string(),
                });
            }
        }

        if let Err(e) = copy_times(src, dst) {
            if is_root {
                // Some platforms refuse directory timestamps
                warn!(dst = %dst.display(), error = %e, "could not copy root directory times");
            } else {
                failures.push(failure(src, dst, e));
            }
        }
    }

    fn copy_symlink(&self, src: &Path, dst: &Path, failures: &mut Vec<CopyFailure>) {
        if self.preserve_symlinks {
            let result = fs::read_link(src).and_then(|target| {
                if fs::symlink_metadata(dst).is_ok() {
                    remove_any(dst)?;
                }
                make_symlink(&target, dst, src.is_dir())
            });
            if let Err(e) = result {
                failures.push(failure(src, dst, e));
            }
            return;
        }

        match fs::metadata(src) {
            Err(_) if self.ignore_dangling_symlinks => {
                debug!(link = %src.display(), "skipping dangling symlink");
            }
            Err(e) => failures.push(failure(src, dst, e)),
            Ok(meta) if meta.is_dir() => self.merge_dir(src, dst, false, failures),
            Ok(_) => {
                if let Err(e) = copy_file(src, dst) {
                    failures.push(failure(src, dst, e));
                }
            }
        }
    }
}

fn failure(src: &Path, dst: &Path, err: io::Error) -> CopyFailure {
    CopyFailure {
        source: src.to_path_buf(),
        destination: dst.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Copy content, permissions and timestamps
fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a directory with the same name exists in the destination",
        ));
    }
    fs::copy(src, dst)?;
    copy_times(src, dst)
}

fn copy_times(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::metadata(src)?;
    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);
    filetime::set_file_times(dst, atime, mtime)
}

fn remove_any(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path, _is_dir: bool) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(not(any(unix, windows)))]
fn make_symlink(_target: &Path, _link: &Path, _is_dir: bool) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symbolic links are not supported"))
}

/// Get config directory for AppMan
pub fn get_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("appman"))
        .ok_or_else(|| AppManError::Config("Config directory not found".to_string()))
}

/// Get data directory for AppMan
pub fn get_data_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("appman"))
        .ok_or_else(|| AppManError::Config("Data directory not found".to_string()))
}

/// Calculate directory size
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

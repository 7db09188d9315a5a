use crate::{AppManError, Result, constants::PATH_SEPARATOR};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Persistent home of the raw PATH value
pub trait PathStore: Send {
    fn read(&self) -> Result<String>;

    /// Replace the stored value in one call
    fn write(&mut self, value: &str) -> Result<()>;
}

/// Tells running shells that the environment changed
pub trait EnvNotifier: Send {
    fn notify(&self) -> Result<()>;
}

/// PATH kept in a plain file; a missing file reads as empty
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PathStore for FileStore {
    fn read(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(value) => Ok(value.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(AppManError::PathStore(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Temp file next to the target, renamed over it
    fn write(&mut self, value: &str) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| AppManError::PathStore(format!("cannot create {}: {}", dir.display(), e)))?;

        let mut staged = NamedTempFile::new_in(dir)
            .map_err(|e| AppManError::PathStore(format!("cannot stage in {}: {}", dir.display(), e)))?;
        staged
            .write_all(value.as_bytes())
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| AppManError::PathStore(format!("cannot write {}: {}", self.path.display(), e)))?;
        staged
            .persist(&self.path)
            .map_err(|e| AppManError::PathStore(format!("cannot replace {}: {}", self.path.display(), e.error)))?;
        Ok(())
    }
}

const ENVIRONMENT_KEY: &str = r"SYSTEM\CurrentControlSet\Control\Session Manager\Environment";

/// Machine-wide `Path` value under `HKLM\SYSTEM\...\Session Manager\Environment`, read and written
/// as UTF-16 `REG_EXPAND_SZ` data
pub struct RegistryStore {
    key: String,
    value: String,
}

impl RegistryStore {
    pub fn new() -> Self {
        Self {
            key: ENVIRONMENT_KEY.to_string(),
            value: "Path".to_string(),
        }
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
impl PathStore for RegistryStore {
    fn read(&self) -> Result<String> {
        use winreg::RegKey;
        use winreg::enums::{HKEY_LOCAL_MACHINE, RegType};

        let key = RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey(&self.key)
            .map_err(|e| AppManError::PathStore(format!("cannot open HKLM\\{}: {}", self.key, e)))?;
        let raw = key
            .get_raw_value(&self.value)
            .map_err(|e| AppManError::PathStore(format!("cannot read {}: {}", self.value, e)))?;
        if !matches!(raw.vtype, RegType::REG_SZ | RegType::REG_EXPAND_SZ) {
            return Err(AppManError::PathStore(format!(
                "{} is {:?}, not a string value",
                self.value, raw.vtype
            )));
        }
        decode_reg_string(&raw.bytes)
    }

    fn write(&mut self, value: &str) -> Result<()> {
        use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_SET_VALUE, RegType};
        use winreg::{RegKey, RegValue};

        let key = RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey_with_flags(&self.key, KEY_SET_VALUE)
            .map_err(|e| AppManError::PathStore(format!("cannot open HKLM\\{}: {}", self.key, e)))?;
        let data = RegValue {
            bytes: encode_reg_string(value),
            vtype: RegType::REG_EXPAND_SZ,
        };
        key.set_raw_value(&self.value, &data)
            .map_err(|e| AppManError::PathStore(format!("cannot write {}: {}", self.value, e)))
    }
}

#[cfg(not(windows))]
impl PathStore for RegistryStore {
    fn read(&self) -> Result<String> {
        Err(AppManError::PathStore(
            "the registry store is only available on Windows".to_string(),
        ))
    }

    fn write(&mut self, _value: &str) -> Result<()> {
        Err(AppManError::PathStore(
            "the registry store is only available on Windows".to_string(),
        ))
    }
}

/// Registry string data: little-endian UTF-16, up to the first NUL
#[cfg_attr(not(windows), allow(dead_code))]
fn decode_reg_string(bytes: &[u8]) -> Result<String> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let end = units.iter().position(|u| *u == 0).unwrap_or(units.len());
    String::from_utf16(&units[..end])
        .map_err(|e| AppManError::PathStore(format!("Path is not valid UTF-16: {}", e)))
}

#[cfg_attr(not(windows), allow(dead_code))]
fn encode_reg_string(value: &str) -> Vec<u8> {
    value
        .encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Runs a refresh command after every write
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    /// `None` for an empty command line
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl EnvNotifier for CommandNotifier {
    fn notify(&self) -> Result<()> {
        debug!(program = %self.program, args = ?self.args, "refreshing environment");
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| AppManError::Propagation(format!("cannot run {}: {}", self.program, e)))?;
        if !status.success() {
            return Err(AppManError::Propagation(format!("{} exited with {}", self.program, status)));
        }
        Ok(())
    }
}

pub struct NoopNotifier;

impl EnvNotifier for NoopNotifier {
    fn notify(&self) -> Result<()> {
        Ok(())
    }
}

/// Cached, canonical view of the PATH variable.
///
/// Entries are unique and sorted, both case-insensitively. Every mutation is
/// followed by a single store write and a notification.
pub struct PathEnvironment {
    store: Box<dyn PathStore>,
    notifier: Box<dyn EnvNotifier>,
    entries: Vec<String>,
}

impl PathEnvironment {
    pub fn load(store: Box<dyn PathStore>, notifier: Box<dyn EnvNotifier>) -> Result<Self> {
        let mut env = Self {
            store,
            notifier,
            entries: Vec::new(),
        };
        env.reload()?;
        Ok(env)
    }

    /// Re-read the store and rebuild the cache
    pub fn reload(&mut self) -> Result<()> {
        let raw = self.store.read()?;
        self.entries = parse(&raw);
        debug!(entries = self.entries.len(), "PATH loaded");
        Ok(())
    }

    pub fn get(&self) -> Vec<String> {
        self.entries.clone()
    }

    /// Canonical form: entries joined by the separator, one trailing separator
    pub fn serialized(&self) -> String {
        let mut value = self.entries.join(&PATH_SEPARATOR.to_string());
        value.push(PATH_SEPARATOR);
        value
    }

    pub fn contains(&self, path: &str) -> bool {
        self.position(path).is_some()
    }

    /// Add an existing directory; no-op when already present
    pub fn add(&mut self, path: &Path) -> Result<()> {
        let entry = path.to_string_lossy().to_string();
        if self.contains(&entry) {
            debug!(path = %entry, "already on PATH");
            return Ok(());
        }
        if !path.is_dir() {
            return Err(AppManError::fs(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not an existing directory"),
            ));
        }

        let previous = self.entries.clone();
        self.entries.push(entry.clone());
        sort_entries(&mut self.entries);
        self.persist(previous)?;
        info!(path = %entry, "added to PATH");
        Ok(())
    }

    /// Remove an entry; no-op when absent
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        let entry = path.to_string_lossy().to_string();
        let Some(index) = self.position(&entry) else {
            debug!(path = %entry, "not on PATH");
            return Ok(());
        };
        if !path.exists() {
            return Err(AppManError::fs(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "path does not exist"),
            ));
        }

        let previous = self.entries.clone();
        self.entries.remove(index);
        self.persist(previous)?;
        info!(path = %entry, "removed from PATH");
        Ok(())
    }

    /// Drop an entry whose directory may already be gone; no-op when absent
    pub fn purge(&mut self, path: &Path) -> Result<()> {
        let entry = path.to_string_lossy().to_string();
        let Some(index) = self.position(&entry) else {
            debug!(path = %entry, "not on PATH");
            return Ok(());
        };

        let previous = self.entries.clone();
        self.entries.remove(index);
        self.persist(previous)?;
        info!(path = %entry, "purged from PATH");
        Ok(())
    }

    fn position(&self, path: &str) -> Option<usize> {
        let needle = path.to_lowercase();
        self.entries.iter().position(|e| e.to_lowercase() == needle)
    }

    /// Write the cache; a failed write restores `previous`. A failed
    /// notification keeps the write.
    fn persist(&mut self, previous: Vec<String>) -> Result<()> {
        let value = self.serialized();
        if let Err(e) = self.store.write(&value) {
            self.entries = previous;
            return Err(e);
        }
        self.notifier.notify()
    }
}

fn parse(raw: &str) -> Vec<String> {
    let trimmed = raw.strip_suffix(PATH_SEPARATOR).unwrap_or(raw);
    let mut entries: Vec<String> = Vec::new();
    for item in trimmed.split(PATH_SEPARATOR) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let lower = item.to_lowercase();
        if entries.iter().any(|e| e.to_lowercase() == lower) {
            continue;
        }
        entries.push(item.to_string());
    }
    sort_entries(&mut entries);
    entries
}

fn sort_entries(entries: &mut [String]) {
    entries.sort_by_cached_key(|e| e.to_lowercase());
}

use crate::{AppManError, Result};
use crate::core::database::{InstalledProgram, ProgramDatabase};
use crate::core::path_env::PathEnvironment;
use crate::core::profile::{Architecture, Mode, Profile, Release, RunContext};
use crate::core::registry::ProfileRegistry;
use crate::core::resolver::{DependencyResolver, Scope};
use crate::core::shortcut::{NoShortcuts, Shortcut};
use crate::net::client::WebClient;
use crate::net::downloader::Downloader;
use crate::utils::progress::{ProgressSink, ProgressTracker};
use rustc_hash::FxHashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Which profiles a run applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every profile for install, every installed program otherwise
    All,
    Names(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DependencyFailed(String),
    AlreadyInstalled(String),
    NotInstalled,
    UpdatesDisabled,
    UnsupportedArchitecture,
    RequiredBy(Vec<String>),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed(dep) => write!(f, "dependency \"{}\" failed", dep),
            SkipReason::AlreadyInstalled(version) => write!(f, "v{} is already installed", version),
            SkipReason::NotInstalled => write!(f, "not installed"),
            SkipReason::UpdatesDisabled => write!(f, "updates are disabled for this profile"),
            SkipReason::UnsupportedArchitecture => write!(f, "requires a 64-bit machine"),
            SkipReason::RequiredBy(users) => write!(f, "required by {}", users.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    UpToDate(String),
    Installed(String),
    Updated { from: String, to: String },
    Removed,
    Failed(String),
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::UpToDate(version) => write!(f, "up to date (v{})", version),
            Outcome::Installed(version) => write!(f, "installed v{}", version),
            Outcome::Updated { from, to } => write!(f, "updated v{} -> v{}", from, to),
            Outcome::Removed => write!(f, "removed"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
            Outcome::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub name: String,
    pub outcome: Outcome,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: Mode,
    pub profiles: Vec<ProfileReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.profiles.iter().any(|p| p.outcome.is_failure())
    }

    pub fn get(&self, name: &str) -> Option<&ProfileReport> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn failed(&self) -> usize {
        self.profiles.iter().filter(|p| p.outcome.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.profiles
            .iter()
            .filter(|p| matches!(p.outcome, Outcome::Skipped(_)))
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.profiles.len() - self.failed() - self.skipped()
    }
}

/// Lifecycle stages, logged as a profile moves through them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    VersionCheck,
    Downloading,
    Extracting,
    Installing,
    Updating,
    Registering,
    Removing,
    Deregistering,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::VersionCheck => "version check",
            Stage::Downloading => "download",
            Stage::Extracting => "extraction",
            Stage::Installing => "install",
            Stage::Updating => "update",
            Stage::Registering => "registration",
            Stage::Removing => "removal",
            Stage::Deregistering => "deregistration",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Drives profiles through install, update and remove runs.
///
/// Profiles run one at a time in dependency order. A failing profile never
/// stops the batch; profiles depending on it are skipped.
pub struct Orchestrator {
    registry: ProfileRegistry,
    database: ProgramDatabase,
    path_env: PathEnvironment,
    client: WebClient,
    downloader: Downloader,
    shortcuts: Box<dyn Shortcut>,
    progress: Box<dyn ProgressSink>,
    architecture: Architecture,
    temp_root: PathBuf,
    keep_failed_temp: bool,
}

impl Orchestrator {
    pub fn new(
        registry: ProfileRegistry,
        database: ProgramDatabase,
        path_env: PathEnvironment,
        client: WebClient,
        chunk_size: usize,
    ) -> Self {
        let downloader = Downloader::new(client.clone(), chunk_size);
        Self {
            registry,
            database,
            path_env,
            client,
            downloader,
            shortcuts: Box::new(NoShortcuts),
            progress: Box::new(ProgressTracker::new()),
            architecture: Architecture::host(),
            temp_root: std::env::temp_dir(),
            keep_failed_temp: false,
        }
    }

    pub fn with_shortcuts(mut self, shortcuts: Box<dyn Shortcut>) -> Self {
        self.shortcuts = shortcuts;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    pub fn keep_failed_temp(mut self, keep: bool) -> Self {
        self.keep_failed_temp = keep;
        self
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn database(&self) -> &ProgramDatabase {
        &self.database
    }

    pub fn path_env(&self) -> &PathEnvironment {
        &self.path_env
    }

    pub async fn install(&mut self, selection: Selection) -> RunReport {
        self.run(Mode::Install, selection).await
    }

    pub async fn update(&mut self, selection: Selection) -> RunReport {
        self.run(Mode::Update, selection).await
    }

    pub async fn remove(&mut self, selection: Selection) -> RunReport {
        self.run(Mode::Remove, selection).await
    }

    pub async fn run(&mut self, mode: Mode, selection: Selection) -> RunReport {
        let started = Instant::now();
        let mut reports = Vec::new();
        let mut failed: FxHashSet<String> = FxHashSet::default();

        let names = match selection {
            Selection::All if mode == Mode::Install => self.registry.names(),
            Selection::All => self
                .database
                .installed_names()
                .into_iter()
                .filter(|name| self.registry.contains(name))
                .collect(),
            Selection::Names(names) => names,
        };

        let mut targets: Vec<String> = Vec::new();
        for name in &names {
            match self.registry.expand(std::slice::from_ref(name)) {
                Ok(members) => {
                    for member in members {
                        if !targets.contains(&member) {
                            targets.push(member);
                        }
                    }
                }
                Err(e) => {
                    failed.insert(name.clone());
                    reports.push(failure(name, &e, Duration::ZERO));
                }
            }
        }

        let scope = match mode {
            Mode::Install => Scope::WithDependencies,
            Mode::Update | Mode::Remove => Scope::TargetsOnly,
        };
        let plan = DependencyResolver::new(&self.registry).plan(&targets, scope);
        for (name, e) in plan.rejected {
            failed.insert(name.clone());
            reports.push(failure(&name, &e, Duration::ZERO));
        }

        let mut order = plan.order;
        if mode == Mode::Remove {
            order.reverse();
        }
        info!(%mode, ?order, "starting run");

        for name in order {
            let Some(profile) = self.registry.get(&name) else {
                continue;
            };
            let profile_started = Instant::now();

            let (outcome, warnings) = match self.blocking_dependency(mode, profile.as_ref(), &failed) {
                Some(dep) => (Outcome::Skipped(SkipReason::DependencyFailed(dep)), Vec::new()),
                None => self.run_profile(mode, profile).await,
            };

            if outcome.is_failure() || matches!(outcome, Outcome::Skipped(SkipReason::DependencyFailed(_))) {
                failed.insert(name.clone());
            }
            let elapsed = profile_started.elapsed();
            info!(profile = %name, %outcome, ?elapsed, "profile finished");
            reports.push(ProfileReport {
                name,
                outcome,
                warnings,
                elapsed,
            });
        }

        RunReport {
            mode,
            profiles: reports,
            elapsed: started.elapsed(),
        }
    }

    /// First dependency that keeps `profile` from running, if any
    fn blocking_dependency(&self, mode: Mode, profile: &dyn Profile, failed: &FxHashSet<String>) -> Option<String> {
        if mode == Mode::Remove {
            return None;
        }
        profile
            .spec()
            .dependencies()
            .iter()
            .find(|dep| {
                failed.contains(*dep) || (mode == Mode::Install && !self.database.is_installed(dep))
            })
            .cloned()
    }

    async fn run_profile(&mut self, mode: Mode, profile: Arc<dyn Profile>) -> (Outcome, Vec<String>) {
        let spec = profile.spec();
        let name = spec.name().to_string();
        let installed = self.database.get(&name).cloned();

        let skip = match (mode, &installed) {
            (Mode::Install, Some(record)) => Some(SkipReason::AlreadyInstalled(record.version.clone())),
            (Mode::Update | Mode::Remove, None) => Some(SkipReason::NotInstalled),
            (Mode::Update, Some(_)) if !spec.is_updatable() => Some(SkipReason::UpdatesDisabled),
            (Mode::Remove, Some(_)) => {
                let users = self.database.dependents(&name);
                (!users.is_empty()).then_some(SkipReason::RequiredBy(users))
            }
            _ => None,
        };
        let skip = skip.or_else(|| {
            (mode != Mode::Remove && spec.is_x64_only() && !self.architecture.is_64bit())
                .then_some(SkipReason::UnsupportedArchitecture)
        });
        if let Some(reason) = skip {
            debug!(profile = %name, %reason, "skipped");
            return (Outcome::Skipped(reason), Vec::new());
        }

        let install_path = installed
            .as_ref()
            .map(|record| record.path.clone())
            .unwrap_or_else(|| spec.default_install_path().to_path_buf());

        let temp = match tempfile::Builder::new()
            .prefix(&format!("appman-{}-", name))
            .tempdir_in(&self.temp_root)
        {
            Ok(temp) => temp,
            Err(e) => {
                let e = AppManError::fs(&self.temp_root, e);
                return (Outcome::Failed(e.to_string()), Vec::new());
            }
        };

        let ctx = RunContext {
            mode,
            architecture: self.architecture,
            install_path,
            temp_dir: temp.path().to_path_buf(),
            installed_version: installed.as_ref().map(|record| record.version.clone()),
            client: self.client.clone(),
        };

        let mut stage = Stage::Idle;
        let mut warnings = Vec::new();
        let result = match (mode, installed) {
            (Mode::Remove, Some(record)) => {
                self.teardown(profile.as_ref(), &ctx, record, &mut stage, &mut warnings).await
            }
            _ => self.deploy(profile.as_ref(), &ctx, &mut stage, &mut warnings).await,
        };

        match result {
            Ok(outcome) => {
                debug!(profile = %name, stage = %Stage::Done);
                (outcome, warnings)
            }
            Err(e) => {
                warn!(profile = %name, %stage, error = %e, "profile failed");
                self.dispose_failed_temp(temp);
                (Outcome::Failed(format!("{} failed: {}", stage, e)), warnings)
            }
        }
    }

    fn dispose_failed_temp(&self, temp: TempDir) {
        if self.keep_failed_temp {
            let kept = temp.keep();
            warn!(path = %kept.display(), "keeping temp directory of failed run");
        }
    }

    async fn deploy(
        &mut self,
        profile: &dyn Profile,
        ctx: &RunContext,
        stage: &mut Stage,
        warnings: &mut Vec<String>,
    ) -> Result<Outcome> {
        let name = profile.name().to_string();

        enter(&name, stage, Stage::VersionCheck);
        let version = profile.latest_version(ctx).await?.trim().to_string();
        if version.is_empty() {
            return Err(AppManError::Hook {
                profile: name,
                stage: "version check",
                reason: "empty version".to_string(),
            });
        }
        if ctx.mode == Mode::Update && ctx.installed_version.as_deref() == Some(version.as_str()) {
            return Ok(Outcome::UpToDate(version));
        }

        enter(&name, stage, Stage::Downloading);
        let downloads = profile.download_requests(ctx, &version)?;
        if downloads.is_empty() {
            return Err(AppManError::Config(format!("{} returned an empty download plan", name)));
        }
        self.downloader
            .fetch_all(&downloads, self.progress.as_mut())
            .await?;
        let release = Release { version, downloads };

        enter(&name, stage, Stage::Extracting);
        profile.extract(ctx, &release).await?;

        if ctx.mode == Mode::Install {
            enter(&name, stage, Stage::Installing);
            profile.install(ctx, &release).await?;
        } else {
            enter(&name, stage, Stage::Updating);
            profile.update(ctx, &release).await?;
        }

        enter(&name, stage, Stage::Registering);
        let executables = profile.executable_dirs(ctx)?;
        validate_executables(&executables)?;
        self.register_all(&executables, warnings)?;
        if let Some(shortcut) = profile.spec().shortcut_spec() {
            let target = ctx.install_path.join(&shortcut.executable);
            if let Err(e) = self.shortcuts.create_shortcut(&target, &shortcut.display_name) {
                warnings.push(e.to_string());
            }
        }

        let outcome = if ctx.mode == Mode::Install {
            let record = InstalledProgram::new(&release.version, &ctx.install_path, executables);
            self.database
                .record_install(&name, record, profile.spec().dependencies());
            Outcome::Installed(release.version.clone())
        } else {
            let stale: Vec<PathBuf> = self
                .database
                .get(&name)
                .map(|record| {
                    record
                        .executables
                        .iter()
                        .filter(|dir| !executables.contains(dir))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for dir in &stale {
                if let Err(e) = self.deregister(dir, warnings) {
                    warnings.push(e.to_string());
                }
            }
            self.database
                .record_update(&name, &release.version, executables)?;
            Outcome::Updated {
                from: ctx.installed_version.clone().unwrap_or_default(),
                to: release.version.clone(),
            }
        };
        self.database.save().await?;
        Ok(outcome)
    }

    async fn teardown(
        &mut self,
        profile: &dyn Profile,
        ctx: &RunContext,
        record: InstalledProgram,
        stage: &mut Stage,
        warnings: &mut Vec<String>,
    ) -> Result<Outcome> {
        let name = profile.name().to_string();

        enter(&name, stage, Stage::Removing);
        let hook = profile.remove(ctx).await;
        if let Err(e) = &hook {
            warn!(profile = %name, error = %e, "remove hook failed, cleaning up anyway");
        }

        enter(&name, stage, Stage::Deregistering);
        let mut leftover = None;
        for dir in &record.executables {
            if let Err(e) = self.deregister(dir, warnings) {
                warn!(profile = %name, dir = %dir.display(), error = %e, "cannot deregister");
                warnings.push(e.to_string());
                if leftover.is_none() {
                    leftover = Some(e);
                }
            }
        }
        if let Some(shortcut) = profile.spec().shortcut_spec() {
            if let Err(e) = self.shortcuts.remove_shortcut(&shortcut.display_name) {
                warnings.push(e.to_string());
            }
        }
        if profile.spec().is_portable() && tokio::fs::try_exists(&record.path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&record.path)
                .await
                .map_err(|e| AppManError::fs(&record.path, e))?;
            debug!(profile = %name, path = %record.path.display(), "install directory deleted");
        }

        if hook.is_err() {
            *stage = Stage::Removing;
            hook?;
        }
        if let Some(e) = leftover {
            *stage = Stage::Deregistering;
            return Err(e);
        }

        self.database.forget(&name);
        self.database.save().await?;
        Ok(Outcome::Removed)
    }

    /// Put every dir on PATH. When one fails, the dirs this call added are
    /// taken off again so PATH holds nothing the database does not record.
    fn register_all(&mut self, dirs: &[PathBuf], warnings: &mut Vec<String>) -> Result<()> {
        let mut added: Vec<PathBuf> = Vec::new();
        for dir in dirs {
            let fresh = !self.path_env.contains(&dir.to_string_lossy());
            if let Err(e) = self.register(dir, warnings) {
                for done in added.iter().rev() {
                    if let Err(undo) = self.path_env.purge(done) {
                        warnings.push(undo.to_string());
                    }
                }
                return Err(e);
            }
            if fresh {
                added.push(dir.clone());
            }
        }
        Ok(())
    }

    fn register(&mut self, dir: &Path, warnings: &mut Vec<String>) -> Result<()> {
        match self.path_env.add(dir) {
            Err(AppManError::Propagation(reason)) => {
                warnings.push(AppManError::Propagation(reason).to_string());
                Ok(())
            }
            other => other,
        }
    }

    /// Take `dir` off PATH; an entry whose directory is gone is purged
    fn deregister(&mut self, dir: &Path, warnings: &mut Vec<String>) -> Result<()> {
        let removed = if dir.exists() {
            self.path_env.remove(dir)
        } else {
            self.path_env.purge(dir)
        };
        match removed {
            Err(AppManError::Propagation(reason)) => {
                warnings.push(AppManError::Propagation(reason).to_string());
                Ok(())
            }
            other => other,
        }
    }
}

fn enter(profile: &str, stage: &mut Stage, next: Stage) {
    debug!(profile, from = %stage, to = %next, "stage");
    *stage = next;
}

fn validate_executables(dirs: &[PathBuf]) -> Result<()> {
    for dir in dirs {
        if !dir.is_absolute() {
            return Err(AppManError::invalid(
                "executables",
                format!("{} is not an absolute path", dir.display()),
            ));
        }
        if dir.is_file() {
            return Err(AppManError::invalid(
                "executables",
                format!("{} is a file, not a directory", dir.display()),
            ));
        }
    }
    Ok(())
}

fn failure(name: &str, error: &AppManError, elapsed: Duration) -> ProfileReport {
    ProfileReport {
        name: name.to_lowercase(),
        outcome: Outcome::Failed(error.to_string()),
        warnings: Vec::new(),
        elapsed,
    }
}

use appman::core::config::NetworkConfig;
use appman::core::path_env::{EnvNotifier, FileStore, NoopNotifier};
use appman::utils::fs::TreeMerger;
use appman::{
    AppManError, Architecture, ArchiveExtractor, DownloadRequest, Orchestrator, Outcome, PathEnvironment,
    Profile, ProfileRegistry, ProfileSpec, ProgramDatabase, ProgressTracker, Release, Result, RunContext,
    Selection, SkipReason, WebClient,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

type Routes = HashMap<String, (u16, Vec<u8>)>;

/// Minimal HTTP/1.1 responder serving fixed bodies per path
async fn serve(routes: Routes) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let head = String::from_utf8_lossy(&request);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = routes
                    .get(&path)
                    .cloned()
                    .unwrap_or((404, b"not found".to_vec()));
                let reason = if status == 200 { "OK" } else { "Not Found" };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    reason,
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, contents) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

#[derive(Default)]
struct Calls {
    versions: AtomicUsize,
    downloads: AtomicUsize,
    installs: AtomicUsize,
    updates: AtomicUsize,
    removes: AtomicUsize,
}

impl Calls {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// In-memory profile serving a zip from the local responder
struct MockProfile {
    spec: ProfileSpec,
    version: Mutex<String>,
    urls: Vec<(String, bool)>,
    dirs: Mutex<Vec<&'static str>>,
    remove_error: Mutex<Option<String>>,
    calls: Calls,
}

impl MockProfile {
    fn new(spec: ProfileSpec, version: &str, url: String) -> Arc<Self> {
        Arc::new(Self {
            spec,
            version: Mutex::new(version.to_string()),
            urls: vec![(url, false)],
            dirs: Mutex::new(vec!["bin"]),
            remove_error: Mutex::new(None),
            calls: Calls::default(),
        })
    }

    fn with_optional(spec: ProfileSpec, version: &str, url: String, optional: String) -> Arc<Self> {
        Arc::new(Self {
            spec,
            version: Mutex::new(version.to_string()),
            urls: vec![(url, false), (optional, true)],
            dirs: Mutex::new(vec!["bin"]),
            remove_error: Mutex::new(None),
            calls: Calls::default(),
        })
    }

    fn set_version(&self, version: &str) {
        *self.version.lock().unwrap() = version.to_string();
    }

    /// Executable dirs, relative to the install path
    fn set_dirs(&self, dirs: &[&'static str]) {
        *self.dirs.lock().unwrap() = dirs.to_vec();
    }

    fn fail_remove(&self, reason: Option<&str>) {
        *self.remove_error.lock().unwrap() = reason.map(str::to_string);
    }
}

#[async_trait]
impl Profile for MockProfile {
    fn spec(&self) -> &ProfileSpec {
        &self.spec
    }

    async fn latest_version(&self, _ctx: &RunContext) -> Result<String> {
        self.calls.versions.fetch_add(1, Ordering::SeqCst);
        Ok(self.version.lock().unwrap().clone())
    }

    fn download_requests(&self, ctx: &RunContext, _version: &str) -> Result<Vec<DownloadRequest>> {
        self.calls.downloads.fetch_add(1, Ordering::SeqCst);
        self.urls
            .iter()
            .enumerate()
            .map(|(i, (url, optional))| {
                DownloadRequest::builder("GET", ctx.temp_dir.join(format!("asset-{}.zip", i)), url)
                    .can_fail(*optional)
                    .build()
            })
            .collect()
    }

    async fn extract(&self, ctx: &RunContext, release: &Release) -> Result<()> {
        let archive = release.downloads[0].path();
        ArchiveExtractor::new()
            .with_merger(TreeMerger::new())
            .extract(archive, &ctx.temp_dir, &ctx.install_path)
    }

    async fn install(&self, _ctx: &RunContext, _release: &Release) -> Result<()> {
        self.calls.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, _ctx: &RunContext, _release: &Release) -> Result<()> {
        self.calls.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn executable_dirs(&self, ctx: &RunContext) -> Result<Vec<PathBuf>> {
        Ok(self
            .dirs
            .lock()
            .unwrap()
            .iter()
            .map(|dir| ctx.install_path.join(dir))
            .collect())
    }

    async fn remove(&self, _ctx: &RunContext) -> Result<()> {
        self.calls.removes.fetch_add(1, Ordering::SeqCst);
        match self.remove_error.lock().unwrap().clone() {
            Some(reason) => Err(AppManError::Hook {
                profile: self.spec.name().to_string(),
                stage: "remove",
                reason,
            }),
            None => Ok(()),
        }
    }
}

fn dynamic<P: Profile + 'static>(profile: &Arc<P>) -> Arc<dyn Profile> {
    profile.clone()
}

fn spec(root: &Path, name: &str, deps: &[&str]) -> ProfileSpec {
    deps.iter()
        .fold(ProfileSpec::new(name, root.join("programs").join(name)), |spec, dep| {
            spec.depends_on(dep)
        })
}

async fn orchestrator(root: &Path, profiles: Vec<Arc<dyn Profile>>) -> Orchestrator {
    orchestrator_notifying(root, profiles, Box::new(NoopNotifier)).await
}

async fn orchestrator_notifying(
    root: &Path,
    profiles: Vec<Arc<dyn Profile>>,
    notifier: Box<dyn EnvNotifier>,
) -> Orchestrator {
    let mut registry = ProfileRegistry::new();
    for profile in profiles {
        registry.register(profile).unwrap();
    }
    let database = ProgramDatabase::load(&root.join("data.json")).await.unwrap();
    let path_env = PathEnvironment::load(
        Box::new(FileStore::new(root.join("path.txt"))),
        notifier,
    )
    .unwrap();
    let client = WebClient::new(&NetworkConfig::default()).unwrap();
    std::fs::create_dir_all(root.join("tmp")).unwrap();

    Orchestrator::new(registry, database, path_env, client, 1024)
        .with_progress(Box::new(ProgressTracker::hidden()))
        .architecture(Architecture::X64)
        .temp_root(root.join("tmp"))
}

async fn fixture() -> (TempDir, String) {
    let mut routes = Routes::new();
    routes.insert(
        "/tool.zip".to_string(),
        (200, zip_bytes(&[("bin/tool.exe", "MZ tool"), ("readme.txt", "hello")])),
    );
    routes.insert("/lib.zip".to_string(), (200, zip_bytes(&[("bin/lib.dll", "MZ lib")])));
    (tempdir().unwrap(), serve(routes).await)
}

fn names(list: &[&str]) -> Selection {
    Selection::Names(list.iter().map(|s| s.to_string()).collect())
}

#[tokio::test]
async fn test_full_lifecycle() {
    let (root, base) = fixture().await;
    let tool = MockProfile::new(spec(root.path(), "tool", &[]), "1.0", format!("{}/tool.zip", base));
    let mut orch = orchestrator(root.path(), vec![dynamic(&tool)]).await;
    let install_path = root.path().join("programs/tool");
    let bin = install_path.join("bin");

    let report = orch.install(names(&["tool"])).await;
    assert!(!report.has_failures(), "{:?}", report);
    assert_eq!(report.profiles[0].outcome, Outcome::Installed("1.0".to_string()));
    assert!(bin.join("tool.exe").is_file());
    assert!(orch.path_env().contains(&bin.to_string_lossy()));
    assert_eq!(orch.database().installed_version("tool"), Some("1.0"));
    assert_eq!(Calls::get(&tool.calls.installs), 1);

    // Unchanged version: nothing but the version check runs
    let report = orch.update(Selection::All).await;
    assert_eq!(report.profiles[0].outcome, Outcome::UpToDate("1.0".to_string()));
    assert_eq!(Calls::get(&tool.calls.versions), 2);
    assert_eq!(Calls::get(&tool.calls.downloads), 1);
    assert_eq!(Calls::get(&tool.calls.updates), 0);

    tool.set_version("1.1");
    let report = orch.update(names(&["tool"])).await;
    assert_eq!(
        report.profiles[0].outcome,
        Outcome::Updated {
            from: "1.0".to_string(),
            to: "1.1".to_string()
        }
    );
    assert_eq!(Calls::get(&tool.calls.updates), 1);
    assert_eq!(orch.database().installed_version("tool"), Some("1.1"));

    let report = orch.remove(names(&["tool"])).await;
    assert_eq!(report.profiles[0].outcome, Outcome::Removed);
    assert_eq!(Calls::get(&tool.calls.removes), 1);
    assert!(!install_path.exists());
    assert!(!orch.path_env().contains(&bin.to_string_lossy()));
    assert!(orch.database().installed_names().is_empty());

    let saved = std::fs::read_to_string(root.path().join("path.txt")).unwrap();
    assert!(!saved.contains("tool"));
}

#[tokio::test]
async fn test_temp_dirs_are_cleaned_up() {
    let (root, base) = fixture().await;
    let tool = MockProfile::new(spec(root.path(), "tool", &[]), "1.0", format!("{}/tool.zip", base));
    let broken = MockProfile::new(spec(root.path(), "broken", &[]), "1.0", format!("{}/missing.zip", base));
    let mut orch = orchestrator(root.path(), vec![dynamic(&tool), dynamic(&broken)]).await;

    orch.install(names(&["tool", "broken"])).await;
    assert_eq!(std::fs::read_dir(root.path().join("tmp")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_keep_failed_temp() {
    let (root, base) = fixture().await;
    let broken = MockProfile::new(spec(root.path(), "broken", &[]), "1.0", format!("{}/missing.zip", base));
    let mut orch = orchestrator(root.path(), vec![dynamic(&broken)]).await.keep_failed_temp(true);

    let report = orch.install(names(&["broken"])).await;
    assert!(report.has_failures());
    assert_eq!(std::fs::read_dir(root.path().join("tmp")).unwrap().count(), 1);
}

#[tokio::test]
async fn test_download_failure_names_url_and_skips_dependents() {
    let (root, base) = fixture().await;
    let missing = format!("{}/missing.zip", base);
    let lib = MockProfile::new(spec(root.path(), "lib", &[]), "2.0", missing.clone());
    let app = MockProfile::new(spec(root.path(), "app", &["lib"]), "1.0", format!("{}/tool.zip", base));
    let other = MockProfile::new(spec(root.path(), "other", &[]), "1.0", format!("{}/tool.zip", base));
    let mut orch = orchestrator(root.path(), vec![dynamic(&lib), dynamic(&app), dynamic(&other)]).await;

    let report = orch.install(names(&["app", "other"])).await;

    let order: Vec<&str> = report.profiles.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(order, vec!["lib", "app", "other"]);

    match &report.get("lib").unwrap().outcome {
        Outcome::Failed(reason) => assert!(reason.contains(&missing), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(
        report.get("app").unwrap().outcome,
        Outcome::Skipped(SkipReason::DependencyFailed("lib".to_string()))
    );
    assert_eq!(report.get("other").unwrap().outcome, Outcome::Installed("1.0".to_string()));
    assert_eq!(Calls::get(&app.calls.versions), 0);
    assert!(report.has_failures());
}

#[tokio::test]
async fn test_optional_download_may_fail() {
    let (root, base) = fixture().await;
    let tool = MockProfile::with_optional(
        spec(root.path(), "tool", &[]),
        "1.0",
        format!("{}/tool.zip", base),
        format!("{}/extras.zip", base),
    );
    let mut orch = orchestrator(root.path(), vec![dynamic(&tool)]).await;

    let report = orch.install(names(&["tool"])).await;
    assert_eq!(report.profiles[0].outcome, Outcome::Installed("1.0".to_string()));
}

#[tokio::test]
async fn test_dependencies_installed_first_and_protected() {
    let (root, base) = fixture().await;
    let lib = MockProfile::new(spec(root.path(), "lib", &[]), "2.0", format!("{}/lib.zip", base));
    let app = MockProfile::new(spec(root.path(), "app", &["lib"]), "1.0", format!("{}/tool.zip", base));
    let mut orch = orchestrator(root.path(), vec![dynamic(&app), dynamic(&lib)]).await;

    let report = orch.install(names(&["app"])).await;
    let order: Vec<&str> = report.profiles.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(order, vec!["lib", "app"]);
    assert!(!report.has_failures());

    let report = orch.install(names(&["lib"])).await;
    assert_eq!(
        report.profiles[0].outcome,
        Outcome::Skipped(SkipReason::AlreadyInstalled("2.0".to_string()))
    );

    let report = orch.remove(names(&["lib"])).await;
    assert_eq!(
        report.profiles[0].outcome,
        Outcome::Skipped(SkipReason::RequiredBy(vec!["app".to_string()]))
    );

    // Dependents go first when both are removed
    let report = orch.remove(names(&["lib", "app"])).await;
    let order: Vec<&str> = report.profiles.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(order, vec!["app", "lib"]);
    assert!(report.profiles.iter().all(|p| p.outcome == Outcome::Removed));
}

#[tokio::test]
async fn test_cycle_fails_only_affected_targets() {
    let (root, base) = fixture().await;
    let url = format!("{}/tool.zip", base);
    let a = MockProfile::new(spec(root.path(), "a", &["b"]), "1.0", url.clone());
    let b = MockProfile::new(spec(root.path(), "b", &["a"]), "1.0", url.clone());
    let c = MockProfile::new(spec(root.path(), "c", &[]), "1.0", url);
    let mut orch = orchestrator(root.path(), vec![dynamic(&a), dynamic(&b), dynamic(&c)]).await;

    let report = orch.install(names(&["a", "c"])).await;
    match &report.get("a").unwrap().outcome {
        Outcome::Failed(reason) => assert!(reason.contains("cycle"), "{}", reason),
        other => panic!("expected cycle failure, got {:?}", other),
    }
    assert_eq!(report.get("c").unwrap().outcome, Outcome::Installed("1.0".to_string()));
}

#[tokio::test]
async fn test_preconditions() {
    let (root, base) = fixture().await;
    let url = format!("{}/tool.zip", base);
    let wide = MockProfile::new(spec(root.path(), "wide", &[]).x64_only(true), "1.0", url.clone());
    let frozen = MockProfile::new(spec(root.path(), "frozen", &[]).can_update(false), "1.0", url);
    let mut orch = orchestrator(root.path(), vec![dynamic(&wide), dynamic(&frozen)])
        .await
        .architecture(Architecture::X86);

    let report = orch.install(names(&["wide", "frozen"])).await;
    assert_eq!(
        report.get("wide").unwrap().outcome,
        Outcome::Skipped(SkipReason::UnsupportedArchitecture)
    );
    assert_eq!(report.get("frozen").unwrap().outcome, Outcome::Installed("1.0".to_string()));

    let report = orch.update(names(&["frozen", "wide"])).await;
    assert_eq!(
        report.get("frozen").unwrap().outcome,
        Outcome::Skipped(SkipReason::UpdatesDisabled)
    );
    assert_eq!(report.get("wide").unwrap().outcome, Outcome::Skipped(SkipReason::NotInstalled));

    let report = orch.install(names(&["ghost"])).await;
    assert!(report.has_failures());
    assert!(matches!(&report.profiles[0].outcome, Outcome::Failed(r) if r.contains("ghost")));
}

#[tokio::test]
async fn test_relative_executable_dir_is_rejected() {
    struct Relative(Arc<MockProfile>);

    #[async_trait]
    impl Profile for Relative {
        fn spec(&self) -> &ProfileSpec {
            self.0.spec()
        }

        async fn latest_version(&self, ctx: &RunContext) -> Result<String> {
            self.0.latest_version(ctx).await
        }

        fn download_requests(&self, ctx: &RunContext, version: &str) -> Result<Vec<DownloadRequest>> {
            self.0.download_requests(ctx, version)
        }

        fn executable_dirs(&self, _ctx: &RunContext) -> Result<Vec<PathBuf>> {
            Ok(vec![PathBuf::from("bin")])
        }
    }

    let (root, base) = fixture().await;
    let inner = MockProfile::new(spec(root.path(), "rel", &[]), "1.0", format!("{}/tool.zip", base));
    let mut orch = orchestrator(root.path(), vec![dynamic(&Arc::new(Relative(inner)))]).await;

    let report = orch.install(names(&["rel"])).await;
    match &report.profiles[0].outcome {
        Outcome::Failed(reason) => assert!(reason.contains("executables"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(orch.database().installed_names().is_empty());
}

#[tokio::test]
async fn test_remove_survives_deleted_executable_dir() {
    let (root, base) = fixture().await;
    let tool = MockProfile::new(spec(root.path(), "tool", &[]), "1.0", format!("{}/tool.zip", base));
    let mut orch = orchestrator(root.path(), vec![dynamic(&tool)]).await;
    let install_path = root.path().join("programs/tool");
    let bin = install_path.join("bin");

    orch.install(names(&["tool"])).await;
    std::fs::remove_dir_all(&bin).unwrap();

    let report = orch.remove(names(&["tool"])).await;
    assert_eq!(report.profiles[0].outcome, Outcome::Removed, "{:?}", report);
    assert!(!install_path.exists());
    assert!(!orch.path_env().contains(&bin.to_string_lossy()));
    assert!(orch.database().installed_names().is_empty());

    let saved = std::fs::read_to_string(root.path().join("path.txt")).unwrap();
    assert!(!saved.contains("tool"));
}

#[tokio::test]
async fn test_failing_remove_hook_still_cleans_up() {
    let (root, base) = fixture().await;
    let tool = MockProfile::new(spec(root.path(), "tool", &[]), "1.0", format!("{}/tool.zip", base));
    let mut orch = orchestrator(root.path(), vec![dynamic(&tool)]).await;
    let install_path = root.path().join("programs/tool");
    let bin = install_path.join("bin");

    orch.install(names(&["tool"])).await;
    tool.fail_remove(Some("uninstaller crashed"));

    let report = orch.remove(names(&["tool"])).await;
    match &report.profiles[0].outcome {
        Outcome::Failed(reason) => assert!(reason.contains("uninstaller crashed"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!install_path.exists());
    assert!(!orch.path_env().contains(&bin.to_string_lossy()));
    assert_eq!(orch.database().installed_names(), vec!["tool"]);

    // The kept record lets a later run finish the job
    tool.fail_remove(None);
    let report = orch.remove(names(&["tool"])).await;
    assert_eq!(report.profiles[0].outcome, Outcome::Removed);
    assert!(orch.database().installed_names().is_empty());
}

#[tokio::test]
async fn test_failed_registration_leaves_path_untouched() {
    let (root, base) = fixture().await;
    let tool = MockProfile::new(spec(root.path(), "tool", &[]), "1.0", format!("{}/tool.zip", base));
    tool.set_dirs(&["bin", "missing"]);
    let mut orch = orchestrator(root.path(), vec![dynamic(&tool)]).await;
    let bin = root.path().join("programs/tool/bin");

    let report = orch.install(names(&["tool"])).await;
    match &report.profiles[0].outcome {
        Outcome::Failed(reason) => assert!(reason.contains("missing"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(bin.is_dir());
    assert!(!orch.path_env().contains(&bin.to_string_lossy()));
    assert!(orch.path_env().get().is_empty());
    assert!(orch.database().installed_names().is_empty());
}

#[tokio::test]
async fn test_propagation_failure_is_a_warning() {
    struct Refusing;

    impl EnvNotifier for Refusing {
        fn notify(&self) -> Result<()> {
            Err(AppManError::Propagation("broadcast refused".to_string()))
        }
    }

    let (root, base) = fixture().await;
    let tool = MockProfile::new(spec(root.path(), "tool", &[]), "1.0", format!("{}/tool.zip", base));
    let mut orch = orchestrator_notifying(root.path(), vec![dynamic(&tool)], Box::new(Refusing)).await;
    let bin = root.path().join("programs/tool/bin");

    let report = orch.install(names(&["tool"])).await;
    assert!(!report.has_failures(), "{:?}", report);
    assert_eq!(report.profiles[0].outcome, Outcome::Installed("1.0".to_string()));
    assert!(report.profiles[0].warnings.iter().any(|w| w.contains("broadcast refused")));

    let saved = std::fs::read_to_string(root.path().join("path.txt")).unwrap();
    assert!(saved.contains(&*bin.to_string_lossy()));
}

#[test]
fn test_errors_are_classified() {
    assert!(AppManError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]).is_configuration());
    assert!(!AppManError::Transfer {
        url: "http://x".into(),
        reason: "404".into()
    }
    .is_configuration());
}

use crate::{AppManError, Result};
use crate::core::profile::{Profile, ProfileSpec, Release, RunContext, ShortcutSpec};
use crate::net::request::DownloadRequest;
use crate::utils::archive::ArchiveExtractor;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    name: String,
    install_path: PathBuf,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default = "default_true")]
    portable: bool,
    #[serde(default = "default_true")]
    can_update: bool,
    #[serde(default)]
    x64_only: bool,
    #[serde(default)]
    shortcut: Option<ShortcutSpec>,
    version: VersionSection,
    download: DownloadSection,
    #[serde(default)]
    install: InstallSection,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VersionSection {
    url: String,
    #[serde(default)]
    pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadSection {
    url: String,
    #[serde(default)]
    url_x64: Option<String>,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    query: Option<toml::Value>,
    #[serde(default)]
    body: Option<toml::Value>,
}

fn default_method() -> String {
    "get".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum InstallKind {
    #[default]
    Archive,
    File,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallSection {
    #[serde(default)]
    kind: InstallKind,
    #[serde(default)]
    strip_single_root: bool,
    #[serde(default)]
    executables: Vec<PathBuf>,
}

/// Profile described by a TOML file.
///
/// The latest version is read from a page with a regular expression, the
/// download URL is a template over `{version}`, `{version_nodots}` and
/// `{arch}`.
#[derive(Debug)]
pub struct ManifestProfile {
    spec: ProfileSpec,
    version_url: String,
    pattern: Option<Regex>,
    download: DownloadSection,
    query: Option<serde_json::Value>,
    body: Option<serde_json::Value>,
    install: InstallSection,
}

impl ManifestProfile {
    pub fn from_toml(source: &str) -> Result<Self> {
        let manifest: ManifestFile = toml::from_str(source)
            .map_err(|e| AppManError::Config(format!("Invalid profile manifest: {}", e)))?;

        let mut spec = ProfileSpec::new(&manifest.name, manifest.install_path)
            .portable(manifest.portable)
            .can_update(manifest.can_update)
            .x64_only(manifest.x64_only);
        for dep in &manifest.dependencies {
            spec = spec.depends_on(dep);
        }
        if let Some(shortcut) = manifest.shortcut {
            spec = spec.shortcut(shortcut);
        }
        if spec.name().is_empty() {
            return Err(AppManError::Config("Profile manifest with an empty name".to_string()));
        }

        let pattern = manifest
            .version
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| AppManError::Config(format!("{}: invalid version pattern: {}", spec.name(), e)))?;

        let query = manifest.download.query.as_ref().map(to_json).transpose()?;
        let body = manifest.download.body.as_ref().map(to_json).transpose()?;

        Ok(Self {
            spec,
            version_url: manifest.version.url,
            pattern,
            download: manifest.download,
            query,
            body,
            install: manifest.install,
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppManError::fs(path, e))?;
        Self::from_toml(&source).map_err(|e| match e {
            AppManError::Config(reason) => AppManError::Config(format!("{}: {}", path.display(), reason)),
            other => other,
        })
    }

    /// Pick the version out of a fetched page
    fn parse_version(&self, page: &str) -> Result<String> {
        let version = match &self.pattern {
            Some(pattern) => {
                let captures = pattern.captures(page).ok_or_else(|| AppManError::Hook {
                    profile: self.spec.name().to_string(),
                    stage: "version check",
                    reason: format!("pattern `{}` did not match {}", pattern.as_str(), self.version_url),
                })?;
                captures
                    .get(1)
                    .or_else(|| captures.get(0))
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default()
            }
            None => page.trim().to_string(),
        };
        Ok(version)
    }

    fn file_name(&self, url: &str) -> String {
        if let Some(file) = &self.download.file {
            return file.clone();
        }
        url.split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.download", self.spec.name()))
    }
}

fn to_json(value: &toml::Value) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| AppManError::Config(format!("Cannot convert manifest table: {}", e)))
}

fn expand(template: &str, version: &str, arch: &str) -> String {
    template
        .replace("{version_nodots}", &version.replace('.', ""))
        .replace("{version}", version)
        .replace("{arch}", arch)
}

#[async_trait]
impl Profile for ManifestProfile {
    fn spec(&self) -> &ProfileSpec {
        &self.spec
    }

    async fn latest_version(&self, ctx: &RunContext) -> Result<String> {
        let page = ctx.client.get_text(&self.version_url).await?;
        let version = self.parse_version(&page)?;
        debug!(profile = %self.spec.name(), %version, "latest version");
        Ok(version)
    }

    fn download_requests(&self, ctx: &RunContext, version: &str) -> Result<Vec<DownloadRequest>> {
        let template = match (&self.download.url_x64, ctx.architecture.is_64bit()) {
            (Some(url_x64), true) => url_x64,
            _ => &self.download.url,
        };
        let url = expand(template, version, ctx.architecture.as_str());
        let path = ctx.temp_dir.join(expand(&self.file_name(&url), version, ctx.architecture.as_str()));

        let mut builder = DownloadRequest::builder(&self.download.method, path, &url);
        if let Some(query) = &self.query {
            builder = builder.query_value(query);
        }
        if let Some(body) = &self.body {
            builder = builder.body_value(body);
        }
        Ok(vec![builder.build()?])
    }

    async fn extract(&self, ctx: &RunContext, release: &Release) -> Result<()> {
        if self.install.kind != InstallKind::Archive {
            return Ok(());
        }
        let extractor = ArchiveExtractor::new().strip_single_root(self.install.strip_single_root);
        for archive in release.downloaded_files() {
            extractor.extract(archive, &ctx.temp_dir, &ctx.install_path)?;
        }
        Ok(())
    }

    async fn update(&self, ctx: &RunContext, release: &Release) -> Result<()> {
        if self.install.kind != InstallKind::File {
            return Ok(());
        }
        tokio::fs::create_dir_all(&ctx.install_path)
            .await
            .map_err(|e| AppManError::fs(&ctx.install_path, e))?;
        for file in release.downloaded_files() {
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = ctx.install_path.join(name);
            tokio::fs::copy(file, &target)
                .await
                .map_err(|e| AppManError::fs(&target, e))?;
        }
        Ok(())
    }

    fn executable_dirs(&self, ctx: &RunContext) -> Result<Vec<PathBuf>> {
        Ok(self
            .install
            .executables
            .iter()
            .map(|rel| {
                if rel.as_os_str() == "." {
                    ctx.install_path.clone()
                } else {
                    ctx.install_path.join(rel)
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::NetworkConfig;
    use crate::core::profile::{Architecture, Mode};
    use crate::net::client::WebClient;
    use crate::net::request::Method;

    const INNOUNP: &str = r#"
name = "InnoUnp"
install_path = "/opt/portable/innounp"
dependencies = ["7zip"]

[version]
url = "https://sourceforge.net/p/innounp/news/"
pattern = 'Inno Setup Unpacker ([0-9.]+)'

[download]
url = "https://downloads.example.org/innounp{version_nodots}.zip"
url_x64 = "https://downloads.example.org/innounp{version_nodots}-{arch}.zip"

[install]
kind = "archive"
executables = [".", "bin"]
"#;

    fn context(architecture: Architecture) -> RunContext {
        RunContext {
            mode: Mode::Install,
            architecture,
            install_path: PathBuf::from("/opt/portable/innounp"),
            temp_dir: PathBuf::from("/tmp/appman-innounp"),
            installed_version: None,
            client: WebClient::new(&NetworkConfig::default()).unwrap(),
        }
    }

    #[test]
    fn test_spec_from_manifest() {
        let profile = ManifestProfile::from_toml(INNOUNP).unwrap();
        assert_eq!(profile.spec().name(), "innounp");
        assert!(profile.spec().dependencies().contains("7zip"));
        assert!(profile.spec().is_portable());
        assert!(profile.spec().is_updatable());
    }

    #[test]
    fn test_version_pattern() {
        let profile = ManifestProfile::from_toml(INNOUNP).unwrap();
        let page = r#"<a href="/p/innounp/news/2019/">Inno Setup Unpacker 0.49 released</a>"#;
        assert_eq!(profile.parse_version(page).unwrap(), "0.49");
        assert!(matches!(
            profile.parse_version("nothing to see"),
            Err(AppManError::Hook { .. })
        ));
    }

    #[test]
    fn test_plain_body_version() {
        let source = INNOUNP.replace("pattern = 'Inno Setup Unpacker ([0-9.]+)'\n", "");
        let profile = ManifestProfile::from_toml(&source).unwrap();
        assert_eq!(profile.parse_version("  2.1.0\n").unwrap(), "2.1.0");
    }

    #[tokio::test]
    async fn test_download_url_per_architecture() {
        let profile = ManifestProfile::from_toml(INNOUNP).unwrap();

        let x86 = profile.download_requests(&context(Architecture::X86), "0.49").unwrap();
        assert_eq!(x86.len(), 1);
        assert_eq!(x86[0].url().as_str(), "https://downloads.example.org/innounp049.zip");
        assert_eq!(x86[0].path(), Path::new("/tmp/appman-innounp/innounp049.zip"));
        assert_eq!(x86[0].method(), Method::Get);

        let x64 = profile.download_requests(&context(Architecture::X64), "0.49").unwrap();
        assert_eq!(x64[0].url().as_str(), "https://downloads.example.org/innounp049-x64.zip");
    }

    #[tokio::test]
    async fn test_executable_dirs() {
        let profile = ManifestProfile::from_toml(INNOUNP).unwrap();
        let dirs = profile.executable_dirs(&context(Architecture::X64)).unwrap();
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/opt/portable/innounp"),
                PathBuf::from("/opt/portable/innounp/bin"),
            ]
        );
    }

    #[test]
    fn test_invalid_manifests() {
        let bad_pattern = INNOUNP.replace("([0-9.]+)", "([0-9.]+");
        assert!(ManifestProfile::from_toml(&bad_pattern).unwrap_err().is_configuration());

        let unknown_key = format!("{}\nsurprise = true\n", INNOUNP);
        assert!(ManifestProfile::from_toml(&unknown_key).is_err());
    }

    #[tokio::test]
    async fn test_post_with_body() {
        let source = INNOUNP.replace(
            "[install]",
            "method = \"post\"\nfile = \"setup.zip\"\nbody = { token = \"abc\" }\n\n[install]",
        );
        let profile = ManifestProfile::from_toml(&source).unwrap();
        let requests = profile.download_requests(&context(Architecture::X86), "1.0").unwrap();
        assert_eq!(requests[0].method(), Method::Post);
        assert_eq!(requests[0].file_name(), "setup.zip");
        assert_eq!(requests[0].body().unwrap().pairs(), vec![("token", "abc")]);
    }
}

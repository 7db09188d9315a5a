use crate::{Result, AppManError};
use crate::utils::fs::TreeMerger;
use flate2::read::GzDecoder;
use memmap2::MmapOptions;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::debug;
use zip::ZipArchive;

/// Archive formats that can be unpacked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    /// Guess the format from the file name
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Unpacks an archive into a staging directory and merge-copies the result
/// into the destination.
#[derive(Debug, Clone, Default)]
pub struct ArchiveExtractor {
    merger: TreeMerger,
    strip_single_root: bool,
}

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merger(mut self, merger: TreeMerger) -> Self {
        self.merger = merger;
        self
    }

    /// When the archive holds exactly one top-level directory, merge its
    /// content instead of the directory itself
    pub fn strip_single_root(mut self, yes: bool) -> Self {
        self.strip_single_root = yes;
        self
    }

    /// Extract `archive` into `dest`, staging under `scratch`.
    pub fn extract(&self, archive: &Path, scratch: &Path, dest: &Path) -> Result<()> {
        let staging = tempfile::Builder::new()
            .prefix("staging-")
            .tempdir_in(scratch)
            .map_err(|e| AppManError::fs(scratch, e))?;

        self.unpack(archive, staging.path())?;

        let root = if self.strip_single_root {
            single_root(staging.path())?
        } else {
            staging.path().to_path_buf()
        };

        debug!(archive = %archive.display(), dest = %dest.display(), "merging extracted tree");
        self.merger.merge(&root, dest)
    }

    /// Unpack `archive` as-is into `into`
    pub fn unpack(&self, archive: &Path, into: &Path) -> Result<()> {
        let kind = ArchiveKind::detect(archive).ok_or_else(|| {
            AppManError::Archive(format!("Unsupported archive format: {}", archive.display()))
        })?;
        std::fs::create_dir_all(into).map_err(|e| AppManError::fs(into, e))?;

        match kind {
            ArchiveKind::Zip => extract_zip_mmap(archive, into),
            ArchiveKind::Tar => {
                let file = File::open(archive).map_err(|e| AppManError::fs(archive, e))?;
                unpack_tar(Archive::new(file), into)
            }
            ArchiveKind::TarGz => {
                let file = File::open(archive).map_err(|e| AppManError::fs(archive, e))?;
                unpack_tar(Archive::new(GzDecoder::new(file)), into)
            }
        }
    }
}

fn unpack_tar<R: std::io::Read>(mut archive: Archive<R>, into: &Path) -> Result<()> {
    // `unpack` refuses entries that would land outside `into`
    archive
        .unpack(into)
        .map_err(|e| AppManError::Archive(format!("Failed to unpack tar archive: {}", e)))
}

fn extract_zip_mmap(archive_path: &Path, into: &Path) -> Result<()> {
    // Use memory-mapped file for faster extraction
    let file = File::open(archive_path)
        .map_err(|e| AppManError::Archive(format!("Failed to open archive: {}", e)))?;

    let mmap = unsafe {
        MmapOptions::new().map(&file)
            .map_err(|e| AppManError::Archive(format!("Failed to mmap file: {}", e)))?
    };

    let cursor = Cursor::new(&mmap[..]);
    let mut archive = ZipArchive::new(cursor)
        .map_err(|e| AppManError::Archive(format!("Failed to read archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)
            .map_err(|e| AppManError::Archive(format!("Failed to read file: {}", e)))?;

        let relative = entry.enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| AppManError::Archive(format!("Path traversal detected: {}", entry.name())))?;
        let outpath = into.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath).map_err(|e| AppManError::fs(&outpath, e))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppManError::fs(parent, e))?;
        }

        let mut outfile = File::create(&outpath).map_err(|e| AppManError::fs(&outpath, e))?;
        std::io::copy(&mut entry, &mut outfile).map_err(|e| AppManError::fs(&outpath, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode))
                    .map_err(|e| AppManError::fs(&outpath, e))?;
            }
        }
    }

    Ok(())
}

/// The only directory in `dir`, or `dir` itself when it holds anything else
fn single_root(dir: &Path) -> Result<PathBuf> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| AppManError::fs(dir, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| AppManError::fs(dir, e))?;

    if entries.len() == 1 {
        let only = entries.remove(0).path();
        if only.is_dir() {
            return Ok(only);
        }
    }
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn make_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn make_tar_gz(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_detect_kind() {
        assert_eq!(ArchiveKind::detect(Path::new("a/tool.ZIP")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect(Path::new("tool.tar.gz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("tool.tgz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("tool.tar")), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::detect(Path::new("setup.exe")), None);
    }

    #[test]
    fn test_zip_extract_merges_into_existing_install() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("tool.zip");
        make_zip(&archive, &[("tool.exe", "v2"), ("docs/readme.txt", "hello")]);

        let dest = tmp.path().join("install");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("tool.exe"), "v1").unwrap();
        std::fs::write(dest.join("settings.ini"), "mine").unwrap();

        ArchiveExtractor::new().extract(&archive, tmp.path(), &dest).unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("tool.exe")).unwrap(), "v2");
        assert_eq!(std::fs::read_to_string(dest.join("docs/readme.txt")).unwrap(), "hello");
        assert_eq!(std::fs::read_to_string(dest.join("settings.ini")).unwrap(), "mine");
    }

    #[test]
    fn test_strip_single_root() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("tool.tar.gz");
        make_tar_gz(&archive, &[("tool-1.0/bin/tool", "exe"), ("tool-1.0/LICENSE", "gpl")]);

        let dest = tmp.path().join("install");
        ArchiveExtractor::new()
            .strip_single_root(true)
            .extract(&archive, tmp.path(), &dest)
            .unwrap();

        assert!(dest.join("bin/tool").is_file());
        assert!(dest.join("LICENSE").is_file());
        assert!(!dest.join("tool-1.0").exists());
    }

    #[test]
    fn test_staging_is_removed() {
        let tmp = tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let archive = tmp.path().join("a.zip");
        make_zip(&archive, &[("a.txt", "a")]);

        ArchiveExtractor::new().extract(&archive, &scratch, &tmp.path().join("out")).unwrap();

        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_unsupported_format() {
        let tmp = tempdir().unwrap();
        let setup = tmp.path().join("setup.exe");
        std::fs::write(&setup, "MZ").unwrap();
        let err = ArchiveExtractor::new().unpack(&setup, &tmp.path().join("out")).unwrap_err();
        assert!(matches!(err, AppManError::Archive(_)));
    }
}

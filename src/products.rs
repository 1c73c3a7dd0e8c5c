//! Declared build outputs and binary dependencies.
//!
//! A recipe declares what a successful build must produce ([`Product`]) and
//! which prebuilt packages it needs installed into the sandbox before the
//! script runs ([`Dependency`]). Product names are platform-neutral; the
//! mapping to on-disk file names (lib prefix, `.so`/`.dylib`/`.dll`,
//! versioned suffixes, `.exe`) happens here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::manifest::{InstallManifest, ManifestError};
use crate::platform::{Os, Platform};
use crate::shards::{extract_tarball, fetch_verified, ShardError};

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Fetch(#[from] ShardError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One thing a build promises to install into its prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Product {
    /// A shared library, found under `lib`/`lib64` (or `bin` on Windows).
    Library { name: String },
    /// An executable under `bin`.
    Executable { name: String },
    /// Any file at a fixed prefix-relative path.
    File { path: String },
}

impl Product {
    pub fn library(name: impl Into<String>) -> Self {
        Product::Library { name: name.into() }
    }

    pub fn executable(name: impl Into<String>) -> Self {
        Product::Executable { name: name.into() }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Product::File { path: path.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            Product::Library { name } | Product::Executable { name } => name,
            Product::File { path } => path,
        }
    }

    /// The canonical file name this product maps to on `platform`, used in
    /// diagnostics. Actual matching also accepts versioned variants.
    pub fn expected_name(&self, platform: Platform) -> String {
        match self {
            Product::Library { name } => match platform.os {
                Os::Windows => format!("{}.dll", name),
                _ => format!("lib{}.{}", name, platform.dlext()),
            },
            Product::Executable { name } => format!("{}{}", name, platform.exeext()),
            Product::File { path } => path.clone(),
        }
    }

    /// Find the file satisfying this product inside `prefix`, if any.
    pub fn locate(&self, prefix: &Path, platform: Platform) -> Option<PathBuf> {
        match self {
            Product::File { path } => {
                let candidate = prefix.join(path);
                candidate.exists().then_some(candidate)
            }
            Product::Executable { name } => {
                let candidate = prefix
                    .join("bin")
                    .join(format!("{}{}", name, platform.exeext()));
                candidate.is_file().then_some(candidate)
            }
            Product::Library { name } => {
                let dirs: &[&str] = match platform.os {
                    // DLLs land next to executables.
                    Os::Windows => &["bin", "lib"],
                    _ => &["lib", "lib64"],
                };
                for dir in dirs {
                    let dir = prefix.join(dir);
                    let Ok(entries) = std::fs::read_dir(&dir) else {
                        continue;
                    };
                    let mut matches: Vec<PathBuf> = entries
                        .flatten()
                        .map(|e| e.path())
                        .filter(|p| {
                            p.file_name()
                                .and_then(|n| n.to_str())
                                .map(|n| library_name_matches(name, n, platform))
                                .unwrap_or(false)
                        })
                        .collect();
                    matches.sort();
                    if let Some(found) = matches.into_iter().next() {
                        return Some(found);
                    }
                }
                None
            }
        }
    }
}

/// Whether `file_name` is a plausible on-disk spelling of library `name`:
/// `libfoo.so`, `libfoo.so.1.2`, `libfoo.3.dylib`, `foo.dll`, `libfoo.dll`.
fn library_name_matches(name: &str, file_name: &str, platform: Platform) -> bool {
    let escaped = regex::escape(name);
    let pattern = match platform.os {
        Os::Linux => format!(r"^lib{}\.so(\.\d+)*$", escaped),
        Os::Macos => format!(r"^lib{}(\.\d+)*\.dylib$", escaped),
        Os::Windows => format!(r"^(lib)?{}\.dll$", escaped),
    };
    regex::Regex::new(&pattern)
        .map(|re| re.is_match(file_name))
        .unwrap_or(false)
}

/// A prebuilt package to install into the build environment, resolved
/// through its install manifest.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub manifest: InstallManifest,
}

impl Dependency {
    pub fn new(manifest: InstallManifest) -> Self {
        Self { manifest }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    fn marker_path(&self, deps_prefix: &Path) -> PathBuf {
        deps_prefix
            .join(".crossforge")
            .join(format!("{}.sha256", self.manifest.name))
    }

    fn file_list_path(&self, deps_prefix: &Path) -> PathBuf {
        deps_prefix
            .join(".crossforge")
            .join(format!("{}.files", self.manifest.name))
    }

    /// Whether this dependency is already installed at the manifest's exact
    /// content hash.
    pub fn satisfied(&self, deps_prefix: &Path, platform: Platform) -> bool {
        let Ok(artifact) = self.manifest.artifact_for(platform) else {
            return false;
        };
        std::fs::read_to_string(self.marker_path(deps_prefix))
            .map(|recorded| recorded.trim() == artifact.sha256)
            .unwrap_or(false)
    }

    /// Fetch and unpack this dependency into `deps_prefix`. Downloads follow
    /// the caller's retry policy (attempt count and initial backoff).
    ///
    /// Idempotent: an already satisfied install is skipped unless `force` is
    /// set. The content-hash marker is written last, so an interrupted
    /// install is retried in full next time.
    pub async fn install(
        &self,
        deps_prefix: &Path,
        platform: Platform,
        downloads_cache: &Path,
        attempts: u32,
        backoff_secs: u64,
        force: bool,
    ) -> Result<(), DependencyError> {
        let artifact = self.manifest.artifact_for(platform)?;

        if !force && self.satisfied(deps_prefix, platform) {
            debug!(dep = %self.manifest.name, "dependency already installed");
            return Ok(());
        }

        info!(dep = %self.manifest.name, platform = %platform, "installing dependency");
        let tarball = fetch_verified(
            &artifact.url,
            &artifact.sha256,
            downloads_cache,
            attempts,
            backoff_secs,
        )
        .await?;

        // Unpack to a staging tree, then merge. The prefix is shared by all
        // dependencies so it cannot be replaced wholesale.
        let staging = deps_prefix.join(format!(".unpack-{}", self.manifest.name));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        extract_tarball(&tarball, &staging).await?;
        let mut installed = Vec::new();
        merge_tree(&staging, deps_prefix, Path::new(""), &mut installed)?;
        std::fs::remove_dir_all(&staging)?;

        let marker = self.marker_path(deps_prefix);
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // The file list makes uninstall possible before packaging; without it
        // dependency files would leak into the product tarball.
        let listing: String = installed
            .iter()
            .map(|p| format!("{}\n", p.display()))
            .collect();
        std::fs::write(self.file_list_path(deps_prefix), listing)?;
        std::fs::write(&marker, &artifact.sha256)?;
        Ok(())
    }

    /// Remove every file this dependency installed. Directories left empty
    /// are pruned; files the build overwrote or deleted are skipped.
    pub fn uninstall(&self, deps_prefix: &Path) -> Result<(), DependencyError> {
        let list_path = self.file_list_path(deps_prefix);
        let Ok(listing) = std::fs::read_to_string(&list_path) else {
            return Ok(());
        };
        for line in listing.lines().filter(|l| !l.is_empty()) {
            let path = deps_prefix.join(line);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            // Prune now-empty parent directories up to the prefix.
            let mut dir = path.parent();
            while let Some(d) = dir {
                if d == deps_prefix || std::fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
        std::fs::remove_file(&list_path).ok();
        std::fs::remove_file(self.marker_path(deps_prefix)).ok();
        Ok(())
    }
}

/// Move `src`'s contents into `dest`, overwriting files that exist.
/// Collects the prefix-relative path of every file moved.
fn merge_tree(
    src: &Path,
    dest: &Path,
    rel: &Path,
    installed: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let rel_path = rel.join(entry.file_name());
        let meta = entry.metadata()?;
        if meta.is_dir() {
            merge_tree(&entry.path(), &target, &rel_path, installed)?;
        } else {
            if target.exists() {
                std::fs::remove_file(&target)?;
            }
            std::fs::rename(entry.path(), &target)?;
            installed.push(rel_path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Abi, Arch, Libc};
    use tempfile::TempDir;

    fn linux() -> Platform {
        Platform::linux(Arch::X86_64)
    }

    fn windows() -> Platform {
        Platform::new(Os::Windows, Arch::X86_64, Libc::None, Abi::None)
    }

    fn macos() -> Platform {
        Platform::new(Os::Macos, Arch::X86_64, Libc::None, Abi::None)
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn library_names_per_platform() {
        let p = Product::library("zstd");
        assert_eq!(p.expected_name(linux()), "libzstd.so");
        assert_eq!(p.expected_name(macos()), "libzstd.dylib");
        assert_eq!(p.expected_name(windows()), "zstd.dll");
    }

    #[test]
    fn versioned_library_variants_match() {
        assert!(library_name_matches("z", "libz.so", linux()));
        assert!(library_name_matches("z", "libz.so.1", linux()));
        assert!(library_name_matches("z", "libz.so.1.3.1", linux()));
        assert!(!library_name_matches("z", "libzstd.so", linux()));
        assert!(!library_name_matches("z", "libz.a", linux()));

        assert!(library_name_matches("ssl", "libssl.dylib", macos()));
        assert!(library_name_matches("ssl", "libssl.3.dylib", macos()));
        assert!(!library_name_matches("ssl", "libssl3.dylib", macos()));

        assert!(library_name_matches("ssl", "ssl.dll", windows()));
        assert!(library_name_matches("ssl", "libssl.dll", windows()));
        assert!(!library_name_matches("ssl", "ssl.dll.a", windows()));
    }

    #[test]
    fn locate_library_prefers_lib_dir() {
        let prefix = TempDir::new().unwrap();
        touch(&prefix.path().join("lib/libfoo.so.2"));

        let found = Product::library("foo").locate(prefix.path(), linux()).unwrap();
        assert!(found.ends_with("lib/libfoo.so.2"));
        assert!(Product::library("bar").locate(prefix.path(), linux()).is_none());
    }

    #[test]
    fn locate_windows_dll_in_bin() {
        let prefix = TempDir::new().unwrap();
        touch(&prefix.path().join("bin/foo.dll"));
        let found = Product::library("foo")
            .locate(prefix.path(), windows())
            .unwrap();
        assert!(found.ends_with("bin/foo.dll"));
    }

    #[test]
    fn locate_executable_uses_exe_suffix() {
        let prefix = TempDir::new().unwrap();
        touch(&prefix.path().join("bin/tool.exe"));
        assert!(Product::executable("tool")
            .locate(prefix.path(), windows())
            .is_some());
        assert!(Product::executable("tool")
            .locate(prefix.path(), linux())
            .is_none());
    }

    #[test]
    fn locate_file_is_literal() {
        let prefix = TempDir::new().unwrap();
        touch(&prefix.path().join("share/pkgconfig/foo.pc"));
        assert!(Product::file("share/pkgconfig/foo.pc")
            .locate(prefix.path(), linux())
            .is_some());
    }

    #[test]
    fn dependency_satisfaction_tracks_marker_hash() {
        let prefix = TempDir::new().unwrap();
        let mut manifest = InstallManifest::new("zlib", "1.3.1");
        manifest.insert(
            linux(),
            crate::manifest::ArtifactRef {
                url: "https://example.invalid/zlib.tar.gz".into(),
                sha256: "ab".repeat(32),
            },
        );
        let dep = Dependency::new(manifest);

        assert!(!dep.satisfied(prefix.path(), linux()));

        let marker = dep.marker_path(prefix.path());
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(&marker, "ab".repeat(32)).unwrap();
        assert!(dep.satisfied(prefix.path(), linux()));

        // A stale marker from a previous version does not satisfy.
        std::fs::write(&marker, "cd".repeat(32)).unwrap();
        assert!(!dep.satisfied(prefix.path(), linux()));
    }

    #[tokio::test]
    async fn install_honors_the_callers_retry_policy() {
        let prefix = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let mut manifest = InstallManifest::new("zlib", "1.3.1");
        manifest.insert(
            linux(),
            crate::manifest::ArtifactRef {
                url: "http://host.invalid/zlib.tar.gz".into(),
                sha256: "ab".repeat(32),
            },
        );
        let dep = Dependency::new(manifest);

        // A single attempt with no backoff fails immediately instead of
        // retrying on a hardcoded schedule, and leaves no marker behind.
        let err = dep
            .install(prefix.path(), linux(), cache.path(), 1, 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DependencyError::Fetch(_)));
        assert!(!dep.satisfied(prefix.path(), linux()));
    }

    #[test]
    fn merge_tree_overwrites_and_records_installed_files() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        touch(&src.path().join("lib/libnew.so"));
        touch(&dest.path().join("lib/libold.so"));
        touch(&dest.path().join("lib/libnew.so"));

        let mut installed = Vec::new();
        merge_tree(src.path(), dest.path(), Path::new(""), &mut installed).unwrap();
        assert!(dest.path().join("lib/libnew.so").exists());
        assert!(dest.path().join("lib/libold.so").exists());
        assert_eq!(installed, vec![PathBuf::from("lib/libnew.so")]);
    }

    #[test]
    fn uninstall_removes_listed_files_and_prunes_empty_dirs() {
        let prefix = TempDir::new().unwrap();
        let mut manifest = InstallManifest::new("zlib", "1.3.1");
        manifest.insert(
            linux(),
            crate::manifest::ArtifactRef {
                url: "https://example.invalid/zlib.tar.gz".into(),
                sha256: "ab".repeat(32),
            },
        );
        let dep = Dependency::new(manifest);

        touch(&prefix.path().join("include/zlib.h"));
        touch(&prefix.path().join("lib/libz.so.1"));
        touch(&prefix.path().join("lib/libbuilt.so"));
        std::fs::create_dir_all(prefix.path().join(".crossforge")).unwrap();
        std::fs::write(
            dep.file_list_path(prefix.path()),
            "include/zlib.h\nlib/libz.so.1\n",
        )
        .unwrap();

        dep.uninstall(prefix.path()).unwrap();
        assert!(!prefix.path().join("include").exists(), "emptied dir pruned");
        assert!(!prefix.path().join("lib/libz.so.1").exists());
        assert!(prefix.path().join("lib/libbuilt.so").exists());
    }
}

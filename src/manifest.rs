//! Install manifests: the per-platform artifact map a finished build emits.
//!
//! A manifest records, for every platform a package was built for, where the
//! product tarball lives and what it hashes to. Downstream builds consume
//! manifests to install dependencies, so the format is stable JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::platform::Platform;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write manifest {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest for '{name}' has no artifact for platform {platform}")]
    MissingPlatform { name: String, platform: Platform },
}

/// One downloadable product tarball.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub url: String,
    /// Lowercase hex SHA-256 of the tarball.
    pub sha256: String,
}

/// The full manifest for one package at one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallManifest {
    pub name: String,
    pub version: String,
    /// RFC 3339 timestamp of when the manifest was generated.
    #[serde(default)]
    pub created: String,
    /// Keyed by canonical triplet.
    pub artifacts: BTreeMap<String, ArtifactRef>,
}

impl InstallManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            created: chrono::Utc::now().to_rfc3339(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, platform: Platform, artifact: ArtifactRef) {
        self.artifacts.insert(platform.triplet(), artifact);
    }

    /// Artifact for `platform`, or an error naming what is missing.
    pub fn artifact_for(&self, platform: Platform) -> Result<&ArtifactRef, ManifestError> {
        self.artifacts
            .get(&platform.triplet())
            .ok_or(ManifestError::MissingPlatform {
                name: self.name.clone(),
                platform,
            })
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ManifestError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let write = |source| ManifestError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ManifestError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(path, json).map_err(write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Arch;
    use tempfile::TempDir;

    fn sample() -> InstallManifest {
        let mut m = InstallManifest::new("zlib", "1.3.1");
        m.insert(
            Platform::linux(Arch::X86_64),
            ArtifactRef {
                url: "https://example.invalid/zlib.x86_64-linux-gnu.tar.gz".into(),
                sha256: "aa".repeat(32),
            },
        );
        m
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifests/zlib.json");
        let m = sample();
        m.save(&path).unwrap();

        let loaded = InstallManifest::load(&path).unwrap();
        assert_eq!(loaded.name, "zlib");
        assert_eq!(
            loaded.artifact_for(Platform::linux(Arch::X86_64)).unwrap(),
            m.artifact_for(Platform::linux(Arch::X86_64)).unwrap()
        );
    }

    #[test]
    fn missing_platform_is_a_named_error() {
        let m = sample();
        let err = m.artifact_for(Platform::linux(Arch::Aarch64)).unwrap_err();
        assert!(err.to_string().contains("aarch64-linux-gnu"));
        assert!(err.to_string().contains("zlib"));
    }

    #[test]
    fn artifacts_key_by_triplet() {
        let m = sample();
        assert_eq!(m.platforms().collect::<Vec<_>>(), vec!["x86_64-linux-gnu"]);
    }
}

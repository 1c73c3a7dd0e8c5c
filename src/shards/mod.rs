//! Compiler shard and base rootfs provisioning.
//!
//! A shard is an immutable, hash-verified toolchain image for one target
//! platform. Shards are downloaded once into a content-addressed cache,
//! reused across builds, never mutated after verification, and evicted only
//! by an explicit `clean`. The shared base rootfs goes through the same
//! machinery under a reserved index key.
//!
//! Concurrency: a per-shard advisory file lock spans download, verification
//! and publish, so two concurrent builds never fetch the same shard twice and
//! a half-downloaded artifact is never observable as valid.

mod download;
mod index;
mod squashfs;

pub use download::{fetch_verified, sha256_file};
pub use index::{ShardIndex, ShardSource};
pub use squashfs::rewrite_squashfs_uids;

use anyhow::Result;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::platform::Platform;

/// How a shard is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardEncoding {
    /// Extracted tarball tree. Higher disk cost, no privilege required.
    Archive,
    /// Ready-to-mount squashfs image. Compact, but mounting needs either
    /// superuser privilege or a uid-rewritten image inside a user namespace.
    Squashfs,
}

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("platform {0} has no shard in the index")]
    Unsupported(String),

    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("squashfs id table in {0} is compressed; cannot rewrite ownership")]
    CompressedIdTable(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A provisioned shard ready for mounting into a sandbox.
#[derive(Debug, Clone)]
pub struct MountableShard {
    /// Extracted tree (Archive) or image file (Squashfs).
    pub path: PathBuf,
    pub encoding: ShardEncoding,
    /// Mount point inside the sandbox, e.g. `/opt/x86_64-linux-gnu`.
    pub sandbox_path: PathBuf,
}

/// Downloads, verifies, caches and hands out shards and the base rootfs.
pub struct ShardManager {
    index: ShardIndex,
    shards_dir: PathBuf,
    rootfs_dir: PathBuf,
    downloads_cache: PathBuf,
    download_attempts: u32,
    retry_backoff_secs: u64,
}

impl ShardManager {
    pub fn new(config: &Config, index: ShardIndex) -> Self {
        Self {
            index,
            shards_dir: config.paths.shards_dir.clone(),
            rootfs_dir: config.paths.rootfs_dir.clone(),
            downloads_cache: config.paths.downloads_cache.clone(),
            download_attempts: config.shards.download_attempts,
            retry_backoff_secs: config.shards.retry_backoff_secs,
        }
    }

    /// Load the shard index from the configured mirror (cached on disk).
    pub async fn with_default_index(config: &Config) -> Result<Self> {
        let index = ShardIndex::load(config).await?;
        Ok(Self::new(config, index))
    }

    /// Ensure the compiler shard for `platform` is present and verified.
    ///
    /// Returns the cached path: an extracted tree for [`ShardEncoding::Archive`],
    /// the image file for [`ShardEncoding::Squashfs`]. A verified cache entry
    /// is never re-downloaded or overwritten.
    pub async fn ensure(
        &self,
        platform: Platform,
        encoding: ShardEncoding,
    ) -> Result<MountableShard, ShardError> {
        let triplet = platform.triplet();
        let source = self
            .index
            .shard(&triplet, encoding)
            .ok_or_else(|| ShardError::Unsupported(triplet.clone()))?;
        let path = self
            .ensure_source(&source, &self.shards_dir, encoding)
            .await?;
        Ok(MountableShard {
            path,
            encoding,
            sandbox_path: PathBuf::from("/opt").join(&triplet),
        })
    }

    /// Ensure the shared base rootfs is present and verified.
    pub async fn ensure_rootfs(&self, encoding: ShardEncoding) -> Result<PathBuf, ShardError> {
        let source = self
            .index
            .rootfs(encoding)
            .ok_or_else(|| ShardError::Unsupported("rootfs".to_string()))?;
        self.ensure_source(&source, &self.rootfs_dir, encoding).await
    }

    /// Shared download/verify/unpack path for shards and the rootfs.
    ///
    /// Holds the per-shard lock for the whole operation. The cache entry name
    /// embeds the content hash, so a changed upstream artifact lands in a new
    /// entry instead of invalidating a verified one.
    async fn ensure_source(
        &self,
        source: &ShardSource,
        cache_dir: &Path,
        encoding: ShardEncoding,
    ) -> Result<PathBuf, ShardError> {
        fs::create_dir_all(cache_dir)?;
        let cache_name = source.cache_name();
        let final_path = cache_dir.join(&cache_name);

        let _guard = ShardLock::acquire(&cache_dir.join(format!("{}.lock", cache_name)))?;

        if final_path.exists() {
            debug!(entry = %final_path.display(), "shard cache hit");
            return Ok(final_path);
        }

        info!(url = %source.url, "fetching shard");
        let archive = fetch_verified(
            &source.url,
            &source.sha256,
            &self.downloads_cache,
            self.download_attempts,
            self.retry_backoff_secs,
        )
        .await?;

        match encoding {
            ShardEncoding::Squashfs => {
                // Publish by atomic rename so a concurrent reader never sees
                // a partial file. Ownership in the image is rewritten to the
                // invoking user first, since inside a user namespace only the
                // mapped uid can traverse the mounted tree.
                let staging = final_path.with_extension("part");
                fs::copy(&archive, &staging)?;
                #[cfg(unix)]
                squashfs::rewrite_squashfs_uids(&staging, nix::unistd::getuid().as_raw())?;
                fs::rename(&staging, &final_path)?;
            }
            ShardEncoding::Archive => {
                extract_tarball(&archive, &final_path).await?;
            }
        }

        Ok(final_path)
    }

    /// Evict every cached shard and rootfs entry. Explicit, never automatic.
    pub fn clean(&self) -> Result<()> {
        for dir in [&self.shards_dir, &self.rootfs_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Cached entries currently present, for `shards list`.
    pub fn cached_entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        if self.shards_dir.exists() {
            for entry in fs::read_dir(&self.shards_dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "lock").unwrap_or(false) {
                    continue;
                }
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn index(&self) -> &ShardIndex {
        &self.index
    }
}

/// RAII advisory lock guarding one shard cache entry.
struct ShardLock {
    file: File,
}

impl ShardLock {
    fn acquire(path: &Path) -> Result<Self, std::io::Error> {
        let file = File::create(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for ShardLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Extract a .tar.gz into `dest`, staging in a sibling directory so the final
/// path only ever appears fully populated.
pub(crate) async fn extract_tarball(archive: &Path, dest: &Path) -> Result<(), ShardError> {
    let staging = dest.with_extension("part");
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let status = tokio::process::Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(&staging)
        .status()
        .await
        .map_err(|e| ShardError::Other(anyhow::anyhow!("failed to spawn tar: {}", e)))?;
    if !status.success() {
        fs::remove_dir_all(&staging).ok();
        return Err(ShardError::Other(anyhow::anyhow!(
            "tar exited with {} extracting {}",
            status,
            archive.display()
        )));
    }

    fs::rename(&staging, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Paths;

    fn test_config(tmp: &Path) -> Config {
        let mut config = Config::default();
        config.paths = Paths {
            config_dir: tmp.join("config"),
            storage_dir: tmp.join("storage"),
            downloads_cache: tmp.join("downloads"),
            rootfs_dir: tmp.join("rootfs"),
            shards_dir: tmp.join("shards"),
            qemu_dir: tmp.join("qemu"),
            state_dir: tmp.join("state"),
        };
        config
    }

    #[test]
    fn unsupported_platform_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let manager = ShardManager::new(&config, ShardIndex::empty());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(manager.ensure(Platform::host(), ShardEncoding::Archive))
            .unwrap_err();
        assert!(matches!(err, ShardError::Unsupported(_)));
    }

    #[test]
    fn shard_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("entry.lock");

        let first = ShardLock::acquire(&lock_path).unwrap();
        // A second exclusive flock on the same file from this process would
        // succeed (flock is per-open-file across processes), so just verify
        // acquire/release cycles don't wedge.
        drop(first);
        let _second = ShardLock::acquire(&lock_path).unwrap();
    }

    #[test]
    fn cached_entries_skips_lock_files() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        fs::create_dir_all(&config.paths.shards_dir).unwrap();
        fs::write(config.paths.shards_dir.join("a.tar.gz"), b"x").unwrap();
        fs::write(config.paths.shards_dir.join("a.tar.gz.lock"), b"").unwrap();

        let manager = ShardManager::new(&config, ShardIndex::empty());
        let entries = manager.cached_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("a.tar.gz"));
    }
}

//! Cache and state directory resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. crossforge-specific env var (CROSSFORGE_SHARDS_DIR, etc.)
//! 2. XDG env var (XDG_CACHE_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.cache, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG
//! spec. The shard, rootfs and qemu caches are independently overridable so
//! large artifacts can live on a scratch disk.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved directory paths for the entire application.
///
/// Created once at startup, threaded through Config. All paths are absolute.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// Storage root: default parent of the caches below
    pub storage_dir: PathBuf,

    /// Download cache: source archives, shard tarballs, dependency artifacts
    pub downloads_cache: PathBuf,

    /// Base root filesystem images
    pub rootfs_dir: PathBuf,

    /// Per-target compiler shards (extracted trees and squashfs images)
    pub shards_dir: PathBuf,

    /// Kernel/initrd images for the emulation backend
    pub qemu_dir: PathBuf,

    /// Build workspaces and logs
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "CROSSFORGE_CONFIG_DIR", || {
            strategy.config_dir().join("crossforge")
        });

        let storage_dir = env_or(&env_fn, "CROSSFORGE_STORAGE_DIR", || {
            strategy.cache_dir().join("crossforge")
        });

        let state_dir = env_or(&env_fn, "CROSSFORGE_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("crossforge")
        });

        // Cache subdirectories default under storage_dir but are each
        // independently overridable.
        let downloads_cache = env_or(&env_fn, "CROSSFORGE_DOWNLOADS_CACHE", || {
            storage_dir.join("downloads")
        });
        let rootfs_dir = env_or(&env_fn, "CROSSFORGE_ROOTFS_DIR", || {
            storage_dir.join("rootfs")
        });
        let shards_dir = env_or(&env_fn, "CROSSFORGE_SHARDS_DIR", || {
            storage_dir.join("shards")
        });
        let qemu_dir = env_or(&env_fn, "CROSSFORGE_QEMU_DIR", || storage_dir.join("qemu"));

        Ok(Self {
            config_dir,
            storage_dir,
            downloads_cache,
            rootfs_dir,
            shards_dir,
            qemu_dir,
            state_dir,
        })
    }

    // ── Convenience accessors for specific files ──

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Cached shard index fetched from the remote mirror.
    pub fn shard_index_file(&self) -> PathBuf {
        self.shards_dir.join("index.json")
    }

    /// Root directory for build workspaces.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    /// Directory accepted build tarballs and manifests are written to.
    pub fn products_dir(&self) -> PathBuf {
        self.state_dir.join("products")
    }

    /// Logs directory
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            &self.config_dir,
            &self.storage_dir,
            &self.downloads_cache,
            &self.rootfs_dir,
            &self.shards_dir,
            &self.qemu_dir,
            &self.state_dir,
        ];

        for dir in &dirs {
            create_dir_with_mode(dir)?;
        }

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            // Emergency fallback — should never happen in practice
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            let storage = home.join(".cache").join("crossforge");
            Self {
                config_dir: home.join(".config").join("crossforge"),
                downloads_cache: storage.join("downloads"),
                rootfs_dir: storage.join("rootfs"),
                shards_dir: storage.join("shards"),
                qemu_dir: storage.join("qemu"),
                storage_dir: storage,
                state_dir: home.join(".local").join("state").join("crossforge"),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| shellexpand::tilde(&v).to_string())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute()) // XDG spec: ignore relative paths
        .unwrap_or_else(default)
}

/// Create a directory with mode 0700 per XDG spec.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Helper: build an env_fn from a HashMap
    fn make_env<'a>(
        map: HashMap<&'a str, &'a str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> + use<'a> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let env: HashMap<&str, &str> = HashMap::new();
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();

        assert!(
            paths.config_dir.ends_with("crossforge"),
            "config_dir: {:?}",
            paths.config_dir
        );
        assert!(paths.downloads_cache.ends_with("crossforge/downloads"));
        assert!(paths.shards_dir.ends_with("crossforge/shards"));
        assert!(paths.rootfs_dir.ends_with("crossforge/rootfs"));
        assert!(paths.qemu_dir.ends_with("crossforge/qemu"));
    }

    #[test]
    fn cache_overrides_are_independent() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("CROSSFORGE_SHARDS_DIR", "/scratch/shards");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.shards_dir, PathBuf::from("/scratch/shards"));
        // Other caches stay under the default storage root.
        assert!(paths.downloads_cache.ends_with("crossforge/downloads"));
    }

    #[test]
    fn storage_override_moves_all_caches() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("CROSSFORGE_STORAGE_DIR", "/mnt/big");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.downloads_cache, PathBuf::from("/mnt/big/downloads"));
        assert_eq!(paths.shards_dir, PathBuf::from("/mnt/big/shards"));
        assert_eq!(paths.qemu_dir, PathBuf::from("/mnt/big/qemu"));
    }

    #[test]
    fn relative_paths_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("CROSSFORGE_SHARDS_DIR", "relative/path");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.shards_dir.is_absolute());
        assert_ne!(paths.shards_dir, PathBuf::from("relative/path"));
    }

    #[test]
    fn empty_env_vars_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("CROSSFORGE_STORAGE_DIR", "");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.storage_dir.is_absolute());
        assert!(paths.storage_dir.ends_with("crossforge"));
    }

    #[test]
    fn convenience_accessors() {
        let env: HashMap<&str, &str> = HashMap::new();
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();

        assert!(paths.config_file().ends_with("config.toml"));
        assert!(paths.shard_index_file().ends_with("shards/index.json"));
        assert!(paths.workspaces_dir().ends_with("workspaces"));
        assert!(paths.logs_dir().ends_with("logs"));
    }
}

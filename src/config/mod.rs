//! Process configuration.
//!
//! Settings are resolved in three layers: built-in defaults, then the TOML
//! config file, then `CROSSFORGE_*` environment variables. The resulting
//! [`Config`] is passed explicitly into the shard manager, sandbox runner and
//! orchestrator constructors — never read as ambient global state — so tests
//! can run several configurations side by side in one process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::paths::Paths;
use crate::sandbox::BackendKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved cache/state paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub shards: ShardConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Base URL of the shard mirror serving index.json and shard images.
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,

    /// Prefer compact squashfs shard images over extracted tarballs.
    /// Squashfs needs either a privileged mount or a uid-rewritten image.
    #[serde(default)]
    pub use_squashfs: bool,

    /// Download attempts per artifact before giving up.
    /// Transient network errors are retried; hash mismatches are not.
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,

    /// Initial backoff between download retries, doubled per attempt.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Backend override: unset means "probe and pick".
    #[serde(default)]
    pub runner: Option<BackendKind>,

    /// Accept the macOS SDK license without prompting. Required for any
    /// macOS target; builds for them run under full-system emulation.
    #[serde(default)]
    pub automatic_apple: bool,

    /// Tolerate caches on ecryptfs mounts. Off by default: kernel defects
    /// make unprivileged overlay mounts on ecryptfs unreliable.
    #[serde(default)]
    pub allow_ecryptfs: bool,

    /// Kill a sandboxed command after this many seconds (default 2 hours).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Maximum platforms built concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Parallelism hint exported to build scripts as `nproc`.
    #[serde(default = "default_nproc")]
    pub nproc: u32,

    /// Abort remaining platforms when the validation platform's script
    /// fails. The first-ranked platform always builds first either way.
    #[serde(default = "default_true")]
    pub fail_fast: bool,

    /// Keep workspaces of failed builds around for inspection.
    #[serde(default = "default_true")]
    pub keep_failed_workspaces: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Repair autofixable findings in place.
    #[serde(default = "default_true")]
    pub autofix: bool,

    /// Treat remaining (non-autofixed) findings as build failures.
    #[serde(default)]
    pub fatal: bool,

    /// Per-check switches; every check is individually skippable.
    #[serde(default = "default_true")]
    pub check_platform_match: bool,
    #[serde(default = "default_true")]
    pub check_linkage: bool,
    #[serde(default = "default_true")]
    pub check_symlinks: bool,
    #[serde(default = "default_true")]
    pub check_instruction_set: bool,
}

fn default_mirror_url() -> String {
    "https://shards.crossforge.dev".to_string()
}
fn default_download_attempts() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    1
}
fn default_command_timeout_secs() -> u64 {
    7200
}
fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_nproc() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}
fn default_true() -> bool {
    true
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            mirror_url: default_mirror_url(),
            use_squashfs: false,
            download_attempts: default_download_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runner: None,
            automatic_apple: false,
            allow_ecryptfs: false,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            nproc: default_nproc(),
            fail_fast: true,
            keep_failed_workspaces: true,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            autofix: true,
            fatal: false,
            check_platform_match: true,
            check_linkage: true,
            check_symlinks: true,
            check_instruction_set: true,
        }
    }
}

impl Config {
    /// Load config from the default location, with env overrides applied.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        Self::load_from(paths)
    }

    /// Load config rooted at specific paths (used by tests).
    pub fn load_from(paths: Paths) -> Result<Self> {
        let config_file = paths.config_file();
        let mut config: Config = if config_file.exists() {
            let content = fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read {}", config_file.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_file.display()))?
        } else {
            Config::default()
        };
        config.paths = paths;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `CROSSFORGE_*` env overrides on top of the file-based config.
    pub fn apply_env_overrides<F>(&mut self, env_fn: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env_fn("CROSSFORGE_RUNNER") {
            match v.parse::<BackendKind>() {
                Ok(kind) => self.sandbox.runner = Some(kind),
                Err(e) => tracing::warn!("ignoring CROSSFORGE_RUNNER: {}", e),
            }
        }
        if let Some(v) = env_fn("CROSSFORGE_USE_SQUASHFS") {
            self.shards.use_squashfs = truthy(&v);
        }
        if let Some(v) = env_fn("CROSSFORGE_AUTOMATIC_APPLE") {
            self.sandbox.automatic_apple = truthy(&v);
        }
        if let Some(v) = env_fn("CROSSFORGE_ALLOW_ECRYPTFS") {
            self.sandbox.allow_ecryptfs = truthy(&v);
        }
        if let Some(v) = env_fn("CROSSFORGE_NPROC") {
            if let Ok(n) = v.parse() {
                self.build.nproc = n;
            }
        }
        if let Some(v) = env_fn("CROSSFORGE_MIRROR_URL") {
            if !v.is_empty() {
                self.shards.mirror_url = v;
            }
        }
    }

    /// Directory a given platform's accepted products land in.
    pub fn products_dir(&self) -> PathBuf {
        self.paths.products_dir()
    }
}

fn truthy(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env<'a>(map: HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + use<'a> {
        move |key: &str| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(!config.shards.use_squashfs);
        assert_eq!(config.shards.download_attempts, 3);
        assert!(config.sandbox.runner.is_none());
        assert!(!config.sandbox.automatic_apple);
        assert!(!config.sandbox.allow_ecryptfs);
        assert!(config.audit.autofix);
        assert!(!config.audit.fatal);
        assert!(config.build.fail_fast);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        let mut map = HashMap::new();
        map.insert("CROSSFORGE_RUNNER", "privileged");
        map.insert("CROSSFORGE_USE_SQUASHFS", "1");
        map.insert("CROSSFORGE_AUTOMATIC_APPLE", "true");
        map.insert("CROSSFORGE_ALLOW_ECRYPTFS", "yes");
        map.insert("CROSSFORGE_NPROC", "4");

        config.apply_env_overrides(env(map));
        assert_eq!(config.sandbox.runner, Some(BackendKind::PrivilegedNamespace));
        assert!(config.shards.use_squashfs);
        assert!(config.sandbox.automatic_apple);
        assert!(config.sandbox.allow_ecryptfs);
        assert_eq!(config.build.nproc, 4);
    }

    #[test]
    fn bogus_runner_value_is_ignored() {
        let mut config = Config::default();
        let mut map = HashMap::new();
        map.insert("CROSSFORGE_RUNNER", "docker");
        config.apply_env_overrides(env(map));
        assert!(config.sandbox.runner.is_none());
    }

    #[test]
    fn config_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: tmp.path().to_path_buf(),
            ..Paths::default()
        };
        std::fs::write(
            paths.config_file(),
            "[shards]\nuse_squashfs = true\n[audit]\nfatal = true\n",
        )
        .unwrap();
        let config = Config::load_from(paths).unwrap();
        assert!(config.shards.use_squashfs);
        assert!(config.audit.fatal);
        // Unspecified sections keep their defaults.
        assert_eq!(config.shards.download_attempts, 3);
    }
}

//! The composed sandbox view and its owned resources.
//!
//! A [`SandboxContext`] is built once per (platform, workspace) pair. It owns
//! every host-side resource backing the sandbox — the staging directory for
//! the composed root, spec files, and any host-side mounts the privileged
//! backend created — and releases them on drop, so teardown happens on every
//! exit path: success, script failure, setup error, panic or cancellation.
//! Mounts made *inside* a child's mount namespace die with the child and need
//! no tracking here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{BackendKind, SandboxError};
use crate::platform::Platform;
use crate::shards::MountableShard;
use crate::workspace::Workspace;

/// One bind mount in the composed view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path: a directory for bind mounts, an image for squashfs.
    pub source: PathBuf,
    /// Path inside the composed root, absolute.
    pub target: PathBuf,
    pub writable: bool,
    /// Squashfs images are mounted via loop instead of bind.
    pub squashfs: bool,
}

/// Everything the re-exec'd child needs to build the sandbox, serialized to
/// a spec file because the env map does not fit comfortably in argv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Directory the composed root is assembled in.
    pub root: PathBuf,
    pub mounts: Vec<MountSpec>,
    /// Working directory inside the sandbox.
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// `true` when running as real root (privileged backend): skip the
    /// uid/gid self-mapping and mount squashfs images directly.
    pub privileged: bool,
    /// Shell command; `None` means an interactive shell.
    pub command: Option<String>,
}

/// Result of a sandboxed command.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    /// Combined stdout + stderr, in arrival order per stream.
    pub output: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Bundles rootfs, shards, workspace and environment for one build, and owns
/// the host-side resources backing them.
pub struct SandboxContext {
    pub platform: Platform,
    pub backend: BackendKind,
    rootfs: PathBuf,
    shards: Vec<MountableShard>,
    workspace_root: PathBuf,
    env: BTreeMap<String, String>,
    /// Staging dir for the composed root and spec files; removed on drop.
    staging: PathBuf,
    /// Host-side mounts (privileged squashfs); unmounted on drop, newest first.
    host_mounts: Vec<PathBuf>,
}

impl SandboxContext {
    pub fn new(
        platform: Platform,
        backend: BackendKind,
        rootfs: PathBuf,
        shards: Vec<MountableShard>,
        workspace: &Workspace,
        env: BTreeMap<String, String>,
    ) -> Result<Self, SandboxError> {
        let staging = workspace.sandbox_dir();
        fs::create_dir_all(staging.join("root"))
            .map_err(|e| SandboxError::Setup(format!("creating staging root: {}", e)))?;

        Ok(Self {
            platform,
            backend,
            rootfs,
            shards,
            workspace_root: workspace.root().to_path_buf(),
            env,
            staging,
            host_mounts: Vec::new(),
        })
    }

    /// The directory the composed root gets assembled in.
    pub fn composed_root(&self) -> PathBuf {
        self.staging.join("root")
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Record a mount made on the host side so drop can undo it.
    pub fn track_host_mount(&mut self, target: PathBuf) {
        self.host_mounts.push(target);
    }

    /// Build the mount list for the composed view: rootfs at `/`, each shard
    /// at its `/opt/<triplet>` home, workspace read-write at `/workspace`.
    pub fn mounts(&self) -> Vec<MountSpec> {
        let root = self.composed_root();
        let mut mounts = vec![MountSpec {
            source: self.rootfs.clone(),
            target: root.clone(),
            writable: false,
            squashfs: self.rootfs.extension().map(|e| e == "squashfs").unwrap_or(false),
        }];
        for shard in &self.shards {
            let rel = shard
                .sandbox_path
                .strip_prefix("/")
                .unwrap_or(&shard.sandbox_path);
            mounts.push(MountSpec {
                source: shard.path.clone(),
                target: root.join(rel),
                writable: false,
                squashfs: matches!(shard.encoding, crate::shards::ShardEncoding::Squashfs),
            });
        }
        mounts.push(MountSpec {
            source: self.workspace_root.clone(),
            target: root.join("workspace"),
            writable: true,
            squashfs: false,
        });
        mounts
    }

    /// Serialize a [`SandboxSpec`] for the re-exec'd child and return its path.
    pub fn write_spec(
        &self,
        command: Option<&str>,
        privileged: bool,
    ) -> Result<PathBuf, SandboxError> {
        let spec = SandboxSpec {
            root: self.composed_root(),
            mounts: self.mounts(),
            workdir: PathBuf::from("/workspace/srcdir"),
            env: self.env.clone(),
            privileged,
            command: command.map(|c| c.to_string()),
        };
        let path = self.staging.join("spec.json");
        let json = serde_json::to_string_pretty(&spec)
            .map_err(|e| SandboxError::Setup(format!("serializing sandbox spec: {}", e)))?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

impl Drop for SandboxContext {
    fn drop(&mut self) {
        // Newest mount first: nested targets unmount before their parents.
        for target in self.host_mounts.iter().rev() {
            if let Err(e) = unmount_host(target) {
                warn!(target = %target.display(), error = %e, "failed to unmount");
            } else {
                debug!(target = %target.display(), "unmounted");
            }
        }
        if let Err(e) = fs::remove_dir_all(&self.staging) {
            if self.staging.exists() {
                warn!(staging = %self.staging.display(), error = %e, "failed to remove sandbox staging");
            }
        }
    }
}

#[cfg(unix)]
fn unmount_host(target: &Path) -> std::io::Result<()> {
    // umount2 with MNT_DETACH: lazy unmount so a straggling process cannot
    // wedge teardown.
    nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(not(unix))]
fn unmount_host(_target: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Arch;
    use crate::sandbox::env::compose_environment;
    use crate::shards::ShardEncoding;

    fn context(tmp: &Path) -> (Workspace, SandboxContext) {
        let platform = Platform::linux(Arch::Aarch64);
        let ws = Workspace::create(tmp, "pkg", platform).unwrap();
        let shard = MountableShard {
            path: tmp.join("shard-tree"),
            encoding: ShardEncoding::Archive,
            sandbox_path: PathBuf::from("/opt/aarch64-linux-gnu"),
        };
        let env = compose_environment(platform, 4);
        let ctx = SandboxContext::new(
            platform,
            BackendKind::Namespace,
            tmp.join("rootfs-tree"),
            vec![shard],
            &ws,
            env,
        )
        .unwrap();
        (ws, ctx)
    }

    #[test]
    fn mounts_compose_rootfs_shards_and_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let (_ws, ctx) = context(tmp.path());

        let mounts = ctx.mounts();
        assert_eq!(mounts.len(), 3);
        // Rootfs is the composed root itself.
        assert_eq!(mounts[0].target, ctx.composed_root());
        assert!(!mounts[0].writable);
        // Shard lands under /opt/<triplet>.
        assert!(mounts[1].target.ends_with("opt/aarch64-linux-gnu"));
        assert!(!mounts[1].writable);
        // Workspace is the only writable mount.
        assert!(mounts[2].target.ends_with("workspace"));
        assert!(mounts[2].writable);
    }

    #[test]
    fn spec_file_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let (_ws, ctx) = context(tmp.path());

        let path = ctx.write_spec(Some("make install"), false).unwrap();
        let spec: SandboxSpec =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(spec.command.as_deref(), Some("make install"));
        assert_eq!(spec.workdir, PathBuf::from("/workspace/srcdir"));
        assert!(!spec.privileged);
        assert_eq!(spec.env.get("target").map(String::as_str), Some("aarch64-linux-gnu"));
    }

    #[test]
    fn staging_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let (ws, ctx) = context(tmp.path());
        let staging = ws.sandbox_dir();
        assert!(staging.exists());
        drop(ctx);
        assert!(!staging.exists());
    }
}

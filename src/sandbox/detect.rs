//! Host capability probing and backend resolution.

use std::path::Path;

use super::{BackendKind, SandboxError};
use crate::config::Config;
use crate::platform::{Os, Platform};

/// Detected sandbox capabilities of the current host.
#[derive(Debug, Clone)]
pub struct SandboxCapabilities {
    /// Unprivileged user namespaces usable by this process.
    pub userns: bool,

    /// sudo binary present (privileged backend possible).
    pub sudo: bool,

    /// qemu-system-x86_64 binary present (emulation backend possible).
    pub qemu: bool,

    /// Some crossforge cache directory sits on an ecryptfs mount.
    /// Unprivileged overlay mounts on ecryptfs hit known kernel defects.
    pub ecryptfs_backed: bool,
}

/// Probe the current host.
pub fn detect_capabilities(config: &Config) -> SandboxCapabilities {
    SandboxCapabilities {
        userns: probe_userns(),
        sudo: which("sudo"),
        qemu: which("qemu-system-x86_64"),
        ecryptfs_backed: probe_ecryptfs(config),
    }
}

/// Pick the backend for one target platform.
///
/// Explicit config override wins. macOS targets always use emulation from a
/// non-mac host (the SDK license forbids native execution) and require the
/// license to have been accepted. Otherwise: namespace if the kernel allows
/// unprivileged user namespaces, privileged as fallback, each failure mode
/// reported with a concrete remediation hint.
pub fn resolve_backend(
    config: &Config,
    caps: &SandboxCapabilities,
    platform: Platform,
) -> Result<BackendKind, SandboxError> {
    if platform.os == Os::Macos {
        if !config.sandbox.automatic_apple {
            return Err(SandboxError::MacosLicenseRequired);
        }
        if Platform::host().os != Os::Macos {
            if !caps.qemu {
                return Err(SandboxError::NoBackend(
                    "macOS targets need qemu-system-x86_64 on the host; install qemu".to_string(),
                ));
            }
            return Ok(BackendKind::Emulation);
        }
    }

    if let Some(kind) = config.sandbox.runner {
        return Ok(kind);
    }

    if caps.ecryptfs_backed && !config.sandbox.allow_ecryptfs {
        return Err(SandboxError::KernelDefect {
            problem: "crossforge caches are stored on an ecryptfs filesystem; unprivileged \
                      mounts there trigger known kernel bugs"
                .to_string(),
            hint: "move CROSSFORGE_STORAGE_DIR off the encrypted home directory, or set \
                   CROSSFORGE_ALLOW_ECRYPTFS=1 to proceed anyway"
                .to_string(),
        });
    }

    if caps.userns {
        return Ok(BackendKind::Namespace);
    }
    if caps.sudo {
        return Ok(BackendKind::PrivilegedNamespace);
    }
    if caps.qemu {
        return Ok(BackendKind::Emulation);
    }

    Err(SandboxError::NoBackend(
        "unprivileged user namespaces are disabled (check \
         /proc/sys/kernel/unprivileged_userns_clone), sudo is unavailable and qemu is not \
         installed"
            .to_string(),
    ))
}

/// Unprivileged user namespaces available?
fn probe_userns() -> bool {
    // Debian-style kill switch: 0 disables unprivileged userns entirely.
    // Absent on most kernels, which means allowed.
    if let Ok(v) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
        if v.trim() == "0" {
            return false;
        }
    }
    // Namespace quota of 0 also blocks creation.
    if let Ok(v) = std::fs::read_to_string("/proc/sys/user/max_user_namespaces") {
        if v.trim() == "0" {
            return false;
        }
    }
    cfg!(target_os = "linux")
}

/// Is any cache directory backed by ecryptfs?
fn probe_ecryptfs(config: &Config) -> bool {
    let mounts = match std::fs::read_to_string("/proc/mounts") {
        Ok(m) => m,
        Err(_) => return false,
    };
    let ecryptfs_points: Vec<&str> = mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _dev = fields.next()?;
            let mountpoint = fields.next()?;
            let fstype = fields.next()?;
            (fstype == "ecryptfs").then_some(mountpoint)
        })
        .collect();
    if ecryptfs_points.is_empty() {
        return false;
    }

    [
        &config.paths.storage_dir,
        &config.paths.shards_dir,
        &config.paths.rootfs_dir,
        &config.paths.downloads_cache,
    ]
    .iter()
    .any(|dir| ecryptfs_points.iter().any(|mp| dir.starts_with(mp)))
}

/// Is a binary on PATH?
fn which(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(name)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

//! Sandboxed build-script execution.
//!
//! Uses the argv[0] re-exec pattern: to run a command, the binary re-executes
//! itself with argv[0]="crossforge-sandbox", triggering sandbox setup in a
//! clean, single-threaded child process that unshares namespaces, composes
//! the root view (base rootfs + compiler shards + workspace) with bind
//! mounts, chroots and execs bash.
//!
//! Three interchangeable backends implement the same composition:
//! - user namespaces (default, unprivileged)
//! - privileged namespaces via sudo (opt-in, works around kernel defects in
//!   unprivileged overlay mounts)
//! - full-system qemu emulation (required for macOS targets built from a
//!   non-Apple host; SDK licensing does not permit native execution there)

pub mod child;
pub mod context;
pub mod detect;
pub mod env;
mod privileged;
mod qemu;
mod userns;

pub use child::sandbox_child_main;
pub use context::{MountSpec, RunOutput, SandboxContext, SandboxSpec};
pub use detect::{detect_capabilities, resolve_backend, SandboxCapabilities};
pub use env::compose_environment;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// argv[0] sentinel that routes a re-exec'd process into the sandbox child.
pub const SANDBOX_ARGV0: &str = "crossforge-sandbox";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    #[error("{problem}\nhint: {hint}")]
    KernelDefect { problem: String, hint: String },

    #[error(
        "building for macOS requires accepting the Apple SDK license; \
         set CROSSFORGE_AUTOMATIC_APPLE=1 (or sandbox.automatic_apple in \
         config.toml) to accept it non-interactively"
    )]
    MacosLicenseRequired,

    #[error("no usable sandbox backend: {0}")]
    NoBackend(String),

    #[error("sandboxed command timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which execution backend a sandbox uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Unprivileged user + mount namespaces.
    Namespace,
    /// Same composition, elevated through sudo on every invocation.
    PrivilegedNamespace,
    /// Minimal guest kernel under qemu full-system emulation.
    Emulation,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Namespace => "namespace",
            BackendKind::PrivilegedNamespace => "privileged-namespace",
            BackendKind::Emulation => "emulation",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "namespace" | "userns" => Ok(BackendKind::Namespace),
            "privileged-namespace" | "privileged" => Ok(BackendKind::PrivilegedNamespace),
            "emulation" | "qemu" => Ok(BackendKind::Emulation),
            other => Err(format!(
                "unknown sandbox backend '{}' (expected namespace | privileged-namespace | emulation)",
                other
            )),
        }
    }
}

/// Capability-set interface all backends implement.
///
/// `run` is blocking from the orchestrator's perspective: it resolves when
/// the sandboxed subprocess tree has exited and its mounts are gone.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Execute a shell command inside the composed view. Returns the exit
    /// code and combined stdout/stderr.
    async fn run(&self, ctx: &SandboxContext, command: &str) -> Result<RunOutput, SandboxError>;

    /// Attach a live interactive shell inside the composed view.
    async fn run_interactive(&self, ctx: &SandboxContext) -> Result<i32, SandboxError>;
}

/// Instantiate the backend implementation for a resolved kind.
pub fn backend_for(kind: BackendKind, qemu_dir: PathBuf, timeout_secs: u64) -> Box<dyn SandboxBackend> {
    match kind {
        BackendKind::Namespace => Box::new(userns::NamespaceBackend::new(timeout_secs)),
        BackendKind::PrivilegedNamespace => {
            Box::new(privileged::PrivilegedBackend::new(timeout_secs))
        }
        BackendKind::Emulation => Box::new(qemu::EmulationBackend::new(qemu_dir, timeout_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parse_accepts_canonical_names_and_aliases() {
        assert_eq!("namespace".parse(), Ok(BackendKind::Namespace));
        assert_eq!("userns".parse(), Ok(BackendKind::Namespace));
        assert_eq!(
            "privileged-namespace".parse(),
            Ok(BackendKind::PrivilegedNamespace)
        );
        assert_eq!("emulation".parse(), Ok(BackendKind::Emulation));
        assert_eq!("qemu".parse(), Ok(BackendKind::Emulation));
        assert!("docker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn backend_kind_display_roundtrip() {
        for kind in [
            BackendKind::Namespace,
            BackendKind::PrivilegedNamespace,
            BackendKind::Emulation,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>(), Ok(kind));
        }
    }
}

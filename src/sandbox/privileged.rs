//! Privileged-namespace backend.
//!
//! Identical view composition to the namespace backend, elevated through
//! sudo on every invocation. Exists to work around kernels that block
//! unprivileged user namespaces or unprivileged overlay mounts, and to mount
//! squashfs shard images directly. Explicit opt-in only
//! (CROSSFORGE_RUNNER=privileged-namespace): sudo prompts are disruptive and
//! handing a build root access is not a default anyone should inherit.

use async_trait::async_trait;

use super::context::{RunOutput, SandboxContext};
use super::userns::{reexec_command, run_inherited, run_with_timeout};
use super::{BackendKind, SandboxBackend, SandboxError};

pub(super) struct PrivilegedBackend {
    timeout_secs: u64,
}

impl PrivilegedBackend {
    pub(super) fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait]
impl SandboxBackend for PrivilegedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PrivilegedNamespace
    }

    async fn run(&self, ctx: &SandboxContext, command: &str) -> Result<RunOutput, SandboxError> {
        let spec = ctx.write_spec(Some(command), true)?;
        let mut cmd = reexec_command(&spec, Some("sudo"))?;
        run_with_timeout(&mut cmd, self.timeout_secs).await
    }

    async fn run_interactive(&self, ctx: &SandboxContext) -> Result<i32, SandboxError> {
        let spec = ctx.write_spec(None, true)?;
        let mut cmd = reexec_command(&spec, Some("sudo"))?;
        run_inherited(&mut cmd).await
    }
}

//! Unprivileged user-namespace backend.
//!
//! Default backend: no host privileges needed. Re-execs the crossforge
//! binary as the sandbox child, which unshares user+mount namespaces, maps
//! itself to root, composes the view with bind mounts and execs bash. Every
//! mount lives in the child's namespace, so process exit is teardown.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

use super::context::{RunOutput, SandboxContext};
use super::{BackendKind, SandboxBackend, SandboxError, SANDBOX_ARGV0};

pub(super) struct NamespaceBackend {
    timeout_secs: u64,
}

impl NamespaceBackend {
    pub(super) fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait]
impl SandboxBackend for NamespaceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Namespace
    }

    async fn run(&self, ctx: &SandboxContext, command: &str) -> Result<RunOutput, SandboxError> {
        let spec = ctx.write_spec(Some(command), false)?;
        let mut cmd = reexec_command(&spec, None)?;
        run_with_timeout(&mut cmd, self.timeout_secs).await
    }

    async fn run_interactive(&self, ctx: &SandboxContext) -> Result<i32, SandboxError> {
        let spec = ctx.write_spec(None, false)?;
        let mut cmd = reexec_command(&spec, None)?;
        run_inherited(&mut cmd).await
    }
}

/// Build the re-exec command: current binary, argv[0] sentinel, spec path.
/// `elevate` wraps the invocation in sudo for the privileged backend.
pub(super) fn reexec_command(
    spec: &Path,
    elevate: Option<&str>,
) -> Result<tokio::process::Command, SandboxError> {
    let exe = std::env::current_exe()
        .map_err(|e| SandboxError::Setup(format!("cannot locate own binary: {}", e)))?;

    let mut cmd = match elevate {
        Some(sudo) => {
            // sudo does not forward argv[0]; the child env var carries the
            // dispatch signal instead.
            let mut c = tokio::process::Command::new(sudo);
            c.arg("--preserve-env=_CROSSFORGE_SANDBOX_CHILD")
                .arg(&exe)
                .arg(spec)
                .env("_CROSSFORGE_SANDBOX_CHILD", "1");
            c
        }
        None => {
            let mut c = tokio::process::Command::new(&exe);
            c.arg(spec);
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                c.as_std_mut().arg0(SANDBOX_ARGV0);
            }
            c
        }
    };

    // Own process group, so cancellation can kill the whole subprocess tree.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.as_std_mut().process_group(0);
    }

    Ok(cmd)
}

/// Run to completion with captured output and a hard timeout. On timeout the
/// child's process group is killed; the await below then reaps it, so no
/// mounts or namespaces outlive this call.
pub(super) async fn run_with_timeout(
    cmd: &mut tokio::process::Command,
    timeout_secs: u64,
) -> Result<RunOutput, SandboxError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(SandboxError::Io)?;
    let pid = child.id();

    let output = match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await
    {
        Ok(result) => result.map_err(SandboxError::Io)?,
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            return Err(SandboxError::Timeout(timeout_secs));
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }

    let exit_code = output.status.code().unwrap_or(-1);
    debug!(exit_code, "sandboxed command finished");
    Ok(RunOutput {
        exit_code,
        output: combined,
    })
}

/// Run with inherited stdio (interactive shell).
pub(super) async fn run_inherited(
    cmd: &mut tokio::process::Command,
) -> Result<i32, SandboxError> {
    let status = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(SandboxError::Io)?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

//! Full-system emulation backend.
//!
//! Boots a minimal guest kernel under qemu-system and runs the build inside
//! the guest. Rootfs, shards and workspace are exported to the guest over
//! 9p; the guest init mounts them into the same composed layout the
//! namespace backends produce, runs the command and writes its exit code to
//! `.sandbox/exit_code` in the workspace before powering off.
//!
//! This is the slow path. It exists for targets the host cannot legally or
//! safely build natively — macOS SDK licensing requires builds for Apple
//! platforms to run on Apple-licensed (possibly virtualized) systems — and
//! as a last resort on hosts with no namespace support at all.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

use super::context::{RunOutput, SandboxContext};
use super::{BackendKind, SandboxBackend, SandboxError};

pub(super) struct EmulationBackend {
    qemu_dir: PathBuf,
    timeout_secs: u64,
}

impl EmulationBackend {
    pub(super) fn new(qemu_dir: PathBuf, timeout_secs: u64) -> Self {
        Self {
            qemu_dir,
            timeout_secs,
        }
    }

    fn kernel(&self) -> PathBuf {
        self.qemu_dir.join("vmlinuz")
    }

    fn initrd(&self) -> PathBuf {
        self.qemu_dir.join("initrd.img")
    }

    /// Assemble the qemu invocation for one run.
    fn command(&self, ctx: &SandboxContext, spec_path: &Path) -> Result<tokio::process::Command, SandboxError> {
        for file in [self.kernel(), self.initrd()] {
            if !file.exists() {
                return Err(SandboxError::Setup(format!(
                    "emulation backend needs {} (place the guest kernel and initrd \
                     in the qemu cache directory, see `crossforge paths`)",
                    file.display()
                )));
            }
        }

        let mut cmd = tokio::process::Command::new("qemu-system-x86_64");
        cmd.arg("-kernel")
            .arg(self.kernel())
            .arg("-initrd")
            .arg(self.initrd())
            .arg("-nographic")
            .arg("-no-reboot")
            .arg("-m")
            .arg("2G")
            .arg("-smp")
            .arg(ctx.env().get("nproc").map(String::as_str).unwrap_or("1"));

        // Export the composed pieces to the guest over 9p. The guest init
        // reassembles them from the mount tags.
        for (tag, source) in share_tags(ctx) {
            cmd.arg("-virtfs").arg(format!(
                "local,path={},mount_tag={},security_model=none",
                source.display(),
                tag
            ));
        }

        cmd.arg("-append").arg(format!(
            "console=ttyS0 quiet panic=-1 cf.spec={}",
            guest_spec_path(spec_path)
        ));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.as_std_mut().process_group(0);
        }

        Ok(cmd)
    }
}

/// (mount tag, host path) pairs exported to the guest.
fn share_tags(ctx: &SandboxContext) -> Vec<(String, PathBuf)> {
    ctx.mounts()
        .into_iter()
        .enumerate()
        .map(|(i, m)| (format!("cfshare{}", i), m.source))
        .collect()
}

/// The spec file travels via the workspace share; translate the host path.
fn guest_spec_path(spec: &Path) -> String {
    format!(
        "/workspace/.sandbox/{}",
        spec.file_name().and_then(|n| n.to_str()).unwrap_or("spec.json")
    )
}

#[async_trait]
impl SandboxBackend for EmulationBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Emulation
    }

    async fn run(&self, ctx: &SandboxContext, command: &str) -> Result<RunOutput, SandboxError> {
        let spec_path = ctx.write_spec(Some(command), false)?;
        let exit_file = spec_path
            .parent()
            .map(|p| p.join("exit_code"))
            .ok_or_else(|| SandboxError::Setup("spec path has no parent".to_string()))?;
        // Remove any exit marker from a previous attempt; its absence after
        // qemu exits means the guest never completed the script.
        let _ = std::fs::remove_file(&exit_file);

        let mut cmd = self.command(ctx, &spec_path)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(SandboxError::Io)?;
        let output = match tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(result) => result.map_err(SandboxError::Io)?,
            Err(_) => return Err(SandboxError::Timeout(self.timeout_secs)),
        };

        let console = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(qemu_status = ?output.status, "guest exited");

        // The guest's script exit code, not qemu's, is the result.
        let exit_code = std::fs::read_to_string(&exit_file)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .unwrap_or(-1);

        Ok(RunOutput {
            exit_code,
            output: console,
        })
    }

    async fn run_interactive(&self, ctx: &SandboxContext) -> Result<i32, SandboxError> {
        let spec_path = ctx.write_spec(None, false)?;
        let mut cmd = self.command(ctx, &spec_path)?;
        let status = cmd
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(SandboxError::Io)?;
        Ok(status.code().unwrap_or(-1))
    }
}

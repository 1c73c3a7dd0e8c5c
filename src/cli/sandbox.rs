//! `crossforge sandbox`: backend status and interactive shells.

use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::platform::Platform;
use crate::sandbox::{
    backend_for, compose_environment, detect_capabilities, resolve_backend, SandboxBackend,
    SandboxContext,
};
use crate::shards::{ShardEncoding, ShardManager};
use crate::workspace::Workspace;

#[derive(Args)]
pub struct SandboxArgs {
    #[command(subcommand)]
    pub command: SandboxCommands,
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Show detected capabilities and the backend each target would use
    Status,

    /// Open an interactive shell in the build environment for one target
    Shell {
        /// Target triplet
        #[arg(value_name = "TRIPLET")]
        triplet: String,
    },
}

pub async fn run(args: SandboxArgs) -> Result<()> {
    match args.command {
        SandboxCommands::Status => run_status(),
        SandboxCommands::Shell { triplet } => run_shell(&triplet).await,
    }
}

fn run_status() -> Result<()> {
    let config = Config::load()?;
    let caps = detect_capabilities(&config);

    println!("Host capabilities:");
    println!("  user namespaces:  {}", yes_no(caps.userns));
    println!("  sudo:             {}", yes_no(caps.sudo));
    println!("  qemu:             {}", yes_no(caps.qemu));
    println!("  ecryptfs caches:  {}", yes_no(caps.ecryptfs_backed));
    println!();

    println!("Backend per target:");
    for platform in Platform::supported() {
        let backend = match resolve_backend(&config, &caps, platform) {
            Ok(kind) => kind.to_string(),
            Err(e) => format!("unavailable ({})", first_line(&e.to_string())),
        };
        println!("  {:32} {}", platform.triplet(), backend);
    }
    Ok(())
}

async fn run_shell(triplet: &str) -> Result<()> {
    let mut config = Config::load()?;
    config.paths.ensure_dirs()?;
    let platform = Platform::parse(triplet).map_err(|e| anyhow!(e))?;

    let caps = detect_capabilities(&config);
    let backend_kind = resolve_backend(&config, &caps, platform)?;

    let manager = ShardManager::with_default_index(&config).await?;
    let encoding = ShardEncoding::Archive;
    let rootfs = manager.ensure_rootfs(encoding).await?;
    let shard = manager.ensure(platform, encoding).await?;

    let workspace = Workspace::create(&config.paths.workspaces_dir(), "shell", platform)?;
    let env = compose_environment(platform, config.build.nproc);
    let ctx = SandboxContext::new(platform, backend_kind, rootfs, vec![shard], &workspace, env)?;

    let backend = backend_for(
        backend_kind,
        config.paths.qemu_dir.clone(),
        config.sandbox.command_timeout_secs,
    );
    println!(
        "entering {} build environment via {} (exit the shell to leave)",
        platform.triplet(),
        backend_kind
    );
    let code = backend.run_interactive(&ctx).await?;
    if code != 0 {
        return Err(anyhow!("sandbox shell exited with {}", code));
    }
    Ok(())
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}

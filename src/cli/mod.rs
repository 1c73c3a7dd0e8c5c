pub mod audit;
pub mod build;
pub mod paths;
pub mod sandbox;
pub mod shards;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crossforge")]
#[command(author, version, about = "Sandboxed cross-compilation of binary packages")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a recipe for one or more target platforms
    Build(build::BuildArgs),

    /// Audit an existing install prefix for portability defects
    Audit(audit::AuditArgs),

    /// Manage cached compiler shards and the base rootfs
    Shards(shards::ShardsArgs),

    /// Inspect the sandbox or open a shell inside it
    Sandbox(sandbox::SandboxArgs),

    /// Show resolved cache and state directory paths
    Paths,
}

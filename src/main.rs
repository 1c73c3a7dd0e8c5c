use anyhow::Result;
use clap::Parser;

use crossforge::cli::{self, Cli, Commands};

fn main() -> Result<()> {
    // argv[0] dispatch: if re-exec'd as "crossforge-sandbox", enter the
    // sandbox child path immediately — before Tokio, Clap, or any other
    // initialization. unshare(CLONE_NEWUSER) requires a single-threaded
    // process, so no runtime may start first. sudo does not forward argv[0],
    // so the privileged backend signals through an env var instead.
    #[cfg(unix)]
    {
        let arg0_is_sandbox = std::env::args_os()
            .next()
            .map(|a| a.to_string_lossy().ends_with(crossforge::sandbox::SANDBOX_ARGV0))
            .unwrap_or(false);
        if arg0_is_sandbox || std::env::var_os("_CROSSFORGE_SANDBOX_CHILD").is_some() {
            crossforge::sandbox::sandbox_child_main();
        }
    }

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Build(args) => cli::build::run(args).await,
        Commands::Audit(args) => cli::audit::run(args).await,
        Commands::Shards(args) => cli::shards::run(args).await,
        Commands::Sandbox(args) => cli::sandbox::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}

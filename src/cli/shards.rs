//! `crossforge shards`: cache management for compiler shards and the rootfs.

use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::platform::Platform;
use crate::shards::{ShardEncoding, ShardManager};

#[derive(Args)]
pub struct ShardsArgs {
    #[command(subcommand)]
    pub command: ShardsCommands,
}

#[derive(Subcommand)]
pub enum ShardsCommands {
    /// List cached shard entries
    List,

    /// Download and verify shards ahead of a build
    Fetch {
        /// Triplets to fetch (default: every platform in the index)
        #[arg(value_name = "TRIPLET")]
        triplets: Vec<String>,

        /// Also fetch the base rootfs
        #[arg(long)]
        rootfs: bool,
    },

    /// Remove every cached shard and rootfs entry
    Clean,
}

pub async fn run(args: ShardsArgs) -> Result<()> {
    let mut config = Config::load()?;
    config.paths.ensure_dirs()?;

    match args.command {
        ShardsCommands::List => {
            let manager = ShardManager::with_default_index(&config).await?;
            let entries = manager.cached_entries()?;
            if entries.is_empty() {
                println!("no cached shards");
            }
            for entry in entries {
                println!("{}", entry.display());
            }
            Ok(())
        }
        ShardsCommands::Fetch { triplets, rootfs } => {
            let manager = ShardManager::with_default_index(&config).await?;
            let encoding = if config.shards.use_squashfs {
                ShardEncoding::Squashfs
            } else {
                ShardEncoding::Archive
            };

            if rootfs {
                let path = manager.ensure_rootfs(encoding).await?;
                println!("rootfs: {}", path.display());
            }

            let triplets: Vec<String> = if triplets.is_empty() {
                manager
                    .index()
                    .triplets()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            } else {
                triplets
            };
            for triplet in triplets {
                let platform = Platform::parse(&triplet).map_err(|e| anyhow!(e))?;
                let shard = manager.ensure(platform, encoding).await?;
                println!("{}: {}", triplet, shard.path.display());
            }
            Ok(())
        }
        ShardsCommands::Clean => {
            // No index fetch for clean: it must work offline.
            let manager = ShardManager::new(&config, crate::shards::ShardIndex::empty());
            manager.clean()?;
            println!("shard caches cleared");
            Ok(())
        }
    }
}

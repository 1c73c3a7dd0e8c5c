//! `crossforge paths`: print the resolved directory layout.

use anyhow::Result;

use crate::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    println!("config:     {}", paths.config_dir.display());
    println!("storage:    {}", paths.storage_dir.display());
    println!("downloads:  {}", paths.downloads_cache.display());
    println!("rootfs:     {}", paths.rootfs_dir.display());
    println!("shards:     {}", paths.shards_dir.display());
    println!("qemu:       {}", paths.qemu_dir.display());
    println!("state:      {}", paths.state_dir.display());
    println!("workspaces: {}", paths.workspaces_dir().display());
    println!("products:   {}", paths.products_dir().display());

    Ok(())
}

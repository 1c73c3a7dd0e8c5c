//! crossforge: sandboxed cross-compilation of binary packages.
//!
//! The pipeline: a recipe names sources, a build script, products and target
//! platforms. For each platform the orchestrator provisions a hash-verified
//! compiler shard and base rootfs, composes them with a fresh workspace into
//! an isolated sandbox, runs the script, audits the resulting prefix for
//! portability defects and packages accepted prefixes into tarballs plus an
//! install manifest.

pub mod audit;
pub mod cli;
pub mod config;
pub mod manifest;
pub mod orchestrator;
pub mod paths;
pub mod platform;
pub mod products;
pub mod sandbox;
pub mod shards;
pub mod workspace;

//! The shard index: a mapping from (platform triplet, encoding) to a
//! download URL and content hash, published by the shard mirror as a single
//! JSON document. The index is fetched once and cached next to the shards;
//! `shards fetch --refresh` re-downloads it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

use super::ShardEncoding;
use crate::config::Config;

/// Reserved index key for the shared base rootfs.
const ROOTFS_KEY: &str = "rootfs";

/// One downloadable artifact: where it lives and what it must hash to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSource {
    pub url: String,
    pub sha256: String,
    #[serde(default = "default_encoding")]
    pub encoding: ShardEncoding,
}

fn default_encoding() -> ShardEncoding {
    ShardEncoding::Archive
}

impl ShardSource {
    /// Cache entry name: last URL path segment qualified by a hash prefix,
    /// so an upstream re-release lands in a fresh entry rather than
    /// invalidating a verified one.
    pub fn cache_name(&self) -> String {
        let base = self
            .url
            .rsplit('/')
            .next()
            .unwrap_or("artifact")
            .to_string();
        let short = &self.sha256[..self.sha256.len().min(8)];
        match self.encoding {
            ShardEncoding::Squashfs => format!("{}.{}", short, base),
            // Archives are extracted; name the resulting tree, not the tarball.
            ShardEncoding::Archive => {
                let stem = base
                    .trim_end_matches(".tar.gz")
                    .trim_end_matches(".tgz")
                    .to_string();
                format!("{}.{}", short, stem)
            }
        }
    }
}

/// Parsed index document. Keys are platform triplets plus the reserved
/// `rootfs` entry; each key lists one source per encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardIndex {
    #[serde(flatten)]
    entries: BTreeMap<String, Vec<ShardSource>>,
}

impl ShardIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build an index from in-memory entries (tests, local mirrors).
    pub fn from_entries(entries: BTreeMap<String, Vec<ShardSource>>) -> Self {
        Self { entries }
    }

    /// Load the index: disk cache first, then the configured mirror.
    pub async fn load(config: &Config) -> Result<Self> {
        let cache_file = config.paths.shard_index_file();
        if cache_file.exists() {
            let content = fs::read_to_string(&cache_file)
                .with_context(|| format!("Failed to read {}", cache_file.display()))?;
            return serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", cache_file.display()));
        }
        Self::refresh(config).await
    }

    /// Fetch the index from the mirror and overwrite the disk cache.
    pub async fn refresh(config: &Config) -> Result<Self> {
        let url = format!("{}/index.json", config.shards.mirror_url.trim_end_matches('/'));
        let body = reqwest::get(&url)
            .await
            .with_context(|| format!("Failed to fetch shard index from {}", url))?
            .error_for_status()
            .with_context(|| format!("Shard index request to {} rejected", url))?
            .text()
            .await?;
        let index: ShardIndex =
            serde_json::from_str(&body).with_context(|| format!("Malformed shard index at {}", url))?;

        if let Some(parent) = config.paths.shard_index_file().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(config.paths.shard_index_file(), &body)?;
        Ok(index)
    }

    /// Look up the shard for a platform triplet in the given encoding.
    pub fn shard(&self, triplet: &str, encoding: ShardEncoding) -> Option<ShardSource> {
        self.entries
            .get(triplet)?
            .iter()
            .find(|s| s.encoding == encoding)
            .cloned()
    }

    /// Look up the base rootfs in the given encoding.
    pub fn rootfs(&self, encoding: ShardEncoding) -> Option<ShardSource> {
        self.shard(ROOTFS_KEY, encoding)
    }

    /// Triplets the index knows about (excluding the rootfs entry).
    pub fn triplets(&self) -> Vec<&str> {
        self.entries
            .keys()
            .filter(|k| k.as_str() != ROOTFS_KEY)
            .map(|k| k.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> ShardIndex {
        let mut entries = BTreeMap::new();
        entries.insert(
            "x86_64-linux-gnu".to_string(),
            vec![
                ShardSource {
                    url: "https://mirror/shards/x86_64-linux-gnu.tar.gz".into(),
                    sha256: "aabbccdd00112233".into(),
                    encoding: ShardEncoding::Archive,
                },
                ShardSource {
                    url: "https://mirror/shards/x86_64-linux-gnu.squashfs".into(),
                    sha256: "ffeeddcc99887766".into(),
                    encoding: ShardEncoding::Squashfs,
                },
            ],
        );
        entries.insert(
            "rootfs".to_string(),
            vec![ShardSource {
                url: "https://mirror/rootfs.tar.gz".into(),
                sha256: "0123456789abcdef".into(),
                encoding: ShardEncoding::Archive,
            }],
        );
        ShardIndex::from_entries(entries)
    }

    #[test]
    fn lookup_by_triplet_and_encoding() {
        let index = sample_index();
        let archive = index
            .shard("x86_64-linux-gnu", ShardEncoding::Archive)
            .unwrap();
        assert!(archive.url.ends_with(".tar.gz"));
        let squashfs = index
            .shard("x86_64-linux-gnu", ShardEncoding::Squashfs)
            .unwrap();
        assert!(squashfs.url.ends_with(".squashfs"));
        assert!(index.shard("aarch64-linux-gnu", ShardEncoding::Archive).is_none());
    }

    #[test]
    fn rootfs_uses_reserved_key() {
        let index = sample_index();
        assert!(index.rootfs(ShardEncoding::Archive).is_some());
        assert!(index.rootfs(ShardEncoding::Squashfs).is_none());
        assert_eq!(index.triplets(), vec!["x86_64-linux-gnu"]);
    }

    #[test]
    fn cache_names_embed_hash_and_strip_archive_suffix() {
        let index = sample_index();
        let archive = index
            .shard("x86_64-linux-gnu", ShardEncoding::Archive)
            .unwrap();
        assert_eq!(archive.cache_name(), "aabbccdd.x86_64-linux-gnu");
        let squashfs = index
            .shard("x86_64-linux-gnu", ShardEncoding::Squashfs)
            .unwrap();
        assert_eq!(squashfs.cache_name(), "ffeeddcc.x86_64-linux-gnu.squashfs");
    }

    #[test]
    fn index_json_roundtrip() {
        let index = sample_index();
        let json = serde_json::to_string(&index).unwrap();
        let parsed: ShardIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.triplets(), index.triplets());
    }
}

//! Verified artifact downloads.
//!
//! Artifacts stream into a `.part` file in the download cache while a
//! SHA-256 digest is computed; only after the digest matches is the file
//! renamed into place. The rename is the publish point: a concurrent reader
//! either sees nothing or a fully verified artifact, never a partial one.
//!
//! Transient network failures are retried a bounded number of times with
//! doubling backoff. A hash mismatch is never retried: the mirror is serving
//! the wrong bytes and re-fetching them would only waste bandwidth.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::ShardError;

/// Download `url` into the cache directory, verifying its SHA-256.
///
/// Returns the cached path. If a previously verified copy exists it is
/// reused without touching the network (cache idempotence).
pub async fn fetch_verified(
    url: &str,
    sha256: &str,
    cache_dir: &Path,
    attempts: u32,
    backoff_secs: u64,
) -> Result<PathBuf, ShardError> {
    fs::create_dir_all(cache_dir)?;
    let final_path = cache_dir.join(cache_file_name(url, sha256));
    if final_path.exists() {
        debug!(path = %final_path.display(), "download cache hit");
        return Ok(final_path);
    }

    let mut backoff = Duration::from_secs(backoff_secs);
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=attempts.max(1) {
        match fetch_once(url, sha256, &final_path).await {
            Ok(()) => return Ok(final_path),
            // Wrong bytes from the mirror; retrying cannot help.
            Err(e @ ShardError::HashMismatch { .. }) => return Err(e),
            Err(ShardError::Download { source, .. }) => {
                warn!(url, attempt, error = %source, "download attempt failed");
                last_err = Some(source);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(ShardError::Download {
        url: url.to_string(),
        source: last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")),
    })
}

async fn fetch_once(url: &str, sha256: &str, final_path: &Path) -> Result<(), ShardError> {
    let download_err = |source: anyhow::Error| ShardError::Download {
        url: url.to_string(),
        source,
    };

    let response = reqwest::get(url)
        .await
        .map_err(|e| download_err(e.into()))?
        .error_for_status()
        .map_err(|e| download_err(e.into()))?;

    let part_path = final_path.with_extension("part");
    let mut file = fs::File::create(&part_path)?;
    let mut hasher = Sha256::new();

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| download_err(e.into()))?;
        hasher.update(&chunk);
        file.write_all(&chunk)?;
    }
    file.sync_all()?;
    drop(file);

    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(sha256) {
        fs::remove_file(&part_path).ok();
        return Err(ShardError::HashMismatch {
            url: url.to_string(),
            expected: sha256.to_string(),
            actual,
        });
    }

    // Publish point: rename is atomic within the cache filesystem.
    fs::rename(&part_path, final_path)?;
    Ok(())
}

/// Hex SHA-256 of a file on disk.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Cache file name: hash prefix + last URL segment.
fn cache_file_name(url: &str, sha256: &str) -> String {
    let base = url.rsplit('/').next().unwrap_or("artifact");
    let short = &sha256[..sha256.len().min(8)];
    format!("{}-{}", short, base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_file_matches_known_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, b"abc").unwrap();
        // Well-known SHA-256 of "abc".
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn cache_names_are_stable_and_distinct() {
        let a = cache_file_name("https://m/shards/foo.tar.gz", "aabbccddeeff");
        let b = cache_file_name("https://m/shards/foo.tar.gz", "112233445566");
        assert_eq!(a, "aabbccdd-foo.tar.gz");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn cache_hit_skips_network() {
        // A pre-existing verified file must be returned without any fetch;
        // the bogus URL would fail immediately otherwise.
        let tmp = tempfile::tempdir().unwrap();
        let name = cache_file_name("http://invalid.invalid/foo.tar.gz", "deadbeef");
        fs::write(tmp.path().join(&name), b"cached").unwrap();

        let path = fetch_verified(
            "http://invalid.invalid/foo.tar.gz",
            "deadbeef",
            tmp.path(),
            1,
            0,
        )
        .await
        .unwrap();
        assert_eq!(fs::read(path).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn unreachable_host_reports_download_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = fetch_verified("http://invalid.invalid/foo", "00", tmp.path(), 2, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Download { .. }));
        // No partial file may be left behind.
        assert!(!tmp.path().join("00-foo.part").exists());
    }
}

//! Multi-platform build orchestration.
//!
//! Drives one build request across its requested platforms: provision shards,
//! stage sources and dependencies, run the script in a sandbox, audit the
//! result, package accepted prefixes and emit an install manifest.
//!
//! Platforms run in a deterministic preferred order. The first-ranked
//! platform builds alone as a validation pass; with fail-fast enabled (the
//! default), a validation failure skips the rest, since a broken script fails
//! everywhere and twelve identical failure logs help nobody. Remaining
//! platforms then build concurrently under a semaphore.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::audit;
use crate::config::Config;
use crate::manifest::{ArtifactRef, InstallManifest};
use crate::platform::{preferred_order, Platform};
use crate::products::{Dependency, Product};
use crate::sandbox::{
    backend_for, compose_environment, detect_capabilities, resolve_backend, SandboxBackend,
    SandboxContext,
};
use crate::shards::{fetch_verified, sha256_file, ShardEncoding, ShardError, ShardManager};
use crate::workspace::Workspace;

/// One source archive (or plain file) to stage into the build's `srcdir`.
#[derive(Debug, Clone)]
pub struct BuildSource {
    pub url: String,
    pub sha256: String,
}

/// Everything needed to build one package across a set of platforms.
pub struct BuildRequest {
    pub name: String,
    pub version: String,
    /// Bash script run inside the sandbox with cwd `/workspace/srcdir`.
    pub script: String,
    pub platforms: Vec<Platform>,
    pub sources: Vec<BuildSource>,
    pub products: Vec<Product>,
    pub dependencies: Vec<Dependency>,
}

/// Terminal state of one platform's build.
#[derive(Debug)]
pub enum BuildOutcome {
    /// Script succeeded, audit passed, products present, tarball packaged.
    Success { tarball: PathBuf, sha256: String },
    /// The build script exited nonzero.
    ScriptFailure { exit_code: i32, log: PathBuf },
    /// The audit found unfixable defects and is configured as fatal.
    AuditRejected { outstanding: usize },
    /// Declared products missing from the prefix.
    ProductsUnsatisfied { missing: Vec<String> },
    /// Not attempted: an earlier validation build failed under fail-fast.
    Skipped,
    /// Provisioning, sandbox or packaging machinery failed.
    SetupError(String),
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Success { .. })
    }
}

/// Per-platform outcomes plus the manifest for the successful subset.
#[derive(Debug)]
pub struct BuildSummary {
    pub outcomes: BTreeMap<Platform, BuildOutcome>,
    /// Present when at least one platform succeeded.
    pub manifest: Option<InstallManifest>,
    pub manifest_path: Option<PathBuf>,
}

impl BuildSummary {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(BuildOutcome::is_success)
    }

    pub fn successes(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }
}

pub struct Orchestrator {
    config: Config,
    shards: Arc<ShardManager>,
}

impl Orchestrator {
    pub fn new(config: Config, shards: ShardManager) -> Self {
        Self {
            config,
            shards: Arc::new(shards),
        }
    }

    /// Run the whole request. Individual platform failures land in the
    /// summary; only request-level problems (no platforms, manifest write
    /// failure) are errors.
    pub async fn build(&self, request: &BuildRequest) -> Result<BuildSummary> {
        if request.platforms.is_empty() {
            return Err(anyhow!("build request names no platforms"));
        }
        let supported = Platform::supported();
        for p in &request.platforms {
            if !supported.contains(p) {
                return Err(anyhow!("platform {} is not supported", p.triplet()));
            }
        }

        let order = preferred_order(&request.platforms);
        let Some((validation, rest)) = order.split_first() else {
            return Err(anyhow!("build request names no platforms"));
        };

        info!(
            package = %request.name,
            version = %request.version,
            platforms = order.len(),
            validation = %validation.triplet(),
            "starting build"
        );

        let mut outcomes = BTreeMap::new();

        let first = self.build_platform(request, *validation).await;
        let first_ok = first.is_success();
        outcomes.insert(*validation, first);

        if !first_ok && self.config.build.fail_fast && !rest.is_empty() {
            warn!(
                validation = %validation.triplet(),
                skipped = rest.len(),
                "validation build failed, skipping remaining platforms"
            );
            for p in rest {
                outcomes.insert(*p, BuildOutcome::Skipped);
            }
        } else if !rest.is_empty() {
            let semaphore = Arc::new(Semaphore::new(self.config.build.parallelism.max(1)));
            let runs = rest.iter().map(|p| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    (*p, self.build_platform(request, *p).await)
                }
            });
            for (platform, outcome) in futures::future::join_all(runs).await {
                outcomes.insert(platform, outcome);
            }
        }

        let summary = self.summarize(request, outcomes)?;
        info!(
            package = %request.name,
            succeeded = summary.successes(),
            total = summary.outcomes.len(),
            "build finished"
        );
        Ok(summary)
    }

    fn summarize(
        &self,
        request: &BuildRequest,
        outcomes: BTreeMap<Platform, BuildOutcome>,
    ) -> Result<BuildSummary> {
        let mut manifest = InstallManifest::new(&request.name, &request.version);
        for (platform, outcome) in &outcomes {
            if let BuildOutcome::Success { tarball, sha256 } = outcome {
                let file_name = tarball
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                manifest.insert(
                    *platform,
                    ArtifactRef {
                        url: format!(
                            "{}/products/{}",
                            self.config.shards.mirror_url.trim_end_matches('/'),
                            file_name
                        ),
                        sha256: sha256.clone(),
                    },
                );
            }
        }

        let (manifest, manifest_path) = if manifest.artifacts.is_empty() {
            (None, None)
        } else {
            let path = self
                .config
                .products_dir()
                .join(format!("{}.v{}.json", request.name, request.version));
            manifest.save(&path).context("writing install manifest")?;
            (Some(manifest), Some(path))
        };

        Ok(BuildSummary {
            outcomes,
            manifest,
            manifest_path,
        })
    }

    /// Build, audit and package one platform. Never panics the whole run:
    /// every failure mode maps to an outcome.
    async fn build_platform(&self, request: &BuildRequest, platform: Platform) -> BuildOutcome {
        match self.try_build_platform(request, platform).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(platform = %platform.triplet(), error = %e, "build setup failed");
                BuildOutcome::SetupError(format!("{:#}", e))
            }
        }
    }

    async fn try_build_platform(
        &self,
        request: &BuildRequest,
        platform: Platform,
    ) -> Result<BuildOutcome> {
        let caps = detect_capabilities(&self.config);
        let backend_kind = resolve_backend(&self.config, &caps, platform)?;

        // Squashfs only pays off when the backend can loop-mount it.
        let encoding = if self.config.shards.use_squashfs
            && backend_kind == crate::sandbox::BackendKind::PrivilegedNamespace
        {
            ShardEncoding::Squashfs
        } else {
            ShardEncoding::Archive
        };

        let rootfs = self.shards.ensure_rootfs(encoding).await?;
        let shard = self.shards.ensure(platform, encoding).await?;

        let workspaces = self.config.paths.workspaces_dir();
        let mut workspace = Workspace::create(&workspaces, &request.name, platform)?;

        self.stage_sources(&request.sources, &workspace.srcdir())
            .await?;
        for dep in &request.dependencies {
            dep.install(
                &workspace.destdir(),
                platform,
                &self.config.paths.downloads_cache,
                self.config.shards.download_attempts,
                self.config.shards.retry_backoff_secs,
                false,
            )
            .await?;
        }

        let env = compose_environment(platform, self.config.build.nproc);
        let ctx = SandboxContext::new(
            platform,
            backend_kind,
            rootfs,
            vec![shard],
            &workspace,
            env,
        )?;
        let backend = backend_for(
            backend_kind,
            self.config.paths.qemu_dir.clone(),
            self.config.sandbox.command_timeout_secs,
        );

        info!(platform = %platform.triplet(), backend = %backend_kind, "running build script");
        let run = backend.run(&ctx, &request.script).await?;
        drop(ctx);

        let log = workspace.logs_dir().join("build.log");
        std::fs::write(&log, &run.output).context("writing build log")?;

        if !run.success() {
            if self.config.build.keep_failed_workspaces {
                workspace.keep();
            }
            return Ok(BuildOutcome::ScriptFailure {
                exit_code: run.exit_code,
                log,
            });
        }

        let prefix = workspace.destdir();

        // Dependencies out before the audit: their binaries are not ours to
        // inspect, and they must not end up in the tarball.
        for dep in &request.dependencies {
            dep.uninstall(&prefix)?;
        }

        let report = audit::audit_prefix(&prefix, platform, &self.config.audit)?;
        if !report.passed(self.config.audit.fatal) {
            if self.config.build.keep_failed_workspaces {
                workspace.keep();
            }
            let outstanding = report.findings.iter().filter(|f| f.outstanding()).count();
            return Ok(BuildOutcome::AuditRejected { outstanding });
        }

        let missing: Vec<String> = audit::check_products(&request.products, &prefix, platform)
            .into_iter()
            .map(|f| f.message)
            .collect();
        if !missing.is_empty() {
            if self.config.build.keep_failed_workspaces {
                workspace.keep();
            }
            return Ok(BuildOutcome::ProductsUnsatisfied { missing });
        }

        let (tarball, sha256) = self.package(request, platform, &prefix).await?;
        info!(platform = %platform.triplet(), tarball = %tarball.display(), "packaged");
        Ok(BuildOutcome::Success { tarball, sha256 })
    }

    /// Fetch every source and stage it into `srcdir`: archives unpacked,
    /// plain files copied in.
    async fn stage_sources(&self, sources: &[BuildSource], srcdir: &Path) -> Result<()> {
        for source in sources {
            let fetched = fetch_verified(
                &source.url,
                &source.sha256,
                &self.config.paths.downloads_cache,
                self.config.shards.download_attempts,
                self.config.shards.retry_backoff_secs,
            )
            .await?;

            if is_tarball(&source.url) {
                unpack_into(&fetched, srcdir).await?;
            } else {
                let name = Path::new(&source.url)
                    .file_name()
                    .ok_or_else(|| anyhow!("source url {} has no file name", source.url))?;
                std::fs::copy(&fetched, srcdir.join(name))?;
            }
        }
        Ok(())
    }

    /// Pack the accepted prefix into the canonical product tarball.
    async fn package(
        &self,
        request: &BuildRequest,
        platform: Platform,
        prefix: &Path,
    ) -> Result<(PathBuf, String)> {
        let products_dir = self.config.products_dir();
        std::fs::create_dir_all(&products_dir)?;
        let tarball = products_dir.join(format!(
            "{}.v{}.{}.tar.gz",
            request.name,
            request.version,
            platform.triplet()
        ));

        let staging = tarball.with_extension("part");
        let status = tokio::process::Command::new("tar")
            .arg("-czf")
            .arg(&staging)
            .arg("-C")
            .arg(prefix)
            .arg(".")
            .status()
            .await
            .context("spawning tar")?;
        if !status.success() {
            std::fs::remove_file(&staging).ok();
            return Err(anyhow!("tar exited with {} packaging {}", status, request.name));
        }
        std::fs::rename(&staging, &tarball)?;

        let sha256 = sha256_file(&tarball)?;
        Ok((tarball, sha256))
    }
}

fn is_tarball(url: &str) -> bool {
    url.ends_with(".tar.gz") || url.ends_with(".tgz")
}

/// Unpack a tarball directly into an existing directory (sources merge into
/// `srcdir`; unlike shard extraction there is no atomicity requirement, the
/// workspace is private to this attempt).
async fn unpack_into(archive: &Path, dest: &Path) -> Result<(), ShardError> {
    std::fs::create_dir_all(dest)?;
    let status = tokio::process::Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .status()
        .await
        .map_err(|e| ShardError::Other(anyhow!("failed to spawn tar: {}", e)))?;
    if !status.success() {
        return Err(ShardError::Other(anyhow!(
            "tar exited with {} extracting {}",
            status,
            archive.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Arch;

    fn request(platforms: Vec<Platform>) -> BuildRequest {
        BuildRequest {
            name: "zlib".into(),
            version: "1.3.1".into(),
            script: "make install".into(),
            platforms,
            sources: vec![],
            products: vec![Product::library("z")],
            dependencies: vec![],
        }
    }

    #[test]
    fn empty_platform_list_is_rejected() {
        let config = Config::default();
        let orch = Orchestrator::new(config, ShardManager::new(&Config::default(), crate::shards::ShardIndex::empty()));
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt.block_on(orch.build(&request(vec![]))).unwrap_err();
        assert!(err.to_string().contains("no platforms"));
    }

    #[test]
    fn unsupported_platform_is_rejected_up_front() {
        // Construct a platform outside the supported set.
        let bogus = Platform::new(
            crate::platform::Os::Windows,
            Arch::Ppc64le,
            crate::platform::Libc::None,
            crate::platform::Abi::None,
        );
        let config = Config::default();
        let orch = Orchestrator::new(config, ShardManager::new(&Config::default(), crate::shards::ShardIndex::empty()));
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt.block_on(orch.build(&request(vec![bogus]))).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn tarball_detection() {
        assert!(is_tarball("https://x.invalid/zlib-1.3.1.tar.gz"));
        assert!(is_tarball("https://x.invalid/zlib.tgz"));
        assert!(!is_tarball("https://x.invalid/patch-1.diff"));
    }

    #[test]
    fn summary_counts_successes() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            Platform::linux(Arch::X86_64),
            BuildOutcome::Success {
                tarball: PathBuf::from("a.tar.gz"),
                sha256: "aa".repeat(32),
            },
        );
        outcomes.insert(Platform::linux(Arch::Aarch64), BuildOutcome::Skipped);
        let summary = BuildSummary {
            outcomes,
            manifest: None,
            manifest_path: None,
        };
        assert_eq!(summary.successes(), 1);
        assert!(!summary.all_succeeded());
    }
}

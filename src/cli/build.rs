//! `crossforge build`: drive a recipe through the orchestrator.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::manifest::InstallManifest;
use crate::orchestrator::{BuildOutcome, BuildRequest, BuildSource, Orchestrator};
use crate::platform::Platform;
use crate::products::{Dependency, Product};
use crate::shards::ShardManager;

#[derive(Args)]
pub struct BuildArgs {
    /// Recipe file (TOML)
    pub recipe: PathBuf,

    /// Restrict the build to these triplets (default: the recipe's list)
    #[arg(long = "platform", value_name = "TRIPLET")]
    pub platforms: Vec<String>,

    /// Continue with remaining platforms even if the validation build fails
    #[arg(long)]
    pub no_fail_fast: bool,
}

/// On-disk recipe format.
#[derive(Deserialize)]
struct Recipe {
    name: String,
    version: String,

    /// Inline build script, exclusive with `script_file`.
    script: Option<String>,
    /// Path to the build script, relative to the recipe file.
    script_file: Option<PathBuf>,

    /// Target triplets. Empty means every supported platform.
    #[serde(default)]
    platforms: Vec<String>,

    #[serde(default)]
    sources: Vec<RecipeSource>,

    #[serde(default)]
    products: Vec<RecipeProduct>,

    /// Paths to install manifests of dependency packages.
    #[serde(default)]
    dependencies: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct RecipeSource {
    url: String,
    sha256: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RecipeProduct {
    Library { name: String },
    Executable { name: String },
    File { path: String },
}

pub async fn run(args: BuildArgs) -> Result<()> {
    let mut config = Config::load()?;
    config.paths.ensure_dirs()?;
    if args.no_fail_fast {
        config.build.fail_fast = false;
    }

    let request = load_request(&args)?;

    let shards = ShardManager::with_default_index(&config).await?;
    let orchestrator = Orchestrator::new(config, shards);
    let summary = orchestrator.build(&request).await?;

    for (platform, outcome) in &summary.outcomes {
        let status = match outcome {
            BuildOutcome::Success { tarball, .. } => format!("ok ({})", tarball.display()),
            BuildOutcome::ScriptFailure { exit_code, log } => {
                format!("script failed with exit {} (log: {})", exit_code, log.display())
            }
            BuildOutcome::AuditRejected { outstanding } => {
                format!("rejected by audit ({} outstanding findings)", outstanding)
            }
            BuildOutcome::ProductsUnsatisfied { missing } => {
                format!("missing products: {}", missing.join("; "))
            }
            BuildOutcome::Skipped => "skipped".to_string(),
            BuildOutcome::SetupError(msg) => format!("setup error: {}", msg),
        };
        println!("  {:32} {}", platform.triplet(), status);
    }

    if let Some(path) = &summary.manifest_path {
        println!("manifest: {}", path.display());
    }

    if summary.all_succeeded() {
        Ok(())
    } else {
        Err(anyhow!(
            "{}/{} platforms failed",
            summary.outcomes.len() - summary.successes(),
            summary.outcomes.len()
        ))
    }
}

fn load_request(args: &BuildArgs) -> Result<BuildRequest> {
    let text = std::fs::read_to_string(&args.recipe)
        .with_context(|| format!("reading recipe {}", args.recipe.display()))?;
    let recipe: Recipe = toml::from_str(&text)
        .with_context(|| format!("parsing recipe {}", args.recipe.display()))?;
    let recipe_dir = args.recipe.parent().unwrap_or_else(|| Path::new("."));

    let script = match (&recipe.script, &recipe.script_file) {
        (Some(s), None) => s.clone(),
        (None, Some(file)) => {
            let path = recipe_dir.join(file);
            std::fs::read_to_string(&path)
                .with_context(|| format!("reading build script {}", path.display()))?
        }
        (Some(_), Some(_)) => {
            return Err(anyhow!("recipe sets both script and script_file"));
        }
        (None, None) => return Err(anyhow!("recipe has no build script")),
    };

    let triplets = if !args.platforms.is_empty() {
        args.platforms.clone()
    } else {
        recipe.platforms.clone()
    };
    let platforms = if triplets.is_empty() {
        Platform::supported()
    } else {
        triplets
            .iter()
            .map(|t| Platform::parse(t).map_err(|e| anyhow!(e)))
            .collect::<Result<Vec<_>>>()?
    };

    let dependencies = recipe
        .dependencies
        .iter()
        .map(|p| {
            let path = recipe_dir.join(p);
            Ok(Dependency::new(InstallManifest::load(&path)?))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(BuildRequest {
        name: recipe.name,
        version: recipe.version,
        script,
        platforms,
        sources: recipe
            .sources
            .into_iter()
            .map(|s| BuildSource {
                url: s.url,
                sha256: s.sha256,
            })
            .collect(),
        products: recipe
            .products
            .into_iter()
            .map(|p| match p {
                RecipeProduct::Library { name } => Product::library(name),
                RecipeProduct::Executable { name } => Product::executable(name),
                RecipeProduct::File { path } => Product::file(path),
            })
            .collect(),
        dependencies,
    })
}

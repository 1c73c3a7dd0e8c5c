//! `crossforge audit`: run the auditor over an arbitrary prefix.

use anyhow::{anyhow, Result};
use clap::Args;
use std::path::PathBuf;

use crate::audit::audit_prefix;
use crate::config::Config;
use crate::platform::Platform;

#[derive(Args)]
pub struct AuditArgs {
    /// Install prefix to audit
    pub prefix: PathBuf,

    /// Target triplet the prefix was built for
    #[arg(long)]
    pub platform: String,

    /// Report findings without repairing anything
    #[arg(long)]
    pub no_fix: bool,

    /// Treat remaining findings as failure (exit nonzero)
    #[arg(long)]
    pub fatal: bool,
}

pub async fn run(args: AuditArgs) -> Result<()> {
    let config = Config::load()?;
    let platform = Platform::parse(&args.platform).map_err(|e| anyhow!(e))?;

    let mut audit_config = config.audit.clone();
    if args.no_fix {
        audit_config.autofix = false;
    }

    let report = audit_prefix(&args.prefix, platform, &audit_config)?;

    if report.findings.is_empty() {
        println!("audit clean: {}", args.prefix.display());
        return Ok(());
    }

    for finding in &report.findings {
        println!("{}", finding);
    }

    let fatal = args.fatal || audit_config.fatal;
    if report.passed(fatal) {
        Ok(())
    } else {
        Err(anyhow!(
            "{} findings outstanding",
            report.findings.iter().filter(|f| f.outstanding()).count()
        ))
    }
}
